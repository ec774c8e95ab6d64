use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    error::Error,
    link::{LinkEvent, LinkRole, PeerLink},
    rendezvous::RendezvousClient,
};

const HELP: &str = "commands: /users, /connect <nickname>, /leave, /quit; anything else is sent to the linked peer";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (link, mut events) = PeerLink::new(args.link_config());

    // Listen before registering so the advertised port is already reachable.
    let responder = link
        .listen(args.listen_addr())
        .await
        .with_context(|| format!("failed to listen for peers on {}", args.listen_addr()))?;

    let mut rendezvous = RendezvousClient::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    rendezvous
        .register(&args.nickname, responder.local_addr().port())
        .await
        .with_context(|| format!("failed to register as '{}'", args.nickname))?;
    write_stdout(&format!("*** registered as {}", args.nickname)).await?;
    show_users(&mut rendezvous).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&link, &mut rendezvous, &mut events, &mut stdin, &mut input).await?;

    link.close().await;
    rendezvous.shutdown().await;
    drop(responder);

    Ok(())
}

async fn run_client_loop(
    link: &PeerLink,
    rendezvous: &mut RendezvousClient,
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                match event {
                    Some(event) => render_link_event(event).await?,
                    None => break,
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, link, rendezvous).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    link: &PeerLink,
    rendezvous: &mut RendezvousClient,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    match text.split_once(' ').unwrap_or((text, "")) {
        ("/quit", _) => {
            write_stdout("*** leaving").await?;
            return Ok(false);
        }
        ("/help", _) => write_stdout(HELP).await?,
        ("/users", _) => show_users(rendezvous).await?,
        ("/leave", _) => link.close().await,
        ("/connect", nickname) if !nickname.trim().is_empty() => {
            let nickname = nickname.trim();
            match link.connect_to(rendezvous, nickname).await {
                Ok(record) => {
                    write_stdout(&format!(
                        "*** connected to {nickname} at {}:{}",
                        record.ip, record.port
                    ))
                    .await?
                }
                Err(error) => write_stderr(&format!("!!! {error}")).await?,
            }
        }
        ("/connect", _) => write_stderr("!!! usage: /connect <nickname>").await?,
        _ => {
            // Unframed: the peer sees whatever chunks the transport delivers.
            let mut line = text.to_string();
            line.push('\n');
            match link.send(line.as_bytes()).await {
                Ok(()) => {}
                Err(Error::NotConnected) => {
                    write_stderr("!!! no peer link; use /connect <nickname>").await?
                }
                Err(error) => write_stderr(&format!("!!! failed to send: {error}")).await?,
            }
        }
    }

    Ok(true)
}

async fn show_users(rendezvous: &mut RendezvousClient) -> Result<()> {
    match rendezvous.list_users().await {
        Ok(users) if users.is_empty() => write_stdout("*** nobody online").await?,
        Ok(users) => write_stdout(&format!("*** online: {}", users.join(", "))).await?,
        Err(error) => write_stderr(&format!("!!! {error}")).await?,
    }
    Ok(())
}

async fn render_link_event(event: LinkEvent) -> io::Result<()> {
    match event {
        // The initiator already reported the connection when the dial returned.
        LinkEvent::Established {
            role: LinkRole::Initiator,
            ..
        } => Ok(()),
        LinkEvent::Established { peer, .. } => {
            write_stdout(&format!("*** accepted peer link from {peer}")).await
        }
        LinkEvent::Message(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            write_stdout(&format!("<peer> {}", text.trim_end_matches(['\r', '\n']))).await
        }
        LinkEvent::Closed { .. } => write_stdout("*** peer link closed").await,
        LinkEvent::Rejected { peer } => {
            write_stdout(&format!("*** turned away {peer}: already linked")).await
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
