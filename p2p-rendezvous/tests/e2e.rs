use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A running copy of the binary with piped stdin and stdout.
struct Node {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Node {
    fn spawn(args: &[&str], log_filter: &str) -> Result<Self> {
        let mut child = Command::new(assert_cmd::cargo::cargo_bin!("p2p_rendezvous"))
            .args(args)
            .env("RUST_LOG", log_filter)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {args:?}"))?;
        let stdin = child.stdin.take().context("stdin not piped")?;
        let stdout = child.stdout.take().context("stdout not piped")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn join(server: &str, nickname: &str) -> Result<Self> {
        let mut node = Self::spawn(
            &[
                "client",
                "--nickname",
                nickname,
                "--port",
                "0",
                "--listen-ip",
                "127.0.0.1",
                "--server",
                server,
            ],
            "off",
        )?;
        assert_eq!(node.next_line().await?, format!("*** registered as {nickname}"));
        Ok(node)
    }

    async fn next_line(&mut self) -> Result<String> {
        timeout(READ_TIMEOUT, self.stdout.next_line())
            .await
            .context("timed out waiting for output")??
            .context("stdout closed")
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    // Keeps the pipe empty so the process never blocks on logging.
    fn drain_output(self) -> Child {
        let Self {
            child, mut stdout, ..
        } = self;
        tokio::spawn(async move { while let Ok(Some(_)) = stdout.next_line().await {} });
        child
    }
}

#[tokio::test]
async fn cli_peers_chat_directly_end_to_end() -> Result<()> {
    let mut server = Node::spawn(&["server", "--listen", "127.0.0.1:0"], "info")?;
    let banner = server.next_line().await?;
    let addr = banner
        .rsplit(' ')
        .next()
        .filter(|addr| addr.contains(':'))
        .with_context(|| format!("no address in server banner '{banner}'"))?
        .to_string();
    let mut server = server.drain_output();

    let mut alice = Node::join(&addr, "alice").await?;
    assert_eq!(alice.next_line().await?, "*** online: alice");
    let mut bob = Node::join(&addr, "bob").await?;
    assert_eq!(bob.next_line().await?, "*** online: alice, bob");

    bob.say("/connect alice").await?;
    let connected = bob.next_line().await?;
    assert!(
        connected.starts_with("*** connected to alice at 127.0.0.1:"),
        "unexpected: {connected}"
    );
    let accepted = alice.next_line().await?;
    assert!(
        accepted.starts_with("*** accepted peer link from 127.0.0.1:"),
        "unexpected: {accepted}"
    );

    bob.say("Hello from Bob").await?;
    assert_eq!(alice.next_line().await?, "<peer> Hello from Bob");
    alice.say("Hi Bob!").await?;
    assert_eq!(bob.next_line().await?, "<peer> Hi Bob!");

    alice.say("/leave").await?;
    assert_eq!(alice.next_line().await?, "*** peer link closed");
    assert_eq!(bob.next_line().await?, "*** peer link closed");

    for node in [&mut alice, &mut bob] {
        node.say("/quit").await?;
        assert_eq!(node.next_line().await?, "*** leaving");
        let status = node.child.wait().await?;
        assert!(status.success(), "client exited with {status}");
    }

    server.kill().await?;
    Ok(())
}
