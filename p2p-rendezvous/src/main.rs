use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use p2p_rendezvous::{
    cli::{Cli, Command},
    client,
    server::RendezvousServer,
};

fn init_tracing() {
    use std::io::IsTerminal;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = match RendezvousServer::bind(args.listen, args.config()).await {
                Ok(server) => server,
                Err(err) => {
                    error!("cannot serve without a listening socket: {err:?}");
                    return Err(err.into());
                }
            };
            let addr = server.local_addr()?;
            info!("rendezvous server listening on {}", addr);
            server.run_until_ctrl_c().await?;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
