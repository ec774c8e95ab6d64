use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{link::LinkConfig, session::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rendezvous server that maps nicknames to peer addresses.
    Server(ServerArgs),
    /// Register with a rendezvous server and chat with peers directly.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:2024")]
    pub listen: SocketAddr,

    /// Close sessions that stay silent for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname other peers use to find you.
    #[arg(long)]
    pub nickname: String,

    /// Port to accept peer links on. 0 picks a free port and registers it.
    #[arg(long)]
    pub port: u16,

    /// Address of the rendezvous server.
    #[arg(long, default_value = "127.0.0.1:2024")]
    pub server: SocketAddr,

    /// Local interface the peer listener binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_ip: IpAddr,

    /// Give up dialing a peer after this many seconds.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

impl ClientArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Some(Duration::from_secs(self.connect_timeout_secs)),
        }
    }
}
