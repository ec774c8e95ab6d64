//! Client side of the rendezvous protocol: one request, one reply, over a
//! single long-lived connection.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    protocol::{Reply, Request, read_reply, write_line},
    registry::PeerRecord,
};

pub struct RendezvousClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    server: SocketAddr,
}

impl RendezvousClient {
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server).await?;
        info!("connected to rendezvous server {}", server);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            server,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Announces `nickname` as reachable on `port` at whatever address the
    /// server sees this connection coming from.
    pub async fn register(&mut self, nickname: &str, port: u16) -> Result<()> {
        let request = Request::Register {
            nickname: nickname.to_string(),
            port,
        };
        match self.request(&request).await? {
            Reply::RegisterOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_users(&mut self) -> Result<Vec<String>> {
        match self.request(&Request::GetUsers).await? {
            Reply::Users(nicknames) => Ok(nicknames),
            other => Err(unexpected(other)),
        }
    }

    /// Resolves `nickname` to its registered address.
    pub async fn resolve(&mut self, nickname: &str) -> Result<PeerRecord> {
        let request = Request::GetAddr {
            nickname: nickname.to_string(),
        };
        match self.request(&request).await? {
            Reply::Addr(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown rendezvous connection cleanly");
        }
    }

    async fn request(&mut self, request: &Request) -> Result<Reply> {
        debug!(%request, "sending request");
        write_line(&mut self.writer, request).await?;
        read_reply(&mut self.reader).await?.into_result()
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(reply.to_string())
}
