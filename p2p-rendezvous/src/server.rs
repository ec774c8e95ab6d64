use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    registry::Registry,
    session::{self, ServerConfig},
};

pub struct RendezvousServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
}

impl RendezvousServer {
    /// Binds the listening socket with a fresh, empty registry.
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self::new(listener, Arc::new(Registry::new()), config))
    }

    pub fn new(listener: TcpListener, registry: Arc<Registry>, config: ServerConfig) -> Self {
        Self {
            listener,
            registry,
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves. Each connection gets its
    /// own task; sessions that are still open when the loop stops keep running
    /// until their clients disconnect.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RendezvousServer {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(online = registry.len(), "rendezvous server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: &Arc<ServerConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &Arc<ServerConfig>,
) {
    let registry = Arc::clone(registry);
    let config = Arc::clone(config);
    tokio::spawn(async move {
        info!(peer = %peer, "connection received");
        let (reader, writer) = stream.into_split();
        let reader = BufReader::new(reader);
        if let Err(err) = session::serve(reader, writer, peer, registry, &config).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}
