//! Direct peer-to-peer link, established after address resolution.
//!
//! A client holds at most one link. It is formed either by dialing a resolved
//! address (initiator) or by accepting on the registered port (responder);
//! both paths end in the same state: a background receive loop feeding
//! [`LinkEvent`]s into a channel, and a write half used by [`PeerLink::send`].
//!
//! Bytes travel unframed. Each successful read on the receiving side is
//! reported as one message, so rapid sends may arrive coalesced or split.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    registry::PeerRecord,
    rendezvous::RendezvousClient,
};

/// Size of a single receive; one read yields at most one message this long.
pub const RECV_BUFFER_SIZE: usize = 1024;
/// Written to an inbound connection that arrives while a link is active.
pub const BUSY_NOTICE: &[u8] = b"BUSY\n";

#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Give up dialing a peer after this long. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Established { peer: SocketAddr, role: LinkRole },
    Message(Vec<u8>),
    Closed { peer: SocketAddr },
    /// An inbound connection was turned away because a link was already active.
    Rejected { peer: SocketAddr },
}

struct ActiveLink {
    generation: u64,
    peer: SocketAddr,
    // Separate from the slot lock so a send stalled on a peer that stopped
    // reading never holds up close, accept or the receive loop.
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

/// Handle to this client's single peer link slot. Cheap to clone.
#[derive(Clone)]
pub struct PeerLink {
    slot: Arc<Mutex<Option<ActiveLink>>>,
    generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<LinkEvent>,
    config: Arc<LinkConfig>,
}

impl PeerLink {
    pub fn new(config: LinkConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        let link = Self {
            slot: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            events,
            config: Arc::new(config),
        };
        (link, inbox)
    }

    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.slot.lock().await.as_ref().map(|link| link.peer)
    }

    /// Binds `addr` and accepts inbound links in the background until the
    /// returned [`Responder`] is dropped.
    pub async fn listen(&self, addr: SocketAddr) -> Result<Responder> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("accepting peer links on {}", local_addr);

        let link = self.clone();
        let task = tokio::spawn(async move { link.accept_loop(listener).await });
        Ok(Responder { local_addr, task })
    }

    /// Resolves `nickname` through the rendezvous server and dials it.
    pub async fn connect_to(
        &self,
        rendezvous: &mut RendezvousClient,
        nickname: &str,
    ) -> Result<PeerRecord> {
        let record = rendezvous.resolve(nickname).await?;
        self.connect(SocketAddr::new(record.ip, record.port)).await?;
        Ok(record)
    }

    /// Dials `addr` directly and adopts the connection as the active link.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        if self.is_active().await {
            return Err(Error::LinkAlreadyActive);
        }

        let stream = match self.config.connect_timeout {
            Some(limit) => match timeout(limit, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            },
            None => TcpStream::connect(addr).await,
        }
        .map_err(|source| Error::PeerUnreachable { addr, source })?;

        // An inbound link may have won the slot while we were dialing.
        match self.adopt(stream, addr, LinkRole::Initiator).await {
            Ok(()) => Ok(()),
            Err(_stream) => Err(Error::LinkAlreadyActive),
        }
    }

    /// Writes `bytes` to the active link as-is.
    ///
    /// Returns `NotConnected` if the link goes away while the write is still
    /// pending.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let (writer, closed) = {
            let slot = self.slot.lock().await;
            let link = slot.as_ref().ok_or(Error::NotConnected)?;
            (Arc::clone(&link.writer), link.closed.subscribe())
        };

        select! {
            result = write_chunk(&writer, bytes) => result,
            _ = link_closed(closed) => Err(Error::NotConnected),
        }
    }

    /// Closes the active link, if any. The remote side observes end-of-stream.
    pub async fn close(&self) {
        let Some(link) = self.slot.lock().await.take() else {
            return;
        };
        link.receiver.abort();
        link.closed.send_replace(true);
        if let Err(error) = link.writer.lock().await.shutdown().await {
            debug!(?error, "failed to shutdown peer link cleanly");
        }
        info!(peer = %link.peer, "peer link closed locally");
        self.emit(LinkEvent::Closed { peer: link.peer });
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(stream) = self.adopt(stream, peer, LinkRole::Responder).await {
                        reject(stream, peer).await;
                        self.emit(LinkEvent::Rejected { peer });
                    }
                }
                Err(err) => warn!(error = ?err, "failed to accept peer connection"),
            }
        }
    }

    /// Installs `stream` as the active link, or hands it back if one exists.
    async fn adopt(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        role: LinkRole,
    ) -> std::result::Result<(), TcpStream> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(stream);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = stream.into_split();
        self.emit(LinkEvent::Established { peer, role });
        let receiver = tokio::spawn(self.clone().receive_loop(reader, generation, peer));
        *slot = Some(ActiveLink {
            generation,
            peer,
            writer: Arc::new(Mutex::new(writer)),
            closed: watch::Sender::new(false),
            receiver,
        });

        info!(peer = %peer, ?role, "peer link established");
        Ok(())
    }

    async fn receive_loop(self, mut reader: OwnedReadHalf, generation: u64, peer: SocketAddr) {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => self.emit(LinkEvent::Message(buffer[..n].to_vec())),
                Err(err) => {
                    debug!(peer = %peer, error = %err, "peer link read failed");
                    break;
                }
            }
        }
        self.finish(generation).await;
    }

    // Clears the slot only if it still holds the link this loop was serving.
    async fn finish(&self, generation: u64) {
        let finished = self
            .slot
            .lock()
            .await
            .take_if(|link| link.generation == generation);
        if let Some(link) = finished {
            link.closed.send_replace(true);
            info!(peer = %link.peer, "peer disconnected");
            self.emit(LinkEvent::Closed { peer: link.peer });
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("link event receiver dropped");
        }
    }
}

async fn reject(mut stream: TcpStream, peer: SocketAddr) {
    info!(peer = %peer, "rejecting peer connection: link already active");
    if let Err(error) = stream.write_all(BUSY_NOTICE).await {
        debug!(?error, "failed to send busy notice");
    }
    if let Err(error) = stream.shutdown().await {
        debug!(?error, "failed to shutdown rejected connection cleanly");
    }
}

async fn write_chunk(writer: &Mutex<OwnedWriteHalf>, bytes: &[u8]) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

// Resolves once the link this receiver was subscribed to has been torn down.
async fn link_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

/// Background accept loop for inbound links. Stops when dropped.
pub struct Responder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Responder {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
