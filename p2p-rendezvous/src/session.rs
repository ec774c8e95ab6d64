//! Per-connection state machine on the rendezvous server.
//!
//! A session starts `Connected`, becomes `Registered` after a successful
//! `REGISTER`, and ends `Closed`. Closing releases the session's nickname from
//! the registry; it runs from `Drop` as well, so it happens exactly once no
//! matter how the connection loop ended.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    protocol::{Reply, Request, read_command, write_line},
    registry::{PeerRecord, Registry, SessionId},
};

/// Knobs for the rendezvous server's sessions.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Close a session that sends nothing for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered { nickname: String },
    Closed,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    registry: Arc<Registry>,
    state: SessionState,
}

impl Session {
    pub fn new(registry: Arc<Registry>, peer: SocketAddr) -> Self {
        Self {
            id: registry.next_session_id(),
            peer,
            registry,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn nickname(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered { nickname } => Some(nickname),
            _ => None,
        }
    }

    /// Parses one command line and applies it, producing the reply to send.
    pub fn respond(&mut self, line: &str) -> Reply {
        let outcome = line.parse::<Request>().and_then(|request| self.execute(request));
        match outcome {
            Ok(reply) => reply,
            Err(error) => self.refuse(&error),
        }
    }

    /// Builds the error reply for a command that could not be carried out.
    /// Session state is left untouched.
    pub fn refuse(&self, error: &Error) -> Reply {
        debug!(peer = %self.peer, %error, "command failed");
        Reply::from_error(error).unwrap_or_else(|| Reply::Malformed(error.to_string()))
    }

    fn execute(&mut self, request: Request) -> Result<Reply> {
        match request {
            Request::Register { nickname, port } => {
                // The advertised address is always the one we see the client
                // connecting from; the payload only carries the port.
                let record = PeerRecord::new(nickname.clone(), self.peer.ip().to_canonical(), port);
                let displaced = self.registry.claim(self.id, self.nickname(), record);
                if let Some(previous) = displaced {
                    debug!(nickname, previous_ip = %previous.ip, "nickname taken over");
                }
                info!(peer = %self.peer, nickname, port, "peer registered");
                self.state = SessionState::Registered { nickname };
                Ok(Reply::RegisterOk)
            }
            Request::GetUsers => Ok(Reply::Users(self.registry.list())),
            Request::GetAddr { nickname } => self.registry.lookup(&nickname).map(Reply::Addr),
        }
    }

    /// Releases the claimed nickname, if any. Idempotent.
    pub fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered { nickname } = state {
            if self.registry.release(self.id, &nickname) {
                info!(peer = %self.peer, nickname, "peer deregistered");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs the request/reply loop for one accepted connection until the client
/// disconnects, goes idle, or the transport fails.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    registry: Arc<Registry>,
    config: &ServerConfig,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new(registry, peer);
    debug!(peer = %peer, session = session.id(), "session opened");

    while let Some(command) = next_command(&mut reader, peer, config.idle_timeout).await? {
        let reply = match command {
            Ok(line) => session.respond(&line),
            Err(error) => session.refuse(&error),
        };
        if let Err(err) = write_line(&mut writer, &reply).await {
            if is_disconnect(&err) {
                break;
            }
            return Err(Error::Io(err));
        }
    }

    session.close();
    debug!(peer = %peer, "session closed");
    Ok(())
}

async fn next_command<R>(
    reader: &mut R,
    peer: SocketAddr,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let result = match idle_timeout {
        Some(limit) => match timeout(limit, read_command(reader)).await {
            Ok(result) => result,
            Err(_) => {
                info!(peer = %peer, ?limit, "closing idle session");
                return Ok(None);
            }
        },
        None => read_command(reader).await,
    };

    match result {
        Ok(line) => Ok(line),
        Err(err) if is_disconnect(&err) => {
            debug!(peer = %peer, error = %err, "connection reset");
            Ok(None)
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
