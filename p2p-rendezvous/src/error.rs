use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures surfaced by the rendezvous server, the rendezvous client and the
/// peer link.
#[derive(Debug, Error)]
pub enum Error {
    /// The server could not bind its listening socket. Fatal.
    #[error("failed to bind rendezvous listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("user '{0}' not found")]
    PeerNotFound(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// The direct connection to a resolved peer address failed or timed out.
    #[error("peer at {addr} is unreachable")]
    PeerUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("a peer link is already active")]
    LinkAlreadyActive,

    #[error("no peer link is active")]
    NotConnected,

    /// The other side sent something that is not a valid reply.
    #[error("unexpected reply from rendezvous server: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
