//! Nickname rendezvous for direct peer-to-peer chat.
//!
//! Peers register a nickname and a listening port with a small rendezvous
//! server, look each other up, and then talk over a direct TCP link that the
//! server never sees. Each module focuses on one responsibility:
//!
//! - [`registry`] is the server's in-memory nickname to address map.
//! - [`protocol`] defines the colon-delimited line protocol and its
//!   async read/write helpers.
//! - [`session`] runs the per-connection state machine and its cleanup.
//! - [`server`] accepts TCP connections and spawns a session for each.
//! - [`rendezvous`] is the client side of the protocol.
//! - [`link`] manages the single direct link to another peer.
//! - [`client`] ties the above together into an interactive terminal client.
//! - [`cli`] parses the command line for server and client modes.
//! - [`error`] holds the error taxonomy shared by all of the above.

pub mod cli;
pub mod client;
pub mod error;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod session;

pub use error::{Error, Result};
