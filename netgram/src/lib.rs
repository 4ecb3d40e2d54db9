//! Tagged-message UDP client/server toolkit.
//!
//! A datagram is a six-byte header (`senderId: i16`, `tag: u16`, two
//! reserved bytes) followed by an application-defined payload, described
//! in [`buffer`] and [`message`]. [`client::Client`] and [`server::Server`]
//! each run their own receive loop on a background thread; user-tagged
//! traffic not handled by the protocol's reserved tags (see [`tag`]) is
//! staged onto a [`dispatcher::Dispatcher`] for the embedder to drain on
//! its own schedule.
//!
//! Reliable ordered delivery, flow control, encryption, NAT traversal,
//! fragmentation, and IPv6-specific handling are explicitly out of scope;
//! every datagram is self-contained.

pub mod buffer;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod roster;
pub mod serializable;
pub mod server;
mod socket;
pub mod tag;

pub use buffer::{MessageBuffer, Mode, Reader, Writer};
pub use client::{Client, ClientConfig, ClientEvent, ConnectionState};
pub use dispatcher::{CallbackId, Dispatcher};
pub use error::{CodecError, ProtocolError};
pub use heartbeat::{Heartbeat, Phase};
pub use message::Message;
pub use roster::{ClientRecord, Roster};
pub use serializable::{ClientConnectionInfo, ClientMessageTagRegistration, Serializable};
pub use server::{Server, ServerConfig, ServerEvent};
