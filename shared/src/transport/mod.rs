//! Message transports.
//!
//! The server only talks to [`ServerTransport`] and clients only to
//! [`ClientTransport`], so the in-process [`loopback`] pair and the UDP
//! based [`net`] transport are interchangeable. Connection changes and
//! received messages are reported as [`TransportEvent`]s from `poll`, on the
//! polling thread.

pub mod connection;
pub mod loopback;
pub mod net;

use crate::codec::CodecError;
use crate::protocol::Message;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use connection::{ConnectionManager, NetServerTransport};
pub use loopback::{create_pair, LoopbackConnector, LoopbackEndpoint, LoopbackHost};
pub use net::{Endpoint, NetClient, PeerState, PeerStats};

/// Transport-level identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Returned by lookups that find no client. Never assigned.
    pub const INVALID: ClientId = ClientId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Connected(ClientId),
    /// The client is gone; its id is no longer resolvable.
    Disconnected(ClientId),
    Received(ClientId, Message),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start network runtime: {0}")]
    Init(#[source] std::io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {0} timed out")]
    Timeout(SocketAddr),
    #[error("connection to {0} was refused")]
    Refused(SocketAddr),
    #[error("not connected")]
    NotConnected,
    #[error("payload of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Server side of a transport: many clients, one polling thread.
pub trait ServerTransport: Send {
    /// Processes everything currently available, waiting at most `timeout`
    /// for the first event.
    fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    /// Queues a message for one client. Unknown clients are ignored.
    fn send(&mut self, client: ClientId, message: &Message);

    /// Drops a client. The matching [`TransportEvent::Disconnected`] is
    /// reported by the next `poll`.
    fn disconnect(&mut self, client: ClientId);

    /// Pushes queued outbound messages onto the wire.
    fn flush(&mut self) {}

    /// Round trip and loss figures, where the transport tracks them.
    fn peer_stats(&self, _client: ClientId) -> Option<PeerStats> {
        None
    }
}

/// Client side of a transport: a single link to the server.
pub trait ClientTransport {
    /// Queues a message. Returns false once the link is closed.
    fn send(&mut self, message: &Message) -> bool;

    /// Next received message, without blocking.
    fn try_recv(&mut self) -> Option<Message>;

    /// Services the link for up to `timeout`. Queue-backed links have
    /// nothing to do.
    fn poll(&mut self, _timeout: Duration) {}

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}
