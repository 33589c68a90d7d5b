//! Server side of the UDP transport: peer addresses mapped to client ids.

use super::net::{Endpoint, PeerStats, RawEvent};
use super::{ClientId, ServerTransport, TransportError, TransportEvent};
use crate::codec;
use crate::protocol::Message;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Bidirectional map between peer addresses and [`ClientId`]s.
///
/// Ids come from a counter starting at 1 and are never reused, so a stale id
/// held by game code can never address a newer peer.
#[derive(Debug)]
pub struct ConnectionManager {
    by_peer: HashMap<SocketAddr, ClientId>,
    by_client: HashMap<ClientId, SocketAddr>,
    next_client_id: u32,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            by_peer: HashMap::new(),
            by_client: HashMap::new(),
            next_client_id: 1,
        }
    }

    /// Allocates an id for a newly connected peer. A peer that is already
    /// mapped keeps its id.
    pub fn on_connect(&mut self, peer: SocketAddr) -> ClientId {
        if let Some(&id) = self.by_peer.get(&peer) {
            return id;
        }
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.by_peer.insert(peer, id);
        self.by_client.insert(id, peer);
        id
    }

    /// Removes the mapping of a departed peer and returns its id.
    pub fn on_disconnect(&mut self, peer: SocketAddr) -> Option<ClientId> {
        let id = self.by_peer.remove(&peer)?;
        self.by_client.remove(&id);
        Some(id)
    }

    /// [`ClientId::INVALID`] for unknown peers.
    pub fn find_client_id(&self, peer: SocketAddr) -> ClientId {
        self.by_peer.get(&peer).copied().unwrap_or(ClientId::INVALID)
    }

    pub fn find_peer(&self, client: ClientId) -> Option<SocketAddr> {
        self.by_client.get(&client).copied()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}

/// [`ServerTransport`] over a listening [`Endpoint`].
pub struct NetServerTransport {
    endpoint: Endpoint,
    connections: ConnectionManager,
}

impl NetServerTransport {
    /// Binds `host:port` and accepts up to `max_clients` peers.
    pub fn bind(host: &str, port: u16, max_clients: usize) -> Result<Self, TransportError> {
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let endpoint = Endpoint::bind(&addr, max_clients.max(1))?;
        info!("Listening on {}", endpoint.local_addr()?);
        Ok(Self {
            endpoint,
            connections: ConnectionManager::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint.local_addr()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }
}

impl ServerTransport for NetServerTransport {
    fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        self.endpoint.service(timeout);

        let mut events = Vec::new();
        for raw in self.endpoint.take_events() {
            match raw {
                RawEvent::Connect(peer) => {
                    let id = self.connections.on_connect(peer);
                    info!("Client {} connected from {}", id, peer);
                    events.push(TransportEvent::Connected(id));
                }
                RawEvent::Disconnect(peer) => {
                    if let Some(id) = self.connections.on_disconnect(peer) {
                        info!("Client {} disconnected", id);
                        events.push(TransportEvent::Disconnected(id));
                    }
                }
                RawEvent::Receive(peer, bytes) => {
                    let id = self.connections.find_client_id(peer);
                    if !id.is_valid() {
                        continue;
                    }
                    match codec::decode(&bytes) {
                        Ok(message) => events.push(TransportEvent::Received(id, message)),
                        Err(e) => warn!("Dropping message from client {}: {}", id, e),
                    }
                }
            }
        }
        events
    }

    fn send(&mut self, client: ClientId, message: &Message) {
        let Some(peer) = self.connections.find_peer(client) else {
            return;
        };
        match codec::encode(message) {
            Ok(bytes) => {
                if let Err(e) = self.endpoint.send(peer, message.channel(), bytes) {
                    debug!("Not sending {} to client {}: {}", message.kind(), client, e);
                }
            }
            Err(e) => error!("{}", e),
        }
    }

    fn disconnect(&mut self, client: ClientId) {
        if let Some(peer) = self.connections.find_peer(client) {
            self.endpoint.disconnect(peer);
        }
    }

    fn flush(&mut self) {
        self.endpoint.flush();
    }

    fn peer_stats(&self, client: ClientId) -> Option<PeerStats> {
        self.connections
            .find_peer(client)
            .and_then(|peer| self.endpoint.peer_stats(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Channel;
    use crate::transport::net::PeerState;
    use std::time::Instant;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut manager = ConnectionManager::new();
        assert_eq!(manager.on_connect(addr(1)), ClientId(1));
        assert_eq!(manager.on_connect(addr(2)), ClientId(2));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_unknown_peer_is_invalid() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.find_client_id(addr(5)), ClientId::INVALID);
        assert!(!ClientId::INVALID.is_valid());
    }

    #[test]
    fn test_disconnect_removes_both_directions() {
        let mut manager = ConnectionManager::new();
        let id = manager.on_connect(addr(1));
        assert_eq!(manager.on_disconnect(addr(1)), Some(id));
        assert_eq!(manager.find_client_id(addr(1)), ClientId::INVALID);
        assert_eq!(manager.find_peer(id), None);
        assert_eq!(manager.on_disconnect(addr(1)), None);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = ConnectionManager::new();
        manager.on_connect(addr(1));
        manager.on_disconnect(addr(1));
        assert_eq!(manager.on_connect(addr(1)), ClientId(2));
    }

    #[test]
    fn test_reconnect_of_mapped_peer_keeps_id() {
        let mut manager = ConnectionManager::new();
        let first = manager.on_connect(addr(1));
        assert_eq!(manager.on_connect(addr(1)), first);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_undecodable_payload_is_dropped() {
        let mut server = NetServerTransport::bind("127.0.0.1", 0, 4).unwrap();
        let server_addr = server.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(3);
            let mut events = Vec::new();
            while Instant::now() < deadline
                && !events
                    .iter()
                    .any(|e| matches!(e, TransportEvent::Received(_, Message::JoinMatch)))
            {
                events.extend(server.poll(Duration::from_millis(10)));
            }
            (events, server.connections().len())
        });

        let mut client = Endpoint::bind("127.0.0.1:0", 0).unwrap();
        client.connect(server_addr, Duration::from_secs(2)).unwrap();
        client
            .send(server_addr, Channel::Reliable, vec![0xFF; 8])
            .unwrap();
        let valid = codec::encode(&Message::JoinMatch).unwrap();
        client.send(server_addr, Channel::Reliable, valid).unwrap();
        while !handle.is_finished() {
            client.service(Duration::from_millis(10));
        }

        let (events, connections) = handle.join().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TransportEvent::Connected(ClientId(1))));
        assert!(matches!(
            events[1],
            TransportEvent::Received(ClientId(1), Message::JoinMatch)
        ));
        assert_eq!(connections, 1);
        assert_eq!(client.peer_state(server_addr), Some(PeerState::Connected));
    }
}
