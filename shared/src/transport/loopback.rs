//! In-process transport: two FIFO queues behind one mutex.
//!
//! Used for singleplayer and tests. Messages are moved between threads as
//! values; nothing is serialized.

use super::{ClientId, ClientTransport, ServerTransport, TransportEvent};
use crate::protocol::Message;
use log::debug;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Queues {
    to_server: VecDeque<Message>,
    to_client: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One half of a linked loopback pair.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    shared: Arc<Mutex<Queues>>,
    side: Side,
}

/// Returns `(client, server)` halves of a new link.
pub fn create_pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
    let shared = Arc::new(Mutex::new(Queues::default()));
    let client = LoopbackEndpoint {
        shared: Arc::clone(&shared),
        side: Side::Client,
    };
    let server = LoopbackEndpoint {
        shared,
        side: Side::Server,
    };
    (client, server)
}

impl LoopbackEndpoint {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        // A panic while holding the lock cannot leave the queues half-updated.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues `message` for the other half. Returns false if the link is
    /// closed.
    pub fn send_value(&self, message: Message) -> bool {
        let mut queues = self.queues();
        if queues.closed {
            return false;
        }
        match self.side {
            Side::Client => queues.to_server.push_back(message),
            Side::Server => queues.to_client.push_back(message),
        }
        true
    }

    /// Pops the oldest message sent by the other half.
    pub fn recv(&self) -> Option<Message> {
        let mut queues = self.queues();
        match self.side {
            Side::Client => queues.to_client.pop_front(),
            Side::Server => queues.to_server.pop_front(),
        }
    }

    pub fn connected(&self) -> bool {
        !self.queues().closed
    }

    /// Closes the link for both halves. Messages already queued can still be
    /// received.
    pub fn close(&self) {
        self.queues().closed = true;
    }
}

impl ClientTransport for LoopbackEndpoint {
    fn send(&mut self, message: &Message) -> bool {
        self.send_value(message.clone())
    }

    fn try_recv(&mut self) -> Option<Message> {
        self.recv()
    }

    fn is_connected(&self) -> bool {
        self.connected()
    }

    fn disconnect(&mut self) {
        self.close();
    }
}

type PendingLinks = Arc<Mutex<Vec<LoopbackEndpoint>>>;

/// Hands out client endpoints linked to a [`LoopbackHost`]. Cheap to clone
/// and usable from any thread.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    pending: PendingLinks,
}

impl LoopbackConnector {
    /// Creates a new link; the host reports it as connected on its next
    /// poll.
    pub fn connect(&self) -> LoopbackEndpoint {
        let (client, server) = create_pair();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(server);
        client
    }
}

/// Server transport over any number of loopback links.
///
/// Each link produces exactly one `Connected` and one `Disconnected` event,
/// however many times either side closes it.
#[derive(Debug)]
pub struct LoopbackHost {
    pending: PendingLinks,
    clients: BTreeMap<ClientId, LoopbackEndpoint>,
    dropped: Vec<ClientId>,
    next_client_id: u32,
}

impl LoopbackHost {
    pub fn new() -> (LoopbackHost, LoopbackConnector) {
        let pending: PendingLinks = Arc::new(Mutex::new(Vec::new()));
        let host = LoopbackHost {
            pending: Arc::clone(&pending),
            clients: BTreeMap::new(),
            dropped: Vec::new(),
            next_client_id: 1,
        };
        (host, LoopbackConnector { pending })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl ServerTransport for LoopbackHost {
    fn poll(&mut self, _timeout: Duration) -> Vec<TransportEvent> {
        let mut events: Vec<TransportEvent> = self
            .dropped
            .drain(..)
            .map(TransportEvent::Disconnected)
            .collect();

        let accepted: Vec<LoopbackEndpoint> = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for endpoint in accepted {
            let id = ClientId(self.next_client_id);
            self.next_client_id += 1;
            debug!("Loopback client {} connected", id);
            self.clients.insert(id, endpoint);
            events.push(TransportEvent::Connected(id));
        }

        let mut closed = Vec::new();
        for (&id, endpoint) in &self.clients {
            while let Some(message) = endpoint.recv() {
                events.push(TransportEvent::Received(id, message));
            }
            if !endpoint.connected() {
                closed.push(id);
            }
        }
        for id in closed {
            self.clients.remove(&id);
            debug!("Loopback client {} disconnected", id);
            events.push(TransportEvent::Disconnected(id));
        }

        events
    }

    fn send(&mut self, client: ClientId, message: &Message) {
        if let Some(endpoint) = self.clients.get(&client) {
            endpoint.send_value(message.clone());
        }
    }

    fn disconnect(&mut self, client: ClientId) {
        if let Some(endpoint) = self.clients.remove(&client) {
            endpoint.close();
            self.dropped.push(client);
        }
    }
}
