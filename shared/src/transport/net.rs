//! UDP transport with a reliable-ordered and an unreliable channel.
//!
//! Each [`Endpoint`] owns a UDP socket and a single-threaded tokio runtime.
//! The runtime is only driven inside [`Endpoint::service`] and the blocking
//! connect/disconnect helpers, so the public API is synchronous and all
//! peer state lives on the calling thread.
//!
//! Wire format: every datagram is one bincode-encoded [`Datagram`]. Reliable
//! payloads carry a per-peer sequence number, are acknowledged one by one and
//! resent until acknowledged; the receiver delivers them in sequence order
//! through a reorder buffer. Unreliable payloads are delivered as they
//! arrive.

use super::{ClientTransport, TransportError};
use crate::codec;
use crate::protocol::{Channel, Message};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;

/// Largest application payload carried by one datagram.
pub const MAX_PAYLOAD: usize = 1200;
const RECV_BUFFER: usize = 2048;

/// Floor for every socket wait so the reactor gets a chance to run.
const MIN_WAIT: Duration = Duration::from_millis(1);
const MIN_RESEND: Duration = Duration::from_millis(100);
const MAX_SEND_ATTEMPTS: u32 = 20;
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_RETRY: Duration = Duration::from_millis(250);
const DISCONNECT_RETRY: Duration = Duration::from_millis(50);
/// How long a disconnect waits for the peer's acknowledgement.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(200);
const MAX_REORDER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Datagram {
    Connect { nonce: u64 },
    Accept { nonce: u64 },
    Refuse,
    Disconnect,
    DisconnectAck,
    Reliable { seq: u64, payload: Vec<u8> },
    Ack { seq: u64 },
    Unreliable { payload: Vec<u8> },
    Ping { sent_ms: u64 },
    Pong { sent_ms: u64 },
}

/// Lifecycle of a peer. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerStats {
    /// Smoothed round trip time in milliseconds.
    pub rtt_ms: f32,
    pub packets_sent: u64,
    pub packets_resent: u64,
    /// Fraction of reliable sends that needed a resend.
    pub packet_loss: f32,
}

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
}

#[derive(Debug)]
struct Peer {
    state: PeerState,
    nonce: u64,
    next_send_seq: u64,
    next_recv_seq: u64,
    in_flight: BTreeMap<u64, InFlight>,
    reorder: BTreeMap<u64, Vec<u8>>,
    last_heard: Instant,
    last_ping: Instant,
    /// Last connect or disconnect request sent while in a transitional state.
    last_request: Instant,
    disconnect_started: Option<Instant>,
    stats: PeerStats,
}

impl Peer {
    fn new(state: PeerState, nonce: u64, now: Instant) -> Self {
        Self {
            state,
            nonce,
            next_send_seq: 0,
            next_recv_seq: 0,
            in_flight: BTreeMap::new(),
            reorder: BTreeMap::new(),
            last_heard: now,
            last_ping: now,
            last_request: now,
            disconnect_started: None,
            stats: PeerStats::default(),
        }
    }

    fn advance(&mut self, state: PeerState) {
        debug_assert!(state >= self.state, "{:?} -> {:?}", self.state, state);
        if state > self.state {
            self.state = state;
        }
    }

    fn resend_timeout(&self) -> Duration {
        Duration::from_micros((self.stats.rtt_ms * 2000.0) as u64).max(MIN_RESEND)
    }

    fn record_rtt(&mut self, sample_ms: f32) {
        self.stats.rtt_ms = if self.stats.rtt_ms == 0.0 {
            sample_ms
        } else {
            self.stats.rtt_ms * 0.875 + sample_ms * 0.125
        };
    }

    fn update_loss(&mut self) {
        if self.stats.packets_sent > 0 {
            self.stats.packet_loss =
                self.stats.packets_resent as f32 / self.stats.packets_sent as f32;
        }
    }
}

/// Low-level happenings reported by [`Endpoint::take_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Connect(SocketAddr),
    /// Emitted once for every peer that reached `Connected`, whichever side
    /// ended the session.
    Disconnect(SocketAddr),
    Receive(SocketAddr, Vec<u8>),
}

pub struct Endpoint {
    runtime: Runtime,
    socket: UdpSocket,
    peers: HashMap<SocketAddr, Peer>,
    /// Maximum number of peers accepted from incoming connects; 0 refuses
    /// them all.
    max_incoming: usize,
    outbox: Vec<(SocketAddr, Vec<u8>)>,
    events: VecDeque<RawEvent>,
    epoch: Instant,
}

impl Endpoint {
    /// Binds a socket that accepts up to `max_incoming` peers.
    pub fn bind(addr: &str, max_incoming: usize) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Init)?;
        let socket = runtime
            .block_on(UdpSocket::bind(addr))
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            runtime,
            socket,
            peers: HashMap::new(),
            max_incoming,
            outbox: Vec::new(),
            events: VecDeque::new(),
            epoch: Instant::now(),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Handshake state of `addr`, or `None` for an unknown peer.
    pub fn peer_state(&self, addr: SocketAddr) -> Option<PeerState> {
        self.peers.get(&addr).map(|peer| peer.state)
    }

    /// Round trip and loss figures for `addr`.
    pub fn peer_stats(&self, addr: SocketAddr) -> Option<PeerStats> {
        self.peers.get(&addr).map(|peer| peer.stats)
    }

    /// Peers in any state, including ones still connecting.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn queue(&mut self, addr: SocketAddr, datagram: &Datagram) {
        match bincode::serialize(datagram) {
            Ok(bytes) => self.outbox.push((addr, bytes)),
            Err(e) => error!("Failed to encode datagram for {}: {}", addr, e),
        }
    }

    /// Sends every queued datagram. Socket errors are logged; a peer that
    /// stays unreachable is dropped by the resend budget.
    pub fn flush(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let outbox = std::mem::take(&mut self.outbox);
        let socket = &self.socket;
        self.runtime.block_on(async move {
            for (addr, bytes) in outbox {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    debug!("Send to {} failed: {}", addr, e);
                }
            }
        });
    }

    /// Waits up to `timeout` for a datagram, then drains whatever else is
    /// already buffered.
    fn receive(&mut self, timeout: Duration) -> Vec<(SocketAddr, Vec<u8>)> {
        let socket = &self.socket;
        let wait = timeout.max(MIN_WAIT);
        self.runtime.block_on(async move {
            let mut datagrams = Vec::new();
            let mut buf = [0u8; RECV_BUFFER];

            match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, addr))) => datagrams.push((addr, buf[..len].to_vec())),
                Ok(Err(e)) => {
                    debug!("Receive failed: {}", e);
                    return datagrams;
                }
                Err(_) => return datagrams,
            }

            loop {
                match socket.try_recv_from(&mut buf) {
                    Ok((len, addr)) => datagrams.push((addr, buf[..len].to_vec())),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("Receive failed: {}", e);
                        break;
                    }
                }
            }
            datagrams
        })
    }

    /// Receives for up to `timeout`, runs timers and flushes. Results are
    /// collected with [`Endpoint::take_events`].
    pub fn service(&mut self, timeout: Duration) {
        let wait = if self.events.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        for (addr, bytes) in self.receive(wait) {
            self.handle_datagram(addr, &bytes);
        }
        self.maintain(Instant::now());
        self.flush();
    }

    /// Drains connect, disconnect and receive events in arrival order.
    pub fn take_events(&mut self) -> Vec<RawEvent> {
        self.events.drain(..).collect()
    }

    fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8]) {
        let datagram: Datagram = match bincode::deserialize(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", addr, e);
                return;
            }
        };

        let now = Instant::now();
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_heard = now;
        }

        match datagram {
            Datagram::Connect { nonce } => self.handle_connect(addr, nonce, now),
            Datagram::Accept { nonce } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if peer.state == PeerState::Connecting && peer.nonce == nonce {
                        peer.advance(PeerState::Connected);
                        self.events.push_back(RawEvent::Connect(addr));
                    }
                }
            }
            Datagram::Refuse => {
                if self.peer_state(addr) == Some(PeerState::Connecting) {
                    self.remove_peer(addr);
                }
            }
            Datagram::Disconnect => {
                self.queue(addr, &Datagram::DisconnectAck);
                if self.peers.contains_key(&addr) {
                    debug!("Peer {} requested disconnect", addr);
                    self.remove_peer(addr);
                }
            }
            Datagram::DisconnectAck => {
                if self.peer_state(addr) == Some(PeerState::Disconnecting) {
                    self.remove_peer(addr);
                }
            }
            Datagram::Reliable { seq, payload } => self.handle_reliable(addr, seq, payload),
            Datagram::Ack { seq } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if let Some(packet) = peer.in_flight.remove(&seq) {
                        // Only unambiguous samples feed the RTT estimate.
                        if packet.attempts == 1 {
                            peer.record_rtt(packet.sent_at.elapsed().as_secs_f32() * 1000.0);
                        }
                    }
                }
            }
            Datagram::Unreliable { payload } => {
                if self.peer_state(addr) == Some(PeerState::Connected) {
                    self.events.push_back(RawEvent::Receive(addr, payload));
                }
            }
            Datagram::Ping { sent_ms } => {
                if self.peers.contains_key(&addr) {
                    self.queue(addr, &Datagram::Pong { sent_ms });
                }
            }
            Datagram::Pong { sent_ms } => {
                let sample = self.now_ms().saturating_sub(sent_ms) as f32;
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.record_rtt(sample);
                }
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, nonce: u64, now: Instant) {
        if let Some(peer) = self.peers.get(&addr) {
            // Our accept was lost; repeat it for the same session.
            if peer.state == PeerState::Connected && peer.nonce == nonce {
                self.queue(addr, &Datagram::Accept { nonce });
            }
            return;
        }

        if self.max_incoming == 0 {
            return;
        }
        if self.peers.len() >= self.max_incoming {
            warn!("Refusing {}: server full", addr);
            self.queue(addr, &Datagram::Refuse);
            return;
        }

        self.peers
            .insert(addr, Peer::new(PeerState::Connected, nonce, now));
        self.queue(addr, &Datagram::Accept { nonce });
        self.events.push_back(RawEvent::Connect(addr));
    }

    fn handle_reliable(&mut self, addr: SocketAddr, seq: u64, payload: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if peer.state != PeerState::Connected {
            return;
        }

        let mut delivered = Vec::new();
        if seq == peer.next_recv_seq {
            delivered.push(payload);
            peer.next_recv_seq += 1;
            while let Some(next) = peer.reorder.remove(&peer.next_recv_seq) {
                delivered.push(next);
                peer.next_recv_seq += 1;
            }
        } else if seq > peer.next_recv_seq {
            if peer.reorder.len() >= MAX_REORDER {
                // Not acknowledged, so the sender will try again later.
                return;
            }
            peer.reorder.entry(seq).or_insert(payload);
        }
        // Duplicates of delivered packets are acknowledged again.

        self.queue(addr, &Datagram::Ack { seq });
        self.events
            .extend(delivered.into_iter().map(|bytes| RawEvent::Receive(addr, bytes)));
    }

    fn maintain(&mut self, now: Instant) {
        let now_ms = self.now_ms();
        let mut outgoing = Vec::new();
        let mut dropped = Vec::new();

        for (&addr, peer) in self.peers.iter_mut() {
            match peer.state {
                PeerState::Connecting => {
                    if now.duration_since(peer.last_request) >= CONNECT_RETRY {
                        peer.last_request = now;
                        outgoing.push((addr, Datagram::Connect { nonce: peer.nonce }));
                    }
                }
                PeerState::Connected => {
                    if now.duration_since(peer.last_heard) > PEER_TIMEOUT {
                        warn!("Peer {} timed out", addr);
                        dropped.push(addr);
                        continue;
                    }

                    let timeout = peer.resend_timeout();
                    let mut exhausted = false;
                    for (&seq, packet) in peer.in_flight.iter_mut() {
                        if now.duration_since(packet.sent_at) < timeout {
                            continue;
                        }
                        if packet.attempts >= MAX_SEND_ATTEMPTS {
                            exhausted = true;
                            break;
                        }
                        packet.attempts += 1;
                        packet.sent_at = now;
                        peer.stats.packets_resent += 1;
                        outgoing.push((
                            addr,
                            Datagram::Reliable {
                                seq,
                                payload: packet.payload.clone(),
                            },
                        ));
                    }
                    peer.update_loss();
                    if exhausted {
                        warn!("Peer {} stopped acknowledging, dropping", addr);
                        dropped.push(addr);
                        continue;
                    }

                    if now.duration_since(peer.last_ping) >= PING_INTERVAL {
                        peer.last_ping = now;
                        outgoing.push((addr, Datagram::Ping { sent_ms: now_ms }));
                    }
                }
                PeerState::Disconnecting => {
                    let started = peer.disconnect_started.unwrap_or(now);
                    if now.duration_since(started) >= DISCONNECT_GRACE {
                        dropped.push(addr);
                    } else if now.duration_since(peer.last_request) >= DISCONNECT_RETRY {
                        peer.last_request = now;
                        outgoing.push((addr, Datagram::Disconnect));
                    }
                }
                PeerState::Disconnected => dropped.push(addr),
            }
        }

        for (addr, datagram) in outgoing {
            self.queue(addr, &datagram);
        }
        for addr in dropped {
            self.remove_peer(addr);
        }
    }

    /// Forgets a peer and reports the disconnect if it was ever connected.
    fn remove_peer(&mut self, addr: SocketAddr) {
        if let Some(mut peer) = self.peers.remove(&addr) {
            let was_connected = peer.state >= PeerState::Connected;
            peer.advance(PeerState::Disconnected);
            if was_connected {
                self.events.push_back(RawEvent::Disconnect(addr));
            }
        }
    }

    /// Queues `payload` for a connected peer.
    pub fn send(
        &mut self,
        addr: SocketAddr,
        channel: Channel,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD {
            error!(
                "Dropping {} byte payload for {}: over the {} byte limit",
                payload.len(),
                addr,
                MAX_PAYLOAD
            );
            return Err(TransportError::TooLarge(payload.len()));
        }
        let now = Instant::now();
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Err(TransportError::NotConnected);
        };
        if peer.state != PeerState::Connected {
            return Err(TransportError::NotConnected);
        }

        let datagram = match channel {
            Channel::Reliable => {
                let seq = peer.next_send_seq;
                peer.next_send_seq += 1;
                peer.in_flight.insert(
                    seq,
                    InFlight {
                        payload: payload.clone(),
                        sent_at: now,
                        attempts: 1,
                    },
                );
                peer.stats.packets_sent += 1;
                peer.update_loss();
                Datagram::Reliable { seq, payload }
            }
            Channel::Unreliable => {
                peer.stats.packets_sent += 1;
                Datagram::Unreliable { payload }
            }
        };
        self.queue(addr, &datagram);
        Ok(())
    }

    /// Dials `addr`, blocking until accepted, refused, or `timeout` elapses.
    /// A failed dial leaves no trace of the peer.
    pub fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), TransportError> {
        let now = Instant::now();
        let nonce: u64 = rand::thread_rng().gen();
        self.peers
            .insert(addr, Peer::new(PeerState::Connecting, nonce, now));
        self.queue(addr, &Datagram::Connect { nonce });
        self.flush();

        let deadline = now + timeout;
        loop {
            match self.peer_state(addr) {
                Some(PeerState::Connected) => return Ok(()),
                None => return Err(TransportError::Refused(addr)),
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.peers.remove(&addr);
                return Err(TransportError::Timeout(addr));
            }
            self.service(remaining.min(Duration::from_millis(50)));
        }
    }

    /// Asks the peer to disconnect and waits briefly for its acknowledgement,
    /// then forgets it regardless. Events seen while waiting are kept.
    pub fn disconnect(&mut self, addr: SocketAddr) {
        match self.peer_state(addr) {
            Some(PeerState::Connected) => {}
            Some(_) => {
                self.remove_peer(addr);
                return;
            }
            None => return,
        }
        let now = Instant::now();
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.advance(PeerState::Disconnecting);
            peer.disconnect_started = Some(now);
            peer.last_request = now;
        }
        self.queue(addr, &Datagram::Disconnect);
        self.flush();

        let deadline = now + DISCONNECT_GRACE;
        while self.peers.contains_key(&addr) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            for (from, bytes) in self.receive(remaining.min(Duration::from_millis(10))) {
                self.handle_datagram(from, &bytes);
            }
            self.flush();
        }
        self.remove_peer(addr);
    }
}

/// Client connection to a server over [`Endpoint`].
pub struct NetClient {
    endpoint: Endpoint,
    server: SocketAddr,
    inbox: VecDeque<Message>,
    connected: bool,
}

impl NetClient {
    /// Binds an ephemeral socket and dials `server`. On failure the socket
    /// and runtime are released before returning.
    pub fn connect(server: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let mut endpoint = Endpoint::bind(bind_addr, 0)?;
        endpoint.connect(server, timeout)?;
        info!("Connected to {}", server);
        Ok(Self {
            endpoint,
            server,
            inbox: VecDeque::new(),
            connected: true,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn stats(&self) -> Option<PeerStats> {
        self.endpoint.peer_stats(self.server)
    }

    fn absorb_events(&mut self) {
        for event in self.endpoint.take_events() {
            match event {
                RawEvent::Receive(addr, bytes) if addr == self.server => {
                    match codec::decode(&bytes) {
                        Ok(message) => self.inbox.push_back(message),
                        Err(e) => warn!("Dropping message from server: {}", e),
                    }
                }
                RawEvent::Disconnect(addr) if addr == self.server => {
                    info!("Disconnected from {}", addr);
                    self.connected = false;
                }
                _ => {}
            }
        }
    }
}

impl ClientTransport for NetClient {
    fn send(&mut self, message: &Message) -> bool {
        if !self.connected {
            return false;
        }
        let bytes = match codec::encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        self.endpoint
            .send(self.server, message.channel(), bytes)
            .is_ok()
    }

    fn try_recv(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    fn poll(&mut self, timeout: Duration) {
        self.endpoint.service(timeout);
        self.absorb_events();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.endpoint.disconnect(self.server);
            self.absorb_events();
            self.connected = false;
        }
    }
}
