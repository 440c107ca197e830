//! Stop-and-wait reliable connections, multiplexed over an unreliable [`Network`].
//!
//! [`ReliableConnection`] implements one bytestream endpoint: a 3-way handshake, alternating-bit
//! stop-and-wait data transfer, and a 4-way teardown, all driven by whichever caller thread invokes
//! `connect`/`accept`/`send`/`receive`/`close`. [`ReliableTransport`] is the multiplexer: one
//! background thread demultiplexes inbound segments by `(remote_vip, remote_port, local_port)` onto
//! the right connection's queues, the only place in this crate where anything runs off the caller's
//! own thread.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Port, VirtualAddress, VirtualIp};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};
use net::Network;
use segment::Segment;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Maximum bytes of application data carried per data segment.
pub const MSS: usize = 4096;
/// Bounded retry budget for the FIN handshake; data and SYN retransmits are unbounded.
pub const MAX_FIN_RETRIES: u32 = 8;
/// Default retransmission deadline for every wait in this crate.
pub const TIMEOUT: Duration = Duration::from_millis(200);

/// Demultiplexing key for an inbound segment: the peer's address plus the local port it targets.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionKey {
    /// Virtual IP of the remote peer.
    pub remote_vip: VirtualIp,
    /// Port of the remote peer.
    pub remote_port: Port,
    /// Local port this connection is bound to.
    pub local_port: Port,
}

/// An item posted to a connection's ACK queue: either a genuine ACK, or the sentinel
/// [`abort`](ReliableConnection::abort) uses to unblock a send in progress.
#[derive(Clone, Debug)]
enum AckItem {
    Ack(Segment),
    Abort(u8),
}

/// An item posted to a connection's data queue: either a genuine inbound segment, or the
/// sentinel that signals end-of-stream (peer FIN or local abort).
#[derive(Clone, Debug)]
enum DataItem {
    Data(Segment),
    Eof,
}

/// An item posted to a connection's FIN queue: either the peer's FIN sequence, or the sentinel
/// `abort` uses to unblock a `close` waiting in FIN_WAIT_2.
#[derive(Clone, Copy, Debug)]
enum FinItem {
    Fin(u8),
    Abort,
}

/// One reliable bytestream endpoint between two virtual addresses.
///
/// Driven entirely by caller threads; the only thing ever written into its queues from elsewhere
/// is the owning [`ReliableTransport`]'s dispatch thread, via [`ReliableConnection::dispatch`].
pub struct ReliableConnection<N> {
    network: Arc<N>,
    local_address: VirtualAddress,
    remote_address: VirtualAddress,
    on_close: Option<Box<dyn Fn() + Send + Sync>>,
    timeout: Duration,
    send_sequence: Mutex<u8>,
    receive_sequence: Mutex<u8>,
    connected: AtomicBool,
    closed: AtomicBool,
    close_lock: Mutex<()>,
    send_lock: Mutex<()>,
    ack_tx: Sender<AckItem>,
    ack_rx: Receiver<AckItem>,
    syn_ack_tx: Sender<Segment>,
    syn_ack_rx: Receiver<Segment>,
    fin_tx: Sender<FinItem>,
    fin_rx: Receiver<FinItem>,
    data_tx: Sender<DataItem>,
    data_rx: Receiver<DataItem>,
}

impl<N: Network> ReliableConnection<N> {
    /// Builds a connection between `local_address` and `remote_address`, firing `on_close` (if
    /// given) exactly once when the connection tears down.
    pub fn new(
        network: Arc<N>,
        local_address: VirtualAddress,
        remote_address: VirtualAddress,
        on_close: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self::with_timeout(network, local_address, remote_address, on_close, TIMEOUT)
    }

    /// As [`ReliableConnection::new`], overriding the retransmission deadline.
    pub fn with_timeout(
        network: Arc<N>,
        local_address: VirtualAddress,
        remote_address: VirtualAddress,
        on_close: Option<Box<dyn Fn() + Send + Sync>>,
        timeout: Duration,
    ) -> Self {
        let (ack_tx, ack_rx) = channel::unbounded();
        let (syn_ack_tx, syn_ack_rx) = channel::unbounded();
        let (fin_tx, fin_rx) = channel::unbounded();
        let (data_tx, data_rx) = channel::unbounded();
        Self {
            network,
            local_address,
            remote_address,
            on_close,
            timeout,
            send_sequence: Mutex::new(0),
            receive_sequence: Mutex::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            send_lock: Mutex::new(()),
            ack_tx,
            ack_rx,
            syn_ack_tx,
            syn_ack_rx,
            fin_tx,
            fin_rx,
            data_tx,
            data_rx,
        }
    }

    /// The remote address this connection talks to.
    pub fn remote_address(&self) -> &VirtualAddress {
        &self.remote_address
    }

    /// Active opener's side of the 3-way handshake. Blocks until a SYN-ACK arrives, retransmitting
    /// the SYN on every `timeout` in the meantime.
    pub fn connect(&self) {
        let syn = Segment::syn(
            self.local_address.vip.clone(),
            self.local_address.port,
            self.remote_address.port,
        );
        loop {
            self.network
                .send(syn.clone(), self.remote_address.vip.clone());
            debug!(
                "{} -> {}: syn sent",
                self.local_address, self.remote_address
            );
            if self.syn_ack_rx.recv_timeout(self.timeout).is_ok() {
                break;
            }
            warn!(
                "{} -> {}: timeout awaiting syn-ack, retransmitting",
                self.local_address, self.remote_address
            );
        }

        self.connected.store(true, Ordering::SeqCst);
        self.send_ack(0);
        debug!(
            "{} -> {}: handshake complete (active)",
            self.local_address, self.remote_address
        );
    }

    /// Passive opener's side of the 3-way handshake. Consumes the inbound SYN that `dispatch`
    /// already placed on the data queue, replies with SYN-ACK, and waits for the matching ACK.
    pub fn accept(&self) {
        match self.data_rx.recv().expect("data queue has no sender") {
            DataItem::Data(segment) if segment.payload.syn => {}
            other => panic!("expected initial syn, got {:?}", other),
        }

        let syn_ack = Segment::syn_ack(
            self.local_address.vip.clone(),
            self.local_address.port,
            self.remote_address.port,
        );
        loop {
            self.network
                .send(syn_ack.clone(), self.remote_address.vip.clone());
            debug!(
                "{} -> {}: syn-ack sent",
                self.local_address, self.remote_address
            );
            if self.ack_rx.recv_timeout(self.timeout).is_ok() {
                break;
            }
            warn!(
                "{} -> {}: timeout awaiting ack of syn-ack, retransmitting",
                self.local_address, self.remote_address
            );
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!("{}: handshake complete (passive)", self.local_address);
    }

    /// Splits `data` into `MSS`-sized chunks (at least one, even for empty input) and transmits
    /// each in order, only advancing once the expected ACK is observed.
    pub fn send(&self, data: &[u8]) {
        debug!(
            "{} -> {}: sending {} byte(s)",
            self.local_address,
            self.remote_address,
            data.len()
        );
        let chunk_count = (data.len().max(1) - 1) / MSS + 1;
        let _guard = self.send_lock.lock().unwrap();
        for i in 0..chunk_count {
            let start = i * MSS;
            let end = (start + MSS).min(data.len());
            let more = i + 1 < chunk_count;
            self.send_chunk(&data[start..end], more);
        }
    }

    fn send_chunk(&self, chunk: &[u8], more: bool) {
        let seq = *self.send_sequence.lock().unwrap();
        let segment = Segment::data(
            seq,
            self.local_address.vip.clone(),
            self.local_address.port,
            self.remote_address.port,
            chunk.to_vec(),
            more,
        );

        loop {
            self.network
                .send(segment.clone(), self.remote_address.vip.clone());
            let deadline = Instant::now() + self.timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.ack_rx.recv_timeout(remaining) {
                    Ok(AckItem::Abort(_)) => {
                        debug!(
                            "{}: send aborted mid-chunk (seq={})",
                            self.local_address, seq
                        );
                        return;
                    }
                    Ok(AckItem::Ack(ack)) if ack.sequence_number == seq => {
                        debug!(
                            "{} -> {}: chunk acked (seq={})",
                            self.local_address, self.remote_address, seq
                        );
                        *self.send_sequence.lock().unwrap() ^= 1;
                        return;
                    }
                    Ok(AckItem::Ack(ack)) => {
                        debug!(
                            "{}: duplicate ack discarded (received={} expected={})",
                            self.local_address, ack.sequence_number, seq
                        );
                    }
                    Err(_) => break,
                }
            }

            warn!(
                "{} -> {}: timeout, retransmitting (seq={})",
                self.local_address, self.remote_address, seq
            );
        }
    }

    /// Reads chunks until `more == false`, concatenating them. Returns `None` on end-of-stream
    /// (peer close or local abort).
    pub fn receive(&self) -> Option<Vec<u8>> {
        debug!("{}: awaiting data", self.local_address);
        let mut buffer = Vec::new();
        loop {
            let segment = self.receive_chunk()?;
            buffer.extend_from_slice(&segment.payload.data);
            if !segment.payload.more {
                break;
            }
        }
        debug!("{}: {} byte(s) received", self.local_address, buffer.len());
        Some(buffer)
    }

    fn receive_chunk(&self) -> Option<Segment> {
        loop {
            let segment = match self.data_rx.recv().expect("data queue has no sender") {
                DataItem::Eof => return None,
                DataItem::Data(segment) => segment,
            };

            let mut receive_sequence = self.receive_sequence.lock().unwrap();
            if segment.sequence_number != *receive_sequence {
                debug!(
                    "{}: duplicate discarded (received={} expected={})",
                    self.local_address, segment.sequence_number, *receive_sequence
                );
                self.send_ack(*receive_sequence ^ 1);
                continue;
            }

            self.send_ack(segment.sequence_number);
            *receive_sequence ^= 1;
            debug!(
                "{}: chunk accepted (seq={})",
                self.local_address, segment.sequence_number
            );
            return Some(segment);
        }
    }

    fn send_ack(&self, ack_sequence: u8) {
        let ack = Segment::ack(
            ack_sequence,
            self.local_address.vip.clone(),
            self.local_address.port,
            self.remote_address.port,
        );
        self.network
            .send(ack, self.remote_address.vip.clone());
        debug!(
            "{} -> {}: ack sent (seq={})",
            self.local_address, self.remote_address, ack_sequence
        );
    }

    /// Initiates the 4-way teardown. Idempotent: a second call is a no-op.
    pub fn close(&self) {
        {
            let _guard = self.close_lock.lock().unwrap();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }

        let passive = !self.fin_rx.is_empty();
        let seq = *self.send_sequence.lock().unwrap();
        let fin = Segment::fin(
            seq,
            self.local_address.vip.clone(),
            self.local_address.port,
            self.remote_address.port,
        );

        for attempt in 1..=MAX_FIN_RETRIES {
            self.network
                .send(fin.clone(), self.remote_address.vip.clone());
            debug!(
                "{} -> {}: fin sent (seq={}, attempt={}/{})",
                self.local_address, self.remote_address, seq, attempt, MAX_FIN_RETRIES
            );
            match self.ack_rx.recv_timeout(self.timeout) {
                Ok(AckItem::Ack(ack)) if ack.sequence_number == seq => {
                    debug!(
                        "{} -> {}: ack of fin received",
                        self.local_address, self.remote_address
                    );
                    break;
                }
                Ok(_) => {}
                Err(_) => {
                    if attempt == MAX_FIN_RETRIES {
                        warn!(
                            "{} -> {}: fin retransmit limit reached, giving up",
                            self.local_address, self.remote_address
                        );
                    } else {
                        warn!(
                            "{} -> {}: timeout awaiting ack of fin, retransmitting",
                            self.local_address, self.remote_address
                        );
                    }
                }
            }
        }

        if passive {
            debug!(
                "{} -> {}: connection closed (passive)",
                self.local_address, self.remote_address
            );
            self.fire_on_close();
            return;
        }

        debug!("{}: awaiting peer fin (fin_wait_2)", self.local_address);
        let _ = self.fin_rx.recv();
        debug!(
            "{} -> {}: connection closed (4-way fin)",
            self.local_address, self.remote_address
        );
        self.fire_on_close();
    }

    /// Tears down immediately without a handshake, unblocking any thread waiting in `send`,
    /// `receive`, or `close`. Idempotent with respect to firing `on_close`; the unblocking signals
    /// themselves are always delivered, even if `close` already claimed the teardown (a send or a
    /// `close` FIN_WAIT blocked on the other side of that race still needs to wake up).
    pub fn abort(&self) {
        let _ = self.data_tx.send(DataItem::Eof);
        let seq = *self.send_sequence.lock().unwrap();
        let _ = self.ack_tx.send(AckItem::Abort(seq));
        let _ = self.fin_tx.send(FinItem::Abort);

        {
            let _guard = self.close_lock.lock().unwrap();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.fire_on_close();
        debug!(
            "{} -> {}: connection aborted",
            self.local_address, self.remote_address
        );
    }

    fn fire_on_close(&self) {
        if let Some(on_close) = &self.on_close {
            on_close();
        }
    }

    /// Routes one inbound segment to the right internal queue. Called only by the owning
    /// transport's dispatch thread.
    pub fn dispatch(&self, segment: Segment) {
        if segment.payload.fin {
            self.send_ack(segment.sequence_number);
            debug!("{}: fin received, ack sent", self.local_address);
            let _ = self.fin_tx.send(FinItem::Fin(segment.sequence_number));
            let _ = self.data_tx.send(DataItem::Eof);
            return;
        }

        if segment.payload.syn {
            if segment.is_ack {
                if self.connected.load(Ordering::SeqCst) {
                    debug!("{}: syn-ack retransmitted, re-acking", self.local_address);
                    self.send_ack(0);
                } else {
                    debug!("{}: syn-ack received", self.local_address);
                    let _ = self.syn_ack_tx.send(segment);
                }
            } else if self.connected.load(Ordering::SeqCst) {
                debug!("{}: duplicate syn dropped (already connected)", self.local_address);
            } else {
                debug!("{}: syn received", self.local_address);
                let _ = self.data_tx.send(DataItem::Data(segment));
            }
            return;
        }

        if segment.is_ack {
            debug!(
                "{}: ack dispatched (seq={})",
                self.local_address, segment.sequence_number
            );
            let _ = self.ack_tx.send(AckItem::Ack(segment));
        } else {
            debug!(
                "{}: data dispatched (seq={})",
                self.local_address, segment.sequence_number
            );
            let _ = self.data_tx.send(DataItem::Data(segment));
        }
    }
}

/// Listen/connect multiplexer: demultiplexes one [`Network`]'s inbound segments across many
/// [`ReliableConnection`]s by `(remote_vip, remote_port, local_port)`.
pub struct ReliableTransport<N> {
    network: Arc<N>,
    local_address: VirtualAddress,
    connections: Mutex<HashMap<ConnectionKey, Arc<ReliableConnection<N>>>>,
    accept_tx: Sender<Arc<ReliableConnection<N>>>,
    accept_rx: Receiver<Arc<ReliableConnection<N>>>,
    timeout: Duration,
    self_ref: Weak<Self>,
}

impl<N: Network + 'static> ReliableTransport<N> {
    /// Builds a transport bound to `local_address` over `network` and starts its dispatch thread.
    pub fn new(network: N, local_address: VirtualAddress) -> Arc<Self> {
        Self::with_timeout(network, local_address, TIMEOUT)
    }

    /// As [`ReliableTransport::new`], overriding the per-connection retransmission deadline.
    pub fn with_timeout(network: N, local_address: VirtualAddress, timeout: Duration) -> Arc<Self> {
        let (accept_tx, accept_rx) = channel::unbounded();
        let network = Arc::new(network);
        let transport = Arc::new_cyclic(|self_ref| Self {
            network,
            local_address: local_address.clone(),
            connections: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx,
            timeout,
            self_ref: self_ref.clone(),
        });

        let dispatch_transport = transport.clone();
        thread::Builder::new()
            .name(format!("transport-{}", local_address))
            .spawn(move || dispatch_transport.dispatch_loop())
            .expect("failed to spawn transport dispatch thread");
        debug!("{}: dispatch loop started", local_address);

        transport
    }

    /// Constructs a new connection to `destination`, registers it under
    /// `(destination.vip, destination.port, local.port)`, and returns it. Does not itself perform
    /// the handshake; the caller drives that via the returned connection's `connect()`. A second
    /// `connect()` to the same destination replaces the earlier registration.
    pub fn connect(&self, destination: VirtualAddress) -> Arc<ReliableConnection<N>> {
        let key = ConnectionKey {
            remote_vip: destination.vip.clone(),
            remote_port: destination.port,
            local_port: self.local_address.port,
        };
        let connection = Arc::new(ReliableConnection::with_timeout(
            self.network.clone(),
            self.local_address.clone(),
            destination.clone(),
            Some(self.on_close_for(key.clone())),
            self.timeout,
        ));
        self.connections
            .lock()
            .unwrap()
            .insert(key, connection.clone());
        debug!(
            "{} -> {}: connection established",
            self.local_address, destination
        );
        connection
    }

    /// Blocks until an inbound connection has registered, then returns it, FIFO with respect to
    /// registration order.
    pub fn accept(&self) -> Arc<ReliableConnection<N>> {
        let connection = self.accept_rx.recv().expect("dispatch thread terminated");
        debug!(
            "{}: connection accepted from {}",
            self.local_address,
            connection.remote_address()
        );
        connection
    }

    fn on_close_for(&self, key: ConnectionKey) -> Box<dyn Fn() + Send + Sync> {
        let transport = self.self_ref.clone();
        Box::new(move || {
            if let Some(transport) = transport.upgrade() {
                transport.remove(&key);
            }
        })
    }

    fn remove(&self, key: &ConnectionKey) {
        self.connections.lock().unwrap().remove(key);
        debug!("{}: connection removed (key={:?})", self.local_address, key);
    }

    fn dispatch_loop(&self) {
        loop {
            match self.network.receive() {
                Some(segment) => self.route(segment),
                None => continue,
            }
        }
    }

    fn route(&self, segment: Segment) {
        let key = ConnectionKey {
            remote_vip: segment.payload.src_ip.clone(),
            remote_port: segment.payload.src_port,
            local_port: segment.payload.dst_port,
        };

        let mut connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.get(&key) {
            let connection = connection.clone();
            drop(connections);
            connection.dispatch(segment);
            return;
        }

        if segment.is_ack || segment.payload.fin {
            drop(connections);
            debug!(
                "{}: segment dropped, no connection (src={}:{})",
                self.local_address,
                key.remote_vip,
                key.remote_port.number()
            );
            return;
        }

        let remote_address = VirtualAddress::new(key.remote_vip.clone(), key.remote_port);
        let connection = Arc::new(ReliableConnection::with_timeout(
            self.network.clone(),
            self.local_address.clone(),
            remote_address,
            Some(self.on_close_for(key.clone())),
            self.timeout,
        ));
        connections.insert(key.clone(), connection.clone());
        drop(connections);

        connection.dispatch(segment);
        let _ = self.accept_tx.send(connection);
        debug!(
            "{}: new connection from {}:{}",
            self.local_address,
            key.remote_vip,
            key.remote_port.number()
        );
    }
}
