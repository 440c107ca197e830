//! TTL-based router forwarding engine.
//!
//! A [`Router`] sits on one [`Link`] and forwards packets toward their `dst_vip` according to a
//! fixed routing table, the way the virtual network's router node forwards host-originated
//! traffic. There is no default route: a destination absent from the table is dropped and counted,
//! never silently broadcast. A background thread drains the link into an internal queue so that
//! [`Router::receive`] never contends with inbound delivery; [`Router::send`] originates packets
//! from this router's own address, for injecting locally-generated control traffic.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::VirtualIp;
use crossbeam::channel::{self, Receiver};
use failure::Fail;
use log::{debug, error, warn};
use net::Link;
use segment::{Packet, Segment};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Errors surfaced directly to a [`Router`] caller.
#[derive(Debug, Fail)]
pub enum RouterError {
    /// `destination` has no entry in this router's routing table.
    #[fail(display = "no route to destination: {}", _0)]
    UnknownDestination(VirtualIp),
}

/// A point-in-time snapshot of a router's forwarding counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RouterStats {
    /// Packets successfully forwarded to a next hop.
    pub forwarded: u64,
    /// Packets dropped because they arrived with a zero TTL.
    pub dropped_ttl: u64,
    /// Packets dropped because their destination had no routing table entry.
    pub dropped_unknown: u64,
}

impl RouterStats {
    /// Total packets this router has finished processing, forwarded or dropped.
    pub fn total(&self) -> u64 {
        self.forwarded + self.dropped_ttl + self.dropped_unknown
    }
}

/// Forwards packets arriving on a [`Link`] according to a fixed routing table.
pub struct Router<L> {
    link: Arc<L>,
    local_vip: VirtualIp,
    routing_table: HashMap<VirtualIp, VirtualIp>,
    inbox: Receiver<Packet>,
    forwarded: AtomicU64,
    dropped_ttl: AtomicU64,
    dropped_unknown: AtomicU64,
}

impl<L: Link + 'static> Router<L> {
    /// Builds a router for `local_vip`, forwarding according to `routing_table`
    /// (`destination -> next_hop`), and spawns its background ingress thread.
    pub fn new(link: L, local_vip: VirtualIp, routing_table: HashMap<VirtualIp, VirtualIp>) -> Self {
        let link = Arc::new(link);
        let (tx, rx) = channel::unbounded();
        let ingress_link = link.clone();
        thread::Builder::new()
            .name(format!("router-ingress-{}", local_vip))
            .spawn(move || loop {
                match ingress_link.receive() {
                    Some(packet) => {
                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                    None => continue,
                }
            })
            .expect("failed to spawn router ingress thread");

        Self {
            link,
            local_vip,
            routing_table,
            inbox: rx,
            forwarded: AtomicU64::new(0),
            dropped_ttl: AtomicU64::new(0),
            dropped_unknown: AtomicU64::new(0),
        }
    }

    /// Originates `segment` from this router's own address toward `destination`.
    ///
    /// Fails with [`RouterError::UnknownDestination`] if the routing table has no entry for
    /// `destination`; a locally originated packet is not exempt from having a route.
    pub fn send(&self, segment: Segment, destination: VirtualIp) -> Result<(), RouterError> {
        let next_hop = self
            .routing_table
            .get(&destination)
            .cloned()
            .ok_or_else(|| RouterError::UnknownDestination(destination.clone()))?;
        debug!(
            "{}: originating packet to {} via {}",
            self.local_vip, destination, next_hop
        );
        let packet = Packet::originate(self.local_vip.clone(), destination, segment);
        self.link.send(packet, next_hop);
        Ok(())
    }

    /// Blocks on the internal queue and processes exactly one inbound packet.
    ///
    /// Always returns `None`: this router has no local application above it, so there is never a
    /// segment to hand to a caller. Processing means: drop packets arriving with `ttl == 0`
    /// (checked before decrementing, so the hop budget never wraps), drop packets whose
    /// destination is absent from the routing table, and otherwise decrement the TTL and forward
    /// to the next hop. Every outcome updates [`Router::stats`].
    pub fn receive(&self) -> Option<Segment> {
        let packet = match self.inbox.recv() {
            Ok(packet) => packet,
            Err(_) => return None,
        };

        if packet.ttl == 0 {
            self.dropped_ttl.fetch_add(1, Ordering::SeqCst);
            warn!(
                "{}: dropping packet from {} to {}, ttl expired",
                self.local_vip, packet.src_vip, packet.dst_vip
            );
            return None;
        }

        let next_hop = match self.routing_table.get(&packet.dst_vip) {
            Some(next_hop) => next_hop.clone(),
            None => {
                self.dropped_unknown.fetch_add(1, Ordering::SeqCst);
                error!(
                    "{}: dropping packet to {}, no route",
                    self.local_vip, packet.dst_vip
                );
                return None;
            }
        };

        let mut packet = packet;
        packet.ttl -= 1;
        debug!(
            "{}: forwarding packet to {} via {}, ttl now {}",
            self.local_vip, packet.dst_vip, next_hop, packet.ttl
        );
        self.link.send(packet, next_hop);
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        None
    }

    /// Returns a snapshot of this router's forwarding counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            forwarded: self.forwarded.load(Ordering::SeqCst),
            dropped_ttl: self.dropped_ttl.load(Ordering::SeqCst),
            dropped_unknown: self.dropped_unknown.load(Ordering::SeqCst),
        }
    }
}
