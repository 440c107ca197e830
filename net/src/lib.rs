//! Network and link collaborator traits, plus in-process test doubles.
//!
//! The stack's core never talks to a socket directly: the [`Network`] trait is what
//! [`relnet-transport`](../transport) consumes, and [`Link`] is what `relnet-router` consumes. A
//! real binding to UDP/CRC framing is an external collaborator and out of scope for this crate; the
//! `testing` feature (on by default) supplies [`Fabric`]-based doubles good enough to drive unit and
//! integration tests, in the same spirit as this codebase's loopback and lossy-channel test doubles.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::VirtualIp;
use crossbeam::channel::{self, Receiver, Sender};
use segment::{Packet, Segment};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Consumed by the transport multiplexer to exchange segments with a peer's network layer.
pub trait Network: Send + Sync {
    /// Best-effort send; may silently drop. Returns immediately.
    fn send(&self, segment: Segment, destination: VirtualIp);

    /// Blocks until a segment is available for local delivery, or a spurious wakeup fires.
    ///
    /// `None` means "nothing for local delivery right now" and callers are expected to loop.
    fn receive(&self) -> Option<Segment>;
}

/// Consumed by the router forwarding engine to exchange packets with a neighbor.
pub trait Link: Send + Sync {
    /// Best-effort send; may silently drop. Returns immediately.
    fn send(&self, packet: Packet, next_hop: VirtualIp);

    /// Blocks until a packet is available.
    fn receive(&self) -> Option<Packet>;
}

/// A registry of named in-process endpoints sharing one virtual fabric.
///
/// Every node that `register`s gets its own bounded mailbox; `send` looks the destination up in
/// the shared registry and pushes directly into its mailbox, or silently drops if the destination
/// never registered (mirroring a real datagram fabric's best-effort delivery).
pub struct Fabric<T> {
    mailboxes: Mutex<HashMap<VirtualIp, Sender<T>>>,
}

impl<T> Default for Fabric<T> {
    fn default() -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + 'static> Fabric<T> {
    /// Creates an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `vip` on this fabric and returns its endpoint handle.
    ///
    /// Re-registering the same `vip` replaces the previous mailbox; anything in flight to the old
    /// mailbox is lost, matching a real host rebinding its address.
    pub fn register(&self, vip: VirtualIp) -> FabricEndpoint<T> {
        let (tx, rx) = channel::unbounded();
        self.mailboxes.lock().unwrap().insert(vip, tx);
        FabricEndpoint { receiver: rx }
    }

    /// Delivers `item` to `destination`'s mailbox, if it is registered.
    pub fn deliver(&self, destination: &VirtualIp, item: T) {
        if let Some(tx) = self.mailboxes.lock().unwrap().get(destination) {
            let _ = tx.send(item);
        }
    }
}

/// One node's handle onto a [`Fabric`]: the receiving half of its mailbox.
pub struct FabricEndpoint<T> {
    receiver: Receiver<T>,
}

impl<T> FabricEndpoint<T> {
    /// Blocks until an item is queued for this endpoint.
    pub fn recv(&self) -> T {
        self.receiver
            .recv()
            .expect("fabric endpoint outlived its fabric")
    }

    /// Blocks until an item is queued or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

#[cfg(feature = "testing")]
mod testing {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    /// A [`Fabric`]-backed [`Network`] for one registered virtual address.
    pub struct FabricNetwork {
        fabric: Arc<Fabric<Segment>>,
        endpoint: FabricEndpoint<Segment>,
    }

    impl FabricNetwork {
        /// Registers `vip` on `fabric` and returns a [`Network`] handle for it.
        pub fn new(fabric: Arc<Fabric<Segment>>, vip: VirtualIp) -> Self {
            let endpoint = fabric.register(vip);
            Self { fabric, endpoint }
        }
    }

    impl Network for FabricNetwork {
        fn send(&self, segment: Segment, destination: VirtualIp) {
            self.fabric.deliver(&destination, segment);
        }

        fn receive(&self) -> Option<Segment> {
            Some(self.endpoint.recv())
        }
    }

    /// A [`Fabric`]-backed [`Link`] for one registered virtual address.
    pub struct FabricLink {
        fabric: Arc<Fabric<Packet>>,
        endpoint: FabricEndpoint<Packet>,
    }

    impl FabricLink {
        /// Registers `vip` on `fabric` and returns a [`Link`] handle for it.
        pub fn new(fabric: Arc<Fabric<Packet>>, vip: VirtualIp) -> Self {
            let endpoint = fabric.register(vip);
            Self { fabric, endpoint }
        }
    }

    impl Link for FabricLink {
        fn send(&self, packet: Packet, next_hop: VirtualIp) {
            self.fabric.deliver(&next_hop, packet);
        }

        fn receive(&self) -> Option<Packet> {
            Some(self.endpoint.recv())
        }
    }

    /// Wraps a [`FabricNetwork`] with an independent, uniform per-segment drop probability.
    ///
    /// `drop_probability` of `0.0` is a perfectly reliable channel; `1.0` drops everything (a
    /// partition). Values in between model the noisy fabric the transport layer is designed
    /// against, the way this codebase's lossy test channel models packet loss for DTCP.
    pub struct LossyNetwork {
        inner: FabricNetwork,
        drop_probability: f64,
    }

    impl LossyNetwork {
        /// Wraps `inner`, dropping outbound segments independently with `drop_probability`.
        pub fn new(inner: FabricNetwork, drop_probability: f64) -> Self {
            assert!((0.0..=1.0).contains(&drop_probability));
            Self {
                inner,
                drop_probability,
            }
        }
    }

    impl Network for LossyNetwork {
        fn send(&self, segment: Segment, destination: VirtualIp) {
            if rand::thread_rng().gen::<f64>() >= self.drop_probability {
                self.inner.send(segment, destination);
            }
        }

        fn receive(&self) -> Option<Segment> {
            self.inner.receive()
        }
    }
}

#[cfg(feature = "testing")]
pub use testing::{FabricLink, FabricNetwork, LossyNetwork};

#[cfg(test)]
mod tests {
    use super::*;
    use addr::VirtualIp;
    use std::sync::Arc;
    use std::thread;

    fn vip(label: &str) -> VirtualIp {
        VirtualIp::from(label)
    }

    #[test]
    fn fabric_network_delivers_to_registered_peer() {
        let fabric = Arc::new(Fabric::<Segment>::new());
        let a = FabricNetwork::new(fabric.clone(), vip("a"));
        let b = FabricNetwork::new(fabric, vip("b"));

        let seg = Segment::syn(vip("a"), addr::Port(1), addr::Port(2));
        a.send(seg.clone(), vip("b"));
        assert_eq!(b.receive(), Some(seg));
    }

    #[test]
    fn fabric_network_silently_drops_unknown_destination() {
        let fabric = Arc::new(Fabric::<Segment>::new());
        let a = FabricNetwork::new(fabric, vip("a"));
        let seg = Segment::syn(vip("a"), addr::Port(1), addr::Port(2));
        // "ghost" was never registered; send must not panic or block.
        a.send(seg, vip("ghost"));
    }

    #[test]
    fn lossy_network_zero_loss_is_reliable() {
        let fabric = Arc::new(Fabric::<Segment>::new());
        let a = LossyNetwork::new(FabricNetwork::new(fabric.clone(), vip("a")), 0.0);
        let b = LossyNetwork::new(FabricNetwork::new(fabric, vip("b")), 0.0);

        let seg = Segment::syn(vip("a"), addr::Port(1), addr::Port(2));
        a.send(seg.clone(), vip("b"));
        assert_eq!(b.receive(), Some(seg));
    }

    #[test]
    fn lossy_network_total_loss_drops_everything() {
        let fabric = Arc::new(Fabric::<Segment>::new());
        let b_endpoint = fabric.register(vip("b"));
        let a = LossyNetwork::new(FabricNetwork::new(fabric, vip("a")), 1.0);

        let seg = Segment::syn(vip("a"), addr::Port(1), addr::Port(2));
        a.send(seg, vip("b"));
        assert_eq!(b_endpoint.recv_timeout(Duration::from_millis(50)), None);
    }

    #[test]
    fn fabric_link_round_trip_across_threads() {
        let fabric = Arc::new(Fabric::<Packet>::new());
        let a = FabricLink::new(fabric.clone(), vip("a"));
        let b = FabricLink::new(fabric, vip("b"));

        let seg = Segment::syn(vip("a"), addr::Port(1), addr::Port(2));
        let packet = Packet::originate(vip("a"), vip("b"), seg);
        let expected = packet.clone();

        let handle = thread::spawn(move || b.receive());
        a.send(packet, vip("b"));
        assert_eq!(handle.join().unwrap(), Some(expected));
    }
}
