//! # A didactic reliable transport and router stack over a virtual datagram fabric
//!
//! This crate models a small internetwork of virtual hosts and routers, in the spirit of a
//! classroom network simulator: hosts exchange bytestreams over [`ReliableConnection`]s, routers
//! forward datagrams hop by hop with a decrementing TTL, and neither layer ever touches a real
//! socket. The virtual medium (a [`net::Network`] or [`net::Link`]) is always supplied by the
//! caller; this crate's own [`net::FabricNetwork`]/[`net::LossyNetwork`] test doubles are one such
//! medium, good enough to drive the unit and integration tests, not a production binding.
//!
//! ## Layering
//! - [`addr`] — virtual addressing: [`addr::VirtualIp`], [`addr::Port`], [`addr::VirtualAddress`].
//! - [`segment`] — the wire-shape PDUs: [`segment::Segment`] (transport) and [`segment::Packet`]
//!   (network).
//! - [`net`] — the [`net::Network`]/[`net::Link`] collaborator traits a real binding implements.
//! - [`router`] — [`router::Router`], the TTL-based forwarding engine.
//! - [`transport`] — [`transport::ReliableTransport`] and [`transport::ReliableConnection`], the
//!   stop-and-wait reliable bytestream layer.
//!
//! ## Reliability
//! Each connection is a stop-and-wait, alternating-bit (0/1) protocol: a 3-way handshake
//! (SYN / SYN-ACK / ACK), per-chunk data transfer with retransmit-on-timeout, and a 4-way teardown
//! (FIN / ACK / FIN / ACK). There is no flow control, congestion control, or window; one chunk is
//! in flight at a time, by design, the way a first reliable-transport exercise is usually scoped.
//!
//! ## Routing
//! A [`router::Router`] forwards strictly by a fixed `destination -> next_hop` table; there is no
//! default route, and no route flapping or dynamic route computation. TTL is checked before
//! decrementing so a packet can never be forwarded with a negative hop budget.
#![deny(missing_docs)]
#![deny(warnings)]

/// Virtual addressing primitives.
pub use addr;
/// Network/link collaborator traits and in-process test doubles.
pub use net;
/// TTL-based router forwarding engine.
pub use router;
/// Segment and packet wire-shape PDUs.
pub use segment;
/// Reliable connection and multiplexing transport.
pub use transport;
