//! Segment and packet PDUs shared by the router and transport crates.
//!
//! A [`Segment`] is the transport-layer PDU exchanged by [`ReliableConnection`]s (see the
//! `relnet-transport` crate); a [`Packet`] is the network-layer PDU a router forwards. Turning
//! either into wire bytes (and the accompanying `base64(data)` encoding named by the chat
//! application's wire format) is the job of an external serialization collaborator; this crate
//! only defines the structured, in-process shape.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::{Port, VirtualIp};

/// Default hop budget placed in newly originated packets.
pub const DEFAULT_TTL: u32 = 16;

/// The structured payload carried by a [`Segment`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentPayload {
    /// Virtual IP of the segment's sender.
    pub src_ip: VirtualIp,
    /// Port of the segment's sender.
    pub src_port: Port,
    /// Port of the segment's intended recipient.
    pub dst_port: Port,
    /// Payload bytes. Empty for control segments.
    pub data: Vec<u8>,
    /// Set on the first segment of a connection attempt.
    pub syn: bool,
    /// Set on the final segment of a teardown.
    pub fin: bool,
    /// Set when additional data segments follow in the same logical message.
    pub more: bool,
}

/// A transport-layer PDU.
///
/// Exactly one of the control classifications {pure-SYN, SYN-ACK, pure-ACK, FIN, data} applies to
/// a well-formed segment; the constructors below are the only supported way to build one so that
/// invariant always holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Alternating-bit sequence number, 0 or 1.
    pub sequence_number: u8,
    /// Whether this segment acknowledges a peer segment.
    pub is_ack: bool,
    /// The structured payload.
    pub payload: SegmentPayload,
}

impl Segment {
    /// Builds a pure SYN: the first segment of an active handshake.
    pub fn syn(src_ip: VirtualIp, src_port: Port, dst_port: Port) -> Self {
        Self {
            sequence_number: 0,
            is_ack: false,
            payload: SegmentPayload {
                src_ip,
                src_port,
                dst_port,
                data: Vec::new(),
                syn: true,
                fin: false,
                more: false,
            },
        }
    }

    /// Builds a SYN-ACK: the passive opener's response to a SYN.
    pub fn syn_ack(src_ip: VirtualIp, src_port: Port, dst_port: Port) -> Self {
        Self {
            sequence_number: 0,
            is_ack: true,
            payload: SegmentPayload {
                src_ip,
                src_port,
                dst_port,
                data: Vec::new(),
                syn: true,
                fin: false,
                more: false,
            },
        }
    }

    /// Builds a pure ACK of `sequence_number`.
    pub fn ack(sequence_number: u8, src_ip: VirtualIp, src_port: Port, dst_port: Port) -> Self {
        Self {
            sequence_number,
            is_ack: true,
            payload: SegmentPayload {
                src_ip,
                src_port,
                dst_port,
                data: Vec::new(),
                syn: false,
                fin: false,
                more: false,
            },
        }
    }

    /// Builds a FIN carrying `sequence_number`. Per invariant, FIN segments carry empty data.
    pub fn fin(sequence_number: u8, src_ip: VirtualIp, src_port: Port, dst_port: Port) -> Self {
        Self {
            sequence_number,
            is_ack: false,
            payload: SegmentPayload {
                src_ip,
                src_port,
                dst_port,
                data: Vec::new(),
                syn: false,
                fin: true,
                more: false,
            },
        }
    }

    /// Builds a data segment carrying `data`, with `more` set when further chunks follow.
    pub fn data(
        sequence_number: u8,
        src_ip: VirtualIp,
        src_port: Port,
        dst_port: Port,
        data: Vec<u8>,
        more: bool,
    ) -> Self {
        Self {
            sequence_number,
            is_ack: false,
            payload: SegmentPayload {
                src_ip,
                src_port,
                dst_port,
                data,
                syn: false,
                fin: false,
                more,
            },
        }
    }
}

/// A network-layer PDU. `ttl` is decremented once per hop by a router; a packet arriving with
/// `ttl == 0` is dropped rather than forwarded with a negative TTL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    /// Virtual IP of the packet's origin.
    pub src_vip: VirtualIp,
    /// Virtual IP of the packet's final destination.
    pub dst_vip: VirtualIp,
    /// Remaining hop budget.
    pub ttl: u32,
    /// The embedded transport segment.
    pub segment: Segment,
}

impl Packet {
    /// Originates a new packet with `ttl = DEFAULT_TTL`.
    pub fn originate(src_vip: VirtualIp, dst_vip: VirtualIp, segment: Segment) -> Self {
        Self {
            src_vip,
            dst_vip,
            ttl: DEFAULT_TTL,
            segment,
        }
    }
}
