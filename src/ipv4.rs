//! IPv4 parse/emit and next-hop resolution.

use crate::addr::Ipv4Address;
use crate::error::StackError;
use crate::eth::{Ethernet, EthernetFrame, ETHERTYPE_IPV4};
use crate::pipeline::FrameHooks;
use crate::router::Router;
use crate::wire;
use byteorder::{ByteOrder, NetworkEndian};
use std::cell::RefCell;
use std::rc::Rc;

const HEADER_LEN: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// A decoded IPv4 packet. The stack emits fixed 20-byte headers with a
/// zero identification field; fragmentation is unsupported in both
/// directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub src: Ipv4Address,
    pub dest: Ipv4Address,
    pub dscp: u8,
    pub ecn: u8,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    /// A packet with the conventional defaults for locally originated
    /// traffic.
    pub fn new(src: Ipv4Address, dest: Ipv4Address, protocol: u8, payload: Vec<u8>) -> Self {
        Ipv4Packet {
            src,
            dest,
            dscp: 0,
            ecn: 0,
            dont_fragment: true,
            ttl: 64,
            protocol,
            payload,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Ipv4Packet> {
        if bytes.len() < HEADER_LEN {
            tracing::warn!(len = bytes.len(), "short ipv4 packet");
            return None;
        }
        let version = bytes[0] >> 4;
        if version != 4 {
            tracing::warn!(version, "unsupported ip version");
            return None;
        }
        let ihl = (bytes[0] & 0x0f) as usize;
        if ihl != 5 {
            tracing::warn!(ihl, "ip options unsupported");
            return None;
        }
        let total_len = NetworkEndian::read_u16(&bytes[2..4]) as usize;
        if total_len < HEADER_LEN || total_len > bytes.len() {
            tracing::warn!(total_len, actual = bytes.len(), "bad ipv4 total length");
            return None;
        }
        let flags_offset = NetworkEndian::read_u16(&bytes[6..8]);
        let more_fragments = flags_offset & 0x2000 != 0;
        let fragment_offset = flags_offset & 0x1fff;
        if more_fragments || fragment_offset != 0 {
            tracing::warn!("fragmented ipv4 packet dropped");
            return None;
        }
        if !wire::verify(&bytes[..HEADER_LEN]) {
            tracing::warn!("ipv4 header checksum mismatch");
            return None;
        }
        Some(Ipv4Packet {
            src: Ipv4Address([bytes[12], bytes[13], bytes[14], bytes[15]]),
            dest: Ipv4Address([bytes[16], bytes[17], bytes[18], bytes[19]]),
            dscp: bytes[1] >> 2,
            ecn: bytes[1] & 0x03,
            dont_fragment: flags_offset & 0x4000 != 0,
            ttl: bytes[8],
            protocol: bytes[9],
            // Ethernet pads short frames; the total length field governs.
            payload: bytes[HEADER_LEN..total_len].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_len = (HEADER_LEN + self.payload.len()) as u16;
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 0x40 | 5;
        buf[1] = (self.dscp << 2) | (self.ecn & 0x03);
        NetworkEndian::write_u16(&mut buf[2..4], total_len);
        // identification stays zero: we never fragment
        let flags: u16 = if self.dont_fragment { 0x4000 } else { 0 };
        NetworkEndian::write_u16(&mut buf[6..8], flags);
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dest.octets());
        let cksum = wire::internet_checksum(&buf[..HEADER_LEN]);
        NetworkEndian::write_u16(&mut buf[10..12], cksum);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

pub struct Ipv4 {
    eth: Rc<Ethernet>,
    router: Rc<RefCell<Router>>,
    pub(crate) subprotocols: FrameHooks<Ipv4Packet>,
}

impl Ipv4 {
    pub(crate) fn new(eth: Rc<Ethernet>, router: Rc<RefCell<Router>>) -> Rc<Ipv4> {
        Rc::new(Ipv4 {
            eth,
            router,
            subprotocols: FrameHooks::new(),
        })
    }

    /// Registered as an Ethernet subprotocol.
    pub(crate) fn handle_frame(&self, frame: &EthernetFrame) -> bool {
        if frame.ethertype != ETHERTYPE_IPV4 {
            return false;
        }
        let Some(packet) = Ipv4Packet::parse(&frame.payload) else {
            return true;
        };
        tracing::trace!(
            src = %packet.src,
            dest = %packet.dest,
            protocol = packet.protocol,
            len = packet.payload.len(),
            "ipv4 rx"
        );
        if !self.subprotocols.offer(&packet) {
            tracing::debug!(protocol = packet.protocol, "unclaimed ipv4 packet");
        }
        true
    }

    /// Serialize and emit `packet`, resolving the next-hop MAC through
    /// the router's device table. An unknown destination is an error:
    /// the stack never forwards off-subnet.
    pub(crate) fn send(&self, packet: &Ipv4Packet) -> Result<(), StackError> {
        let (src_mac, dest_mac) = {
            let router = self.router.borrow();
            let dest_mac = router
                .resolve(packet.dest)
                .ok_or(StackError::NoRoute(packet.dest))?;
            // Locally originated frames from unregistered source addresses
            // go out under the router's own MAC.
            let src_mac = router.resolve(packet.src).unwrap_or_else(|| router.mac());
            (src_mac, dest_mac)
        };
        let bytes = packet.encode();
        if !wire::verify(&bytes[..HEADER_LEN]) {
            return Err(StackError::Invariant("emitted ipv4 header checksum"));
        }
        self.eth.send(&EthernetFrame {
            dest: dest_mac,
            src: src_mac,
            ethertype: ETHERTYPE_IPV4,
            payload: bytes,
        })
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subprotocols.clear();
    }
}
