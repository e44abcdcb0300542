//! UDP with the IPv4 pseudo-header checksum.

use crate::addr::Ipv4Address;
use crate::error::StackError;
use crate::ipv4::{Ipv4, Ipv4Packet, PROTO_UDP};
use crate::pipeline::{Callbacks, FrameHooks};
use crate::wire;
use byteorder::{ByteOrder, NetworkEndian};
use std::rc::Rc;

const HEADER_LEN: usize = 8;

/// A decoded UDP datagram together with its addressing (the pseudo
/// header needs both IPs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_ip: Ipv4Address,
    pub dest_ip: Ipv4Address,
    pub src_port: u16,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub fn parse(src_ip: Ipv4Address, dest_ip: Ipv4Address, message: &[u8]) -> Option<UdpDatagram> {
        if message.len() < HEADER_LEN {
            tracing::warn!(len = message.len(), "short udp datagram");
            return None;
        }
        let length = NetworkEndian::read_u16(&message[4..6]) as usize;
        if length != message.len() {
            tracing::warn!(length, actual = message.len(), "udp length mismatch");
            return None;
        }
        let cksum = NetworkEndian::read_u16(&message[6..8]);
        // Zero means the sender skipped the checksum (legal over IPv4).
        if cksum != 0 && !wire::verify_pseudo_header(src_ip, dest_ip, PROTO_UDP, message) {
            tracing::warn!("udp checksum mismatch");
            return None;
        }
        Some(UdpDatagram {
            src_ip,
            dest_ip,
            src_port: NetworkEndian::read_u16(&message[0..2]),
            dest_port: NetworkEndian::read_u16(&message[2..4]),
            payload: message[HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u16;
        let mut buf = Vec::with_capacity(length as usize);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dest_port.to_be_bytes());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.payload);
        let mut cksum = wire::pseudo_header_checksum(self.src_ip, self.dest_ip, PROTO_UDP, &buf);
        // 0x0000 would read as "no checksum"; the all-ones form is the
        // same value in ones' complement.
        if cksum == 0 {
            cksum = 0xffff;
        }
        NetworkEndian::write_u16(&mut buf[6..8], cksum);
        buf
    }
}

pub struct Udp {
    ipv4: Rc<Ipv4>,
    /// Responder subprotocols (the DHCP server) get first claim.
    pub(crate) responders: FrameHooks<UdpDatagram>,
    pub(crate) received: Callbacks<UdpDatagram>,
}

impl Udp {
    pub(crate) fn new(ipv4: Rc<Ipv4>) -> Rc<Udp> {
        Rc::new(Udp {
            ipv4,
            responders: FrameHooks::new(),
            received: Callbacks::new(),
        })
    }

    /// Registered as an IPv4 subprotocol.
    pub(crate) fn handle_frame(&self, packet: &Ipv4Packet) -> bool {
        if packet.protocol != PROTO_UDP {
            return false;
        }
        let Some(datagram) = UdpDatagram::parse(packet.src, packet.dest, &packet.payload) else {
            return true;
        };
        if self.responders.offer(&datagram) {
            return true;
        }
        self.received.emit(&datagram);
        true
    }

    pub(crate) fn send(&self, datagram: &UdpDatagram) -> Result<(), StackError> {
        self.ipv4.send(&Ipv4Packet::new(
            datagram.src_ip,
            datagram.dest_ip,
            PROTO_UDP,
            datagram.encode(),
        ))
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.responders.clear();
        self.received.clear();
    }
}
