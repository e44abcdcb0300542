//! ARP over Ethernet, plus the router's proxy responder.

use crate::addr::{Ipv4Address, MacAddress};
use crate::eth::{Ethernet, EthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::pipeline::{Callbacks, FrameHooks};
use crate::router::Router;
use byteorder::{ByteOrder, NetworkEndian};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

const PACKET_LEN: usize = 28;
const HARDWARE_ETHERNET: u16 = 1;

/// A decoded ARP packet. `queried_mac` is all-zero on a request and
/// carries the answer on a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub hardware_size: u8,
    pub protocol_size: u8,
    pub operation: u16,
    pub origin_mac: MacAddress,
    pub origin_ip: Ipv4Address,
    pub queried_ip: Ipv4Address,
    pub queried_mac: MacAddress,
}

impl ArpPacket {
    pub fn request(origin_mac: MacAddress, origin_ip: Ipv4Address, queried_ip: Ipv4Address) -> Self {
        ArpPacket {
            hardware_type: HARDWARE_ETHERNET,
            protocol_type: ETHERTYPE_IPV4,
            hardware_size: 6,
            protocol_size: 4,
            operation: OP_REQUEST,
            origin_mac,
            origin_ip,
            queried_ip,
            queried_mac: MacAddress([0; 6]),
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<ArpPacket> {
        if bytes.len() < PACKET_LEN {
            tracing::warn!(len = bytes.len(), "short arp packet");
            return None;
        }
        let operation = NetworkEndian::read_u16(&bytes[6..8]);
        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&bytes[8..14]);
        target_mac.copy_from_slice(&bytes[18..24]);
        let sender_ip = Ipv4Address([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let target_ip = Ipv4Address([bytes[24], bytes[25], bytes[26], bytes[27]]);

        // On the wire the sender side of a reply is the answer; fold both
        // operations into the origin/queried shape.
        let (origin_mac, origin_ip, queried_ip, queried_mac) = match operation {
            OP_REQUEST => (MacAddress(sender_mac), sender_ip, target_ip, MacAddress(target_mac)),
            OP_REPLY => (MacAddress(target_mac), target_ip, sender_ip, MacAddress(sender_mac)),
            other => {
                tracing::warn!(operation = other, "unsupported arp operation");
                return None;
            }
        };
        Some(ArpPacket {
            hardware_type: NetworkEndian::read_u16(&bytes[0..2]),
            protocol_type: NetworkEndian::read_u16(&bytes[2..4]),
            hardware_size: bytes[4],
            protocol_size: bytes[5],
            operation,
            origin_mac,
            origin_ip,
            queried_ip,
            queried_mac,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let (sender_mac, sender_ip, target_mac, target_ip) = match self.operation {
            OP_REPLY => (self.queried_mac, self.queried_ip, self.origin_mac, self.origin_ip),
            _ => (self.origin_mac, self.origin_ip, self.queried_mac, self.queried_ip),
        };
        let mut buf = Vec::with_capacity(PACKET_LEN);
        buf.extend_from_slice(&self.hardware_type.to_be_bytes());
        buf.extend_from_slice(&self.protocol_type.to_be_bytes());
        buf.push(self.hardware_size);
        buf.push(self.protocol_size);
        buf.extend_from_slice(&self.operation.to_be_bytes());
        buf.extend_from_slice(&sender_mac.octets());
        buf.extend_from_slice(&sender_ip.octets());
        buf.extend_from_slice(&target_mac.octets());
        buf.extend_from_slice(&target_ip.octets());
        buf
    }
}

/// An ARP packet together with the link-layer addressing it arrived
/// under; the responder's pass-through rules depend on the frame
/// destination.
#[derive(Debug, Clone)]
pub struct ArpFrame {
    pub eth_dest: MacAddress,
    pub eth_src: MacAddress,
    pub message: ArpPacket,
}

pub struct Arp {
    eth: Rc<Ethernet>,
    pub(crate) responders: FrameHooks<ArpFrame>,
    pub(crate) received: Callbacks<ArpPacket>,
}

impl Arp {
    pub(crate) fn new(eth: Rc<Ethernet>) -> Rc<Arp> {
        Rc::new(Arp {
            eth,
            responders: FrameHooks::new(),
            received: Callbacks::new(),
        })
    }

    /// Registered as an Ethernet subprotocol.
    pub(crate) fn handle_frame(&self, frame: &EthernetFrame) -> bool {
        if frame.ethertype != ETHERTYPE_ARP {
            return false;
        }
        let Some(message) = ArpPacket::parse(&frame.payload) else {
            return true;
        };
        if message.hardware_type != HARDWARE_ETHERNET || message.protocol_type != ETHERTYPE_IPV4 {
            tracing::warn!(
                hardware_type = message.hardware_type,
                protocol_type = message.protocol_type,
                "unsupported arp binding"
            );
            return true;
        }
        let arp_frame = ArpFrame {
            eth_dest: frame.dest,
            eth_src: frame.src,
            message,
        };
        if self.responders.offer(&arp_frame) {
            return true;
        }
        self.received.emit(&arp_frame.message);
        true
    }

    pub(crate) fn send(
        &self,
        dest: MacAddress,
        src: MacAddress,
        packet: &ArpPacket,
    ) -> Result<(), crate::error::StackError> {
        self.eth.send(&EthernetFrame {
            dest,
            src,
            ethertype: ETHERTYPE_ARP,
            payload: packet.encode(),
        })
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.responders.clear();
        self.received.clear();
    }
}

/// The router's proxy ARP responder: answers who-has queries for every
/// registered device. Runs ahead of the ordinary client logic.
pub(crate) struct RouterArp {
    pub(crate) router: Rc<RefCell<Router>>,
    pub(crate) arp: Weak<Arp>,
}

impl RouterArp {
    pub(crate) fn handle(&self, frame: &ArpFrame) -> bool {
        let (router_mac, queried_device) = {
            let router = self.router.borrow();
            (router.mac(), router.device_by_ip(frame.message.queried_ip))
        };

        // Our own emissions loop back through the dispatcher; swallow them.
        if frame.eth_src == router_mac {
            return true;
        }
        // Addressed to some other station: leave it for the client logic.
        if frame.eth_dest != router_mac && !frame.eth_dest.is_broadcast() {
            return false;
        }
        if frame.message.operation != OP_REQUEST {
            return false;
        }

        match queried_device {
            Some(device) => {
                let reply = ArpPacket {
                    hardware_type: frame.message.hardware_type,
                    protocol_type: frame.message.protocol_type,
                    hardware_size: frame.message.hardware_size,
                    protocol_size: frame.message.protocol_size,
                    operation: OP_REPLY,
                    origin_mac: frame.message.origin_mac,
                    origin_ip: frame.message.origin_ip,
                    queried_ip: frame.message.queried_ip,
                    queried_mac: device.mac,
                };
                if let Some(arp) = self.arp.upgrade() {
                    if let Err(e) = arp.send(frame.message.origin_mac, router_mac, &reply) {
                        tracing::error!(error = %e, "failed to emit arp reply");
                    }
                }
                true
            }
            None => {
                tracing::debug!(queried = %frame.message.queried_ip, "arp query for unknown address");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = ArpPacket::request(
            "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            Ipv4Address::new(192, 168, 0, 5),
            Ipv4Address::new(192, 168, 0, 1),
        );
        let parsed = ArpPacket::parse(&request.encode()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = ArpPacket {
            hardware_type: 1,
            protocol_type: 0x0800,
            hardware_size: 6,
            protocol_size: 4,
            operation: OP_REPLY,
            origin_mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            origin_ip: Ipv4Address::new(192, 168, 0, 5),
            queried_ip: Ipv4Address::new(192, 168, 0, 1),
            queried_mac: "00:0c:13:37:42:69".parse().unwrap(),
        };
        let bytes = reply.encode();
        // Wire sender of a reply is the answer.
        assert_eq!(&bytes[8..14], &reply.queried_mac.octets());
        assert_eq!(&bytes[14..18], &reply.queried_ip.octets());
        assert_eq!(ArpPacket::parse(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(ArpPacket::parse(&[0u8; 27]).is_none());
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut bytes = ArpPacket::request(
            MacAddress([1; 6]),
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
        )
        .encode();
        bytes[7] = 9;
        assert!(ArpPacket::parse(&bytes).is_none());
    }
}
