//! Ethernet II framing.

use crate::addr::MacAddress;
use crate::error::StackError;
use crate::pipeline::{Callbacks, FrameHooks};
use crate::stack::StackCore;
use byteorder::{ByteOrder, NetworkEndian};
use std::rc::Rc;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const HEADER_LEN: usize = 14;

/// A decoded Ethernet II frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dest: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Decode a raw frame. VLAN-tagged and truncated frames are dropped.
    pub fn parse(bytes: &[u8]) -> Option<EthernetFrame> {
        if bytes.len() < HEADER_LEN {
            tracing::warn!(len = bytes.len(), "truncated ethernet frame");
            return None;
        }
        let mut dest = [0u8; 6];
        let mut src = [0u8; 6];
        dest.copy_from_slice(&bytes[0..6]);
        src.copy_from_slice(&bytes[6..12]);
        let tag = NetworkEndian::read_u16(&bytes[12..14]);
        if tag == ETHERTYPE_VLAN || tag == ETHERTYPE_QINQ {
            tracing::warn!(tag, "vlan frame dropped");
            return None;
        }
        Some(EthernetFrame {
            dest: MacAddress(dest),
            src: MacAddress(src),
            ethertype: tag,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.dest.octets());
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.ethertype.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// The bottom layer of the protocol tree: decodes bus bytes into frames,
/// offers them to the registered subprotocols, and serializes outbound
/// frames onto the bus.
pub struct Ethernet {
    core: Rc<StackCore>,
    pub(crate) subprotocols: FrameHooks<EthernetFrame>,
    /// Raw inbound frames, before decoding. The packet capture taps here.
    pub(crate) on_receive_frame: Callbacks<[u8]>,
}

impl Ethernet {
    pub(crate) fn new(core: Rc<StackCore>) -> Rc<Ethernet> {
        Rc::new(Ethernet {
            core,
            subprotocols: FrameHooks::new(),
            on_receive_frame: Callbacks::new(),
        })
    }

    pub(crate) fn handle_raw(&self, bytes: &[u8]) {
        self.on_receive_frame.emit(bytes);
        let Some(frame) = EthernetFrame::parse(bytes) else {
            return;
        };
        tracing::trace!(
            src = %frame.src,
            dest = %frame.dest,
            ethertype = frame.ethertype,
            len = frame.payload.len(),
            "eth rx"
        );
        if !self.subprotocols.offer(&frame) {
            tracing::debug!(ethertype = frame.ethertype, "unclaimed ethernet frame");
        }
    }

    pub(crate) fn send(&self, frame: &EthernetFrame) -> Result<(), StackError> {
        self.core.transmit(frame.encode())
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subprotocols.clear();
        self.on_receive_frame.clear();
    }
}
