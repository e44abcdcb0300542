//! ICMP echo: ping server and ping client.

use crate::addr::Ipv4Address;
use crate::error::StackError;
use crate::ipv4::{Ipv4, Ipv4Packet, PROTO_ICMP};
use crate::pipeline::Callbacks;
use crate::wire;
use byteorder::{ByteOrder, NetworkEndian};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;

const HEADER_LEN: usize = 8;

/// A decoded ICMP echo message together with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub src: Ipv4Address,
    pub dest: Ipv4Address,
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    /// Encode the ICMP message (excluding the IP header). The checksum
    /// is the complement of the ones' sum over the whole message with
    /// 0xFFFF in the checksum slot.
    pub fn encode_message(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.icmp_type);
        buf.push(self.code);
        buf.extend_from_slice(&[0xff, 0xff]);
        buf.extend_from_slice(&self.identifier.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let cksum = !wire::fold(wire::ones_complement_add(0, &buf));
        NetworkEndian::write_u16(&mut buf[2..4], cksum);
        buf
    }

    pub fn parse(src: Ipv4Address, dest: Ipv4Address, message: &[u8]) -> Option<IcmpPacket> {
        if message.len() < HEADER_LEN {
            tracing::warn!(len = message.len(), "short icmp message");
            return None;
        }
        if !wire::verify(message) {
            tracing::warn!("icmp checksum mismatch");
            return None;
        }
        let icmp_type = message[0];
        let code = message[1];
        if (icmp_type != TYPE_ECHO_REQUEST && icmp_type != TYPE_ECHO_REPLY) || code != 0 {
            tracing::warn!(icmp_type, code, "unsupported icmp message");
            return None;
        }
        Some(IcmpPacket {
            src,
            dest,
            icmp_type,
            code,
            identifier: NetworkEndian::read_u16(&message[4..6]),
            sequence: NetworkEndian::read_u16(&message[6..8]),
            payload: message[HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug)]
struct PingState {
    done: bool,
    waker: Option<Waker>,
}

/// Completion handle for an outstanding echo request. Resolves when the
/// matching reply arrives; pollable under any executor.
#[derive(Debug)]
pub struct Ping {
    state: Rc<RefCell<PingState>>,
}

impl Ping {
    pub fn is_resolved(&self) -> bool {
        self.state.borrow().done
    }
}

impl Future for Ping {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        if state.done {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

pub struct Icmp {
    ipv4: Rc<Ipv4>,
    ping_server: Ipv4Address,
    pending: RefCell<HashMap<u32, Rc<RefCell<PingState>>>>,
    pub(crate) received: Callbacks<IcmpPacket>,
}

impl Icmp {
    pub(crate) fn new(ipv4: Rc<Ipv4>, ping_server: Ipv4Address) -> Rc<Icmp> {
        Rc::new(Icmp {
            ipv4,
            ping_server,
            pending: RefCell::new(HashMap::new()),
            received: Callbacks::new(),
        })
    }

    /// Registered as an IPv4 subprotocol.
    pub(crate) fn handle_frame(&self, packet: &Ipv4Packet) -> bool {
        if packet.protocol != PROTO_ICMP {
            return false;
        }
        let Some(message) = IcmpPacket::parse(packet.src, packet.dest, &packet.payload) else {
            return true;
        };

        if message.icmp_type == TYPE_ECHO_REQUEST && message.dest == self.ping_server {
            let reply = IcmpPacket {
                src: message.dest,
                dest: message.src,
                icmp_type: TYPE_ECHO_REPLY,
                code: 0,
                identifier: message.identifier,
                sequence: message.sequence,
                payload: message.payload.clone(),
            };
            if let Err(e) = self.send(&reply) {
                tracing::error!(error = %e, "failed to answer echo request");
            }
            return true;
        }

        if message.icmp_type == TYPE_ECHO_REPLY {
            let key = ((message.identifier as u32) << 16) | message.sequence as u32;
            if let Some(state) = self.pending.borrow_mut().remove(&key) {
                tracing::debug!(key, "ping resolved");
                let mut state = state.borrow_mut();
                state.done = true;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
                return true;
            }
        }

        self.received.emit(&message);
        true
    }

    fn send(&self, message: &IcmpPacket) -> Result<(), StackError> {
        self.ipv4.send(&Ipv4Packet::new(
            message.src,
            message.dest,
            PROTO_ICMP,
            message.encode_message(),
        ))
    }

    /// Send an echo request and hand back a future resolved by the reply.
    pub(crate) fn ping(&self, src: Ipv4Address, dest: Ipv4Address) -> Result<Ping, StackError> {
        let key: u32 = rand::random();
        let state = Rc::new(RefCell::new(PingState {
            done: false,
            waker: None,
        }));
        self.pending.borrow_mut().insert(key, state.clone());

        let request = IcmpPacket {
            src,
            dest,
            icmp_type: TYPE_ECHO_REQUEST,
            code: 0,
            identifier: (key >> 16) as u16,
            sequence: key as u16,
            payload: Vec::new(),
        };
        if let Err(e) = self.send(&request) {
            self.pending.borrow_mut().remove(&key);
            return Err(e);
        }
        Ok(Ping { state })
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.received.clear();
        self.pending.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_roundtrip() {
        let packet = IcmpPacket {
            src: Ipv4Address::new(192, 168, 0, 1),
            dest: Ipv4Address::new(192, 168, 13, 37),
            icmp_type: TYPE_ECHO_REQUEST,
            code: 0,
            identifier: 0xbeef,
            sequence: 42,
            payload: b"abcdefgh".to_vec(),
        };
        let message = packet.encode_message();
        assert!(wire::verify(&message));
        let parsed = IcmpPacket::parse(packet.src, packet.dest, &message).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let packet = IcmpPacket {
            src: Ipv4Address::new(10, 0, 0, 1),
            dest: Ipv4Address::new(10, 0, 0, 2),
            icmp_type: TYPE_ECHO_REPLY,
            code: 0,
            identifier: 1,
            sequence: 2,
            payload: Vec::new(),
        };
        let mut message = packet.encode_message();
        message[5] ^= 0x01;
        assert!(IcmpPacket::parse(packet.src, packet.dest, &message).is_none());
    }

    #[test]
    fn test_unsupported_type_rejected() {
        // Type 13 (timestamp) with a valid checksum still gets dropped.
        let mut message = vec![13u8, 0, 0xff, 0xff, 0, 1, 0, 2];
        let cksum = !wire::fold(wire::ones_complement_add(0, &message));
        NetworkEndian::write_u16(&mut message[2..4], cksum);
        let src = Ipv4Address::new(10, 0, 0, 1);
        assert!(IcmpPacket::parse(src, src, &message).is_none());
    }
}
