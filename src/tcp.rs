//! User-space TCP: sockets, handshake, ordered delivery, retransmission.
//!
//! This is deliberately not a full TCP. There is no congestion control,
//! no window scaling and no four-way teardown; `close()` emits a FIN and
//! drops straight to CLOSED. The peer on the other side of the adapter
//! is either the emulator's in-guest stack or another local socket
//! reached through loopback, so the simplifications hold up.

use crate::addr::Ipv4Address;
use crate::error::StackError;
use crate::ipv4::{Ipv4, Ipv4Packet, PROTO_TCP};
use crate::pipeline::Callbacks;
use crate::stack::StackCore;
use crate::wire;
use byteorder::{ByteOrder, NetworkEndian};
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

const HEADER_LEN: usize = 20;

/// Payload ceiling per segment; leaves headroom under the Ethernet MTU.
pub const MAX_SEGMENT: usize = 1200;
/// Total transmissions of a scheduled segment before the socket gives up.
const MAX_TRANSMISSIONS: u32 = 10;
const INITIAL_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(3000);
const WINDOW: u16 = 65535;

/// The canonical flag bits, decoded individually.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub ns: bool,
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    fn parse(offset_byte: u8, flag_byte: u8) -> TcpFlags {
        TcpFlags {
            ns: offset_byte & 0x01 != 0,
            cwr: flag_byte & 0x80 != 0,
            ece: flag_byte & 0x40 != 0,
            urg: flag_byte & 0x20 != 0,
            ack: flag_byte & 0x10 != 0,
            psh: flag_byte & 0x08 != 0,
            rst: flag_byte & 0x04 != 0,
            syn: flag_byte & 0x02 != 0,
            fin: flag_byte & 0x01 != 0,
        }
    }

    fn flag_byte(&self) -> u8 {
        (self.cwr as u8) << 7
            | (self.ece as u8) << 6
            | (self.urg as u8) << 5
            | (self.ack as u8) << 4
            | (self.psh as u8) << 3
            | (self.rst as u8) << 2
            | (self.syn as u8) << 1
            | self.fin as u8
    }
}

/// A decoded TCP segment together with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub src_ip: Ipv4Address,
    pub dest_ip: Ipv4Address,
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<u8>,
    pub data: Vec<u8>,
}

impl TcpPacket {
    pub fn parse(src_ip: Ipv4Address, dest_ip: Ipv4Address, message: &[u8]) -> Option<TcpPacket> {
        if message.len() < HEADER_LEN {
            tracing::warn!(len = message.len(), "short tcp segment");
            return None;
        }
        let offset = ((message[12] >> 4) as usize) * 4;
        if offset < HEADER_LEN || offset > message.len() {
            tracing::warn!(offset, "bad tcp data offset");
            return None;
        }
        if !wire::verify_pseudo_header(src_ip, dest_ip, PROTO_TCP, message) {
            tracing::warn!("tcp checksum mismatch");
            return None;
        }
        Some(TcpPacket {
            src_ip,
            dest_ip,
            src_port: NetworkEndian::read_u16(&message[0..2]),
            dest_port: NetworkEndian::read_u16(&message[2..4]),
            seq: NetworkEndian::read_u32(&message[4..8]),
            ack: NetworkEndian::read_u32(&message[8..12]),
            flags: TcpFlags::parse(message[12], message[13]),
            window: NetworkEndian::read_u16(&message[14..16]),
            urgent: NetworkEndian::read_u16(&message[18..20]),
            options: message[HEADER_LEN..offset].to_vec(),
            data: message[offset..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let padded_options = (self.options.len() + 3) & !3;
        let offset = HEADER_LEN + padded_options;
        let mut buf = vec![0u8; offset];
        NetworkEndian::write_u16(&mut buf[0..2], self.src_port);
        NetworkEndian::write_u16(&mut buf[2..4], self.dest_port);
        NetworkEndian::write_u32(&mut buf[4..8], self.seq);
        NetworkEndian::write_u32(&mut buf[8..12], self.ack);
        buf[12] = ((offset / 4) as u8) << 4 | self.flags.ns as u8;
        buf[13] = self.flags.flag_byte();
        NetworkEndian::write_u16(&mut buf[14..16], self.window);
        NetworkEndian::write_u16(&mut buf[18..20], self.urgent);
        buf[HEADER_LEN..HEADER_LEN + self.options.len()].copy_from_slice(&self.options);
        buf.extend_from_slice(&self.data);
        let cksum = wire::pseudo_header_checksum(self.src_ip, self.dest_ip, PROTO_TCP, &buf);
        NetworkEndian::write_u16(&mut buf[16..18], cksum);
        buf
    }

    fn consumes(&self) -> u32 {
        self.data.len() as u32 + u32::from(self.flags.syn) + u32::from(self.flags.fin)
    }
}

/// `a < b` in sequence space (wrap-aware).
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_lte(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

pub(crate) fn connection_key(
    src_ip: Ipv4Address,
    src_port: u16,
    dest_ip: Ipv4Address,
    dest_port: u16,
) -> String {
    format!("{src_ip}:{src_port} -> {dest_ip}:{dest_port}")
}

/// 30 bits of CSPRNG output, floored to a multiple of 100 so sequence
/// numbers stay readable in traces.
fn initial_sequence() -> u32 {
    (rand::random::<u32>() & 0x3fff_ffff) / 100 * 100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Init,
    Listen,
    SynSent,
    SynReceived,
    Established,
    Closed,
}

pub(crate) struct TcpShared {
    pub(crate) core: Rc<StackCore>,
    pub(crate) ipv4: Rc<Ipv4>,
}

impl TcpShared {
    fn transmit(&self, packet: &TcpPacket) -> Result<(), StackError> {
        self.ipv4.send(&Ipv4Packet::new(
            packet.src_ip,
            packet.dest_ip,
            PROTO_TCP,
            packet.encode(),
        ))
    }
}

struct Scheduled {
    id: u64,
    end_seq: u32,
    packet: TcpPacket,
}

pub(crate) struct SocketInner {
    shared: Rc<TcpShared>,
    src_ip: Ipv4Address,
    dest_ip: Ipv4Address,
    src_port: u16,
    dest_port: u16,
    is_server: bool,
    state: Cell<TcpState>,
    seq: Cell<u32>,
    ack: Cell<u32>,
    /// Out-of-order arrivals wait here until the gap fills.
    holding: RefCell<VecDeque<TcpPacket>>,
    /// Sent segments awaiting a covering ACK.
    unacked: RefCell<Vec<Scheduled>>,
    /// Writes issued before ESTABLISHED.
    backlog: RefCell<VecDeque<Vec<u8>>>,
    on_established: Callbacks<()>,
    on_data: Callbacks<[u8]>,
    on_close: Callbacks<()>,
}

impl SocketInner {
    fn new(
        shared: Rc<TcpShared>,
        src_ip: Ipv4Address,
        dest_ip: Ipv4Address,
        src_port: u16,
        dest_port: u16,
        is_server: bool,
    ) -> Rc<SocketInner> {
        Rc::new(SocketInner {
            shared,
            src_ip,
            dest_ip,
            src_port,
            dest_port,
            is_server,
            state: Cell::new(TcpState::Init),
            seq: Cell::new(initial_sequence()),
            ack: Cell::new(0),
            holding: RefCell::new(VecDeque::new()),
            unacked: RefCell::new(Vec::new()),
            backlog: RefCell::new(VecDeque::new()),
            on_established: Callbacks::new(),
            on_data: Callbacks::new(),
            on_close: Callbacks::new(),
        })
    }

    fn key(&self) -> String {
        connection_key(self.src_ip, self.src_port, self.dest_ip, self.dest_port)
    }

    fn handle_packet(sock: &Rc<SocketInner>, packet: &TcpPacket) {
        // The adapter loops every emission back; skip our own segments.
        if packet.src_ip == sock.src_ip && packet.src_port == sock.src_port {
            return;
        }
        if packet.flags.rst {
            tracing::debug!(key = %sock.key(), "reset by peer");
            sock.transition_closed();
            return;
        }
        if packet.flags.ack {
            sock.retire_acknowledged(packet.ack);
        }

        match sock.state.get() {
            TcpState::Listen => {
                if packet.flags.syn && !packet.flags.ack {
                    sock.ack.set(packet.seq.wrapping_add(1));
                    sock.state.set(TcpState::SynReceived);
                    let flags = TcpFlags {
                        syn: true,
                        ack: true,
                        ..TcpFlags::default()
                    };
                    if let Err(e) = SocketInner::send_segment(sock, flags, Vec::new()) {
                        tracing::error!(error = %e, "failed to emit syn+ack");
                    }
                } else {
                    tracing::debug!(key = %sock.key(), "non-syn segment while listening");
                }
                return;
            }
            TcpState::SynSent => {
                if packet.flags.syn && packet.flags.ack {
                    sock.ack.set(packet.seq.wrapping_add(1));
                    if let Err(e) = sock.send_pure_ack() {
                        tracing::error!(error = %e, "failed to complete handshake");
                    }
                    SocketInner::enter_established(sock);
                    return;
                }
            }
            TcpState::SynReceived => {
                if packet.flags.ack {
                    SocketInner::enter_established(sock);
                    if !packet.data.is_empty() || packet.flags.fin {
                        SocketInner::ingress(sock, packet.clone());
                    }
                    return;
                }
            }
            TcpState::Established => {
                SocketInner::ingress(sock, packet.clone());
                return;
            }
            TcpState::Init | TcpState::Closed => {
                tracing::trace!(key = %sock.key(), state = ?sock.state.get(), "segment ignored");
            }
        }

        // FIN in any remaining state still tears the connection down.
        if packet.flags.fin && sock.state.get() != TcpState::Closed {
            sock.ack.set(
                packet
                    .seq
                    .wrapping_add(packet.data.len() as u32)
                    .wrapping_add(1),
            );
            let _ = sock.send_pure_ack();
            sock.transition_closed();
        }
    }

    /// Ordered, de-duplicated delivery through the holding queue.
    fn ingress(sock: &Rc<SocketInner>, packet: TcpPacket) {
        sock.holding.borrow_mut().push_back(packet);
        let mut ack_needed = false;
        let mut fin_seen = false;
        loop {
            if sock.state.get() == TcpState::Closed {
                break;
            }
            let next = {
                let mut queue = sock.holding.borrow_mut();
                match queue.iter().position(|p| seq_lte(p.seq, sock.ack.get())) {
                    Some(i) => queue.remove(i),
                    None => None,
                }
            };
            let Some(pkt) = next else { break };
            if seq_lt(pkt.seq, sock.ack.get()) {
                // Retransmission (or keepalive): acknowledge, never
                // redeliver.
                ack_needed = true;
                continue;
            }
            let advance = pkt.data.len() as u32 + u32::from(pkt.flags.fin);
            if advance > 0 {
                sock.ack.set(sock.ack.get().wrapping_add(advance));
                ack_needed = true;
            }
            if pkt.flags.fin {
                fin_seen = true;
            }
            if !pkt.data.is_empty() {
                sock.on_data.emit(&pkt.data);
            }
        }
        if ack_needed && sock.state.get() != TcpState::Closed {
            if let Err(e) = sock.send_pure_ack() {
                tracing::warn!(error = %e, "failed to acknowledge");
            }
        }
        if fin_seen {
            sock.transition_closed();
        }
    }

    fn retire_acknowledged(&self, ack: u32) {
        self.unacked
            .borrow_mut()
            .retain(|s| seq_lt(ack, s.end_seq));
    }

    /// Emit a segment at the current seq/ack. Segments that consume
    /// sequence space (SYN, FIN, data) are scheduled for retransmission.
    fn send_segment(
        sock: &Rc<SocketInner>,
        flags: TcpFlags,
        data: Vec<u8>,
    ) -> Result<(), StackError> {
        let packet = TcpPacket {
            src_ip: sock.src_ip,
            dest_ip: sock.dest_ip,
            src_port: sock.src_port,
            dest_port: sock.dest_port,
            seq: sock.seq.get(),
            ack: sock.ack.get(),
            flags,
            window: WINDOW,
            urgent: 0,
            options: Vec::new(),
            data,
        };
        let advance = packet.consumes();
        sock.seq.set(sock.seq.get().wrapping_add(advance));
        if advance > 0 {
            let id = sock.shared.core.next_packet_id();
            sock.unacked.borrow_mut().push(Scheduled {
                id,
                end_seq: packet.seq.wrapping_add(advance),
                packet: packet.clone(),
            });
            SocketInner::schedule_retransmit(sock, id, 1, INITIAL_RETRANSMIT_TIMEOUT);
        }
        sock.shared.transmit(&packet)
    }

    fn send_pure_ack(&self) -> Result<(), StackError> {
        let packet = TcpPacket {
            src_ip: self.src_ip,
            dest_ip: self.dest_ip,
            src_port: self.src_port,
            dest_port: self.dest_port,
            seq: self.seq.get(),
            ack: self.ack.get(),
            flags: TcpFlags {
                ack: true,
                ..TcpFlags::default()
            },
            window: WINDOW,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        };
        self.shared.transmit(&packet)
    }

    fn schedule_retransmit(sock: &Rc<SocketInner>, id: u64, sent: u32, wait: Duration) {
        let weak = Rc::downgrade(sock);
        sock.shared.core.schedule(
            wait,
            Box::new(move || {
                let Some(sock) = weak.upgrade() else { return };
                // A closed socket stops retrying on its next tick.
                if sock.state.get() == TcpState::Closed {
                    return;
                }
                let packet = sock
                    .unacked
                    .borrow()
                    .iter()
                    .find(|s| s.id == id)
                    .map(|s| s.packet.clone());
                let Some(packet) = packet else { return };
                if sent >= MAX_TRANSMISSIONS {
                    tracing::debug!(key = %sock.key(), seq = packet.seq, "giving up after max retransmissions");
                    sock.unacked.borrow_mut().retain(|s| s.id != id);
                    sock.transition_closed();
                    return;
                }
                tracing::debug!(key = %sock.key(), seq = packet.seq, attempt = sent + 1, "retransmitting");
                if let Err(e) = sock.shared.transmit(&packet) {
                    tracing::warn!(error = %e, "retransmission failed");
                }
                let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.6);
                SocketInner::schedule_retransmit(&sock, id, sent + 1, wait.mul_f64(factor));
            }),
        );
    }

    fn enter_established(sock: &Rc<SocketInner>) {
        sock.state.set(TcpState::Established);
        tracing::debug!(key = %sock.key(), "connection established");
        let weak = Rc::downgrade(sock);
        // Deferred one tick so the caller can register callbacks between
        // the handshake completing and delivery beginning.
        sock.shared.core.schedule(
            Duration::ZERO,
            Box::new(move || {
                let Some(sock) = weak.upgrade() else { return };
                if sock.state.get() == TcpState::Closed {
                    return;
                }
                sock.on_established.emit(&());
                // Buffered writes go out only after the callbacks ran.
                loop {
                    let chunk = sock.backlog.borrow_mut().pop_front();
                    match chunk {
                        Some(bytes) => {
                            if let Err(e) = SocketInner::send_data(&sock, &bytes) {
                                tracing::warn!(error = %e, "buffered write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }),
        );
    }

    fn send_data(sock: &Rc<SocketInner>, bytes: &[u8]) -> Result<(), StackError> {
        for chunk in bytes.chunks(MAX_SEGMENT) {
            let flags = TcpFlags {
                ack: true,
                psh: true,
                ..TcpFlags::default()
            };
            SocketInner::send_segment(sock, flags, chunk.to_vec())?;
        }
        Ok(())
    }

    fn transition_closed(&self) {
        if self.state.get() == TcpState::Closed {
            return;
        }
        self.state.set(TcpState::Closed);
        tracing::debug!(key = %self.key(), "connection closed");
        self.on_close.emit(&());
    }
}

/// Handle to one TCP connection. Cheap to clone; all clones share the
/// same socket.
#[derive(Clone)]
pub struct TcpSocket {
    inner: Rc<SocketInner>,
}

impl TcpSocket {
    pub fn on_established(&self, mut cb: impl FnMut() + 'static) {
        self.inner.on_established.subscribe(Box::new(move |_| cb()));
    }

    pub fn on_data(&self, mut cb: impl FnMut(&[u8]) + 'static) {
        self.inner.on_data.subscribe(Box::new(move |d| cb(d)));
    }

    pub fn on_close(&self, mut cb: impl FnMut() + 'static) {
        self.inner.on_close.subscribe(Box::new(move |_| cb()));
    }

    /// Queue or send `bytes`. Before ESTABLISHED the bytes wait in the
    /// pre-established buffer; afterwards they are segmented and sent
    /// immediately.
    pub fn write(&self, bytes: &[u8]) -> Result<(), StackError> {
        if self.inner.shared.core.is_destroyed() {
            return Err(StackError::AdapterDestroyed);
        }
        match self.inner.state.get() {
            TcpState::Closed => Err(StackError::SocketClosed),
            TcpState::Established => {
                // Between ESTABLISHED and the deferred drain, new writes
                // must stay behind the buffered ones.
                if !self.inner.backlog.borrow().is_empty() {
                    self.inner.backlog.borrow_mut().push_back(bytes.to_vec());
                    return Ok(());
                }
                SocketInner::send_data(&self.inner, bytes)
            }
            _ => {
                self.inner.backlog.borrow_mut().push_back(bytes.to_vec());
                Ok(())
            }
        }
    }

    /// Emit FIN and drop to CLOSED. No FIN_WAIT states; see the module
    /// docs.
    pub fn close(&self) -> Result<(), StackError> {
        if self.inner.shared.core.is_destroyed() {
            return Err(StackError::AdapterDestroyed);
        }
        match self.inner.state.get() {
            TcpState::Closed => Ok(()),
            TcpState::Established => {
                let flags = TcpFlags {
                    fin: true,
                    ack: true,
                    ..TcpFlags::default()
                };
                let result = SocketInner::send_segment(&self.inner, flags, Vec::new());
                self.inner.transition_closed();
                result
            }
            _ => {
                self.inner.transition_closed();
                Ok(())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == TcpState::Closed
    }

    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    pub fn state(&self) -> TcpState {
        self.inner.state.get()
    }

    pub fn connection_string(&self) -> String {
        self.inner.key()
    }
}

type ListenerCallback = Rc<RefCell<Box<dyn FnMut(TcpSocket)>>>;

pub struct Tcp {
    shared: Rc<TcpShared>,
    sockets: RefCell<HashMap<String, Rc<SocketInner>>>,
    listeners: RefCell<HashMap<(Ipv4Address, u16), ListenerCallback>>,
}

impl Tcp {
    pub(crate) fn new(core: Rc<StackCore>, ipv4: Rc<Ipv4>) -> Rc<Tcp> {
        Rc::new(Tcp {
            shared: Rc::new(TcpShared { core, ipv4 }),
            sockets: RefCell::new(HashMap::new()),
            listeners: RefCell::new(HashMap::new()),
        })
    }

    /// Registered as an IPv4 subprotocol.
    pub(crate) fn handle_frame(&self, packet: &Ipv4Packet) -> bool {
        if packet.protocol != PROTO_TCP {
            return false;
        }
        let Some(segment) = TcpPacket::parse(packet.src, packet.dest, &packet.payload) else {
            return true;
        };
        tracing::trace!(
            src = %segment.src_ip,
            src_port = segment.src_port,
            dest = %segment.dest_ip,
            dest_port = segment.dest_port,
            seq = segment.seq,
            ack = segment.ack,
            len = segment.data.len(),
            "tcp rx"
        );
        self.dispatch(&segment);
        true
    }

    /// Route a segment to its socket, accepting a new connection if a
    /// listener owns the destination.
    fn dispatch(&self, segment: &TcpPacket) {
        let key = connection_key(
            segment.dest_ip,
            segment.dest_port,
            segment.src_ip,
            segment.src_port,
        );
        let existing = {
            let sockets = self.sockets.borrow();
            sockets
                .get(&key)
                .filter(|s| s.state.get() != TcpState::Closed)
                .cloned()
        };
        let sock = match existing {
            Some(sock) => sock,
            None => {
                let listener = self
                    .listeners
                    .borrow()
                    .get(&(segment.dest_ip, segment.dest_port))
                    .cloned();
                let Some(callback) = listener else {
                    tracing::debug!(%key, "no socket for segment");
                    return;
                };
                if segment.src_ip == segment.dest_ip && segment.src_port == segment.dest_port {
                    return;
                }
                let sock = SocketInner::new(
                    self.shared.clone(),
                    segment.dest_ip,
                    segment.src_ip,
                    segment.dest_port,
                    segment.src_port,
                    true,
                );
                sock.state.set(TcpState::Listen);
                self.sockets.borrow_mut().insert(key.clone(), sock.clone());
                tracing::debug!(%key, "accepting connection");
                {
                    let mut callback = callback.borrow_mut();
                    (*callback)(TcpSocket {
                        inner: sock.clone(),
                    });
                }
                sock
            }
        };
        SocketInner::handle_packet(&sock, segment);
    }

    pub(crate) fn connect(
        &self,
        src_ip: Ipv4Address,
        dest_ip: Ipv4Address,
        src_port: u16,
        dest_port: u16,
    ) -> Result<TcpSocket, StackError> {
        let key = connection_key(src_ip, src_port, dest_ip, dest_port);
        if let Some(existing) = self.sockets.borrow().get(&key) {
            if existing.state.get() != TcpState::Closed {
                return Err(StackError::ConnectionExists(key));
            }
        }
        let sock = SocketInner::new(self.shared.clone(), src_ip, dest_ip, src_port, dest_port, false);
        self.sockets.borrow_mut().insert(key.clone(), sock.clone());
        sock.state.set(TcpState::SynSent);
        let flags = TcpFlags {
            syn: true,
            ..TcpFlags::default()
        };
        if let Err(e) = SocketInner::send_segment(&sock, flags, Vec::new()) {
            self.sockets.borrow_mut().remove(&key);
            return Err(e);
        }
        Ok(TcpSocket { inner: sock })
    }

    pub(crate) fn listen(
        &self,
        ip: Ipv4Address,
        port: u16,
        callback: Box<dyn FnMut(TcpSocket)>,
    ) -> Result<(), StackError> {
        let mut listeners = self.listeners.borrow_mut();
        if listeners.contains_key(&(ip, port)) {
            return Err(StackError::ListenerExists(ip, port));
        }
        listeners.insert((ip, port), Rc::new(RefCell::new(callback)));
        Ok(())
    }

    /// Pre-registered server socket for one exact peer.
    pub(crate) fn listen_exact(
        &self,
        server_ip: Ipv4Address,
        client_ip: Ipv4Address,
        server_port: u16,
        client_port: u16,
    ) -> Result<TcpSocket, StackError> {
        let key = connection_key(server_ip, server_port, client_ip, client_port);
        if let Some(existing) = self.sockets.borrow().get(&key) {
            if existing.state.get() != TcpState::Closed {
                return Err(StackError::ConnectionExists(key));
            }
        }
        let sock = SocketInner::new(
            self.shared.clone(),
            server_ip,
            client_ip,
            server_port,
            client_port,
            true,
        );
        sock.state.set(TcpState::Listen);
        self.sockets.borrow_mut().insert(key, sock.clone());
        Ok(TcpSocket { inner: sock })
    }

    pub(crate) fn clear_subscriptions(&self) {
        for sock in self.sockets.borrow().values() {
            sock.on_established.clear();
            sock.on_data.clear();
            sock.on_close.clear();
        }
        self.sockets.borrow_mut().clear();
        self.listeners.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TcpPacket {
        TcpPacket {
            src_ip: Ipv4Address::new(192, 168, 0, 5),
            dest_ip: Ipv4Address::new(192, 168, 13, 37),
            src_port: 50000,
            dest_port: 5432,
            seq: 1000,
            ack: 2000,
            flags: TcpFlags {
                ack: true,
                psh: true,
                ..TcpFlags::default()
            },
            window: WINDOW,
            urgent: 0,
            options: Vec::new(),
            data: b"SELECT 1;".to_vec(),
        }
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let packet = sample();
        let parsed = TcpPacket::parse(packet.src_ip, packet.dest_ip, &packet.encode()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_flags_roundtrip() {
        let mut packet = sample();
        packet.flags = TcpFlags {
            ns: true,
            cwr: true,
            ece: true,
            urg: true,
            ack: true,
            psh: false,
            rst: true,
            syn: true,
            fin: true,
        };
        let parsed = TcpPacket::parse(packet.src_ip, packet.dest_ip, &packet.encode()).unwrap();
        assert_eq!(parsed.flags, packet.flags);
    }

    #[test]
    fn test_options_padded_to_word_boundary() {
        let mut packet = sample();
        packet.options = vec![2, 4, 0x05, 0xb4, 1];
        let bytes = packet.encode();
        let offset = ((bytes[12] >> 4) as usize) * 4;
        assert_eq!(offset, 28);
        let parsed = TcpPacket::parse(packet.src_ip, packet.dest_ip, &bytes).unwrap();
        assert_eq!(&parsed.options[..5], &packet.options[..]);
        assert_eq!(parsed.data, packet.data);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let packet = sample();
        let mut bytes = packet.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(TcpPacket::parse(packet.src_ip, packet.dest_ip, &bytes).is_none());
    }

    #[test]
    fn test_initial_sequence_shape() {
        for _ in 0..64 {
            let isn = initial_sequence();
            assert!(isn < 1 << 30);
            assert_eq!(isn % 100, 0);
        }
    }

    #[test]
    fn test_connection_key_format() {
        let key = connection_key(
            Ipv4Address::new(192, 168, 0, 5),
            50000,
            Ipv4Address::new(192, 168, 13, 37),
            5432,
        );
        assert_eq!(key, "192.168.0.5:50000 -> 192.168.13.37:5432");
    }

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(!seq_lt(0x10, 0xffff_fff0));
        assert!(seq_lte(5, 5));
        assert!(!seq_lt(5, 5));
    }
}
