//! The adapter: bus wiring, dispatch loop and lifecycle.
//!
//! Inbound frames (from the emulator NIC and from our own looped-back
//! emissions) land in a pending queue and are dispatched one at a time,
//! run to completion. Outbound frames are written to the bus *and*
//! appended to the same queue, so local sockets can talk to the
//! emulator-side endpoints through one stack.

use crate::addr::{Ipv4Address, MacAddress};
use crate::arp::{Arp, RouterArp};
use crate::config::StackConfig;
use crate::dhcp::RouterDhcp;
use crate::error::StackError;
use crate::eth::{Ethernet, EthernetFrame, ETHERTYPE_IPV6};
use crate::icmp::{Icmp, Ping};
use crate::ipv4::Ipv4;
use crate::pcap::PcapStream;
use crate::router::{Device, Router};
use crate::tcp::{Tcp, TcpSocket};
use crate::timer::{TimerQueue, TimerTask};
use crate::udp::Udp;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Bus channel carrying frames out of the emulator NIC.
pub const NET_SEND_CHANNEL: &str = "net0-send";
/// Bus channel carrying frames into the emulator NIC.
pub const NET_RECEIVE_CHANNEL: &str = "net0-receive";

/// The byte bus exposed by the emulator. Handlers receive whole
/// Ethernet frames; there is no further framing.
pub trait EmulatorBus {
    fn register(&self, channel: &str, handler: Box<dyn FnMut(&[u8])>);
    fn send(&self, channel: &str, bytes: &[u8]);
}

/// Shared plumbing every layer reaches through: the bus, the pending
/// frame queue, the timer queue and the lifecycle flags.
pub(crate) struct StackCore {
    bus: RefCell<Option<Rc<dyn EmulatorBus>>>,
    now: Cell<Instant>,
    destroyed: Cell<bool>,
    dispatching: Cell<bool>,
    teardown_pending: Cell<bool>,
    pending: RefCell<VecDeque<Vec<u8>>>,
    timers: RefCell<TimerQueue>,
    capture: RefCell<Option<PcapStream>>,
    packet_ids: Cell<u64>,
    eth: RefCell<Weak<Ethernet>>,
    teardown: RefCell<Option<Box<dyn Fn()>>>,
}

impl StackCore {
    fn new(bus: Rc<dyn EmulatorBus>) -> Rc<StackCore> {
        Rc::new(StackCore {
            bus: RefCell::new(Some(bus)),
            now: Cell::new(Instant::now()),
            destroyed: Cell::new(false),
            dispatching: Cell::new(false),
            teardown_pending: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerQueue::new()),
            capture: RefCell::new(None),
            packet_ids: Cell::new(0),
            eth: RefCell::new(Weak::new()),
            teardown: RefCell::new(None),
        })
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Monotonic identity for retransmission scheduling.
    pub(crate) fn next_packet_id(&self) -> u64 {
        let id = self.packet_ids.get();
        self.packet_ids.set(id + 1);
        id
    }

    pub(crate) fn schedule(&self, delay: Duration, task: TimerTask) {
        if self.destroyed.get() {
            return;
        }
        self.timers
            .borrow_mut()
            .schedule(self.now.get() + delay, task);
    }

    pub(crate) fn record_capture(&self, bytes: &[u8]) {
        if let Some(stream) = self.capture.borrow_mut().as_mut() {
            stream.record(bytes);
        }
    }

    /// Write a serialized frame to the bus and loop it back into the
    /// local dispatcher.
    pub(crate) fn transmit(&self, bytes: Vec<u8>) -> Result<(), StackError> {
        if self.destroyed.get() {
            return Err(StackError::AdapterDestroyed);
        }
        if let Some(bus) = self.bus.borrow().as_ref() {
            bus.send(NET_RECEIVE_CHANNEL, &bytes);
        }
        self.pending.borrow_mut().push_back(bytes);
        self.drain();
        Ok(())
    }

    /// Entry point for frames arriving from the bus.
    fn ingest(&self, bytes: Vec<u8>) {
        if self.destroyed.get() {
            return;
        }
        self.pending.borrow_mut().push_back(bytes);
        self.drain();
    }

    /// Dispatch queued frames until the queue empties. Re-entrant calls
    /// (a handler emitting mid-dispatch) only enqueue; the outermost
    /// drain keeps run-to-completion semantics.
    fn drain(&self) {
        if self.dispatching.get() {
            return;
        }
        self.dispatching.set(true);
        while !self.destroyed.get() {
            let frame = self.pending.borrow_mut().pop_front();
            let Some(frame) = frame else { break };
            if let Some(eth) = self.eth.borrow().upgrade() {
                eth.handle_raw(&frame);
            }
        }
        self.dispatching.set(false);
        if self.teardown_pending.take() {
            self.run_teardown();
        }
    }

    fn poll(&self, now: Instant) {
        if self.destroyed.get() {
            return;
        }
        // Clamp monotonic: a stale `now` never moves time backwards.
        if now > self.now.get() {
            self.now.set(now);
        }
        loop {
            let due = self.timers.borrow_mut().take_due(self.now.get());
            if due.is_empty() {
                break;
            }
            for task in due {
                if self.destroyed.get() {
                    return;
                }
                task();
            }
        }
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.timers.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        *self.bus.borrow_mut() = None;
        *self.capture.borrow_mut() = None;
        if self.dispatching.get() {
            self.teardown_pending.set(true);
        } else {
            self.run_teardown();
        }
    }

    fn run_teardown(&self) {
        if let Some(teardown) = self.teardown.borrow().as_ref() {
            teardown();
        }
    }
}

/// The top-level object: owns the protocol tree, the bus handle and the
/// capture state.
pub struct Adapter {
    core: Rc<StackCore>,
    config: StackConfig,
    router: Rc<RefCell<Router>>,
    icmp: Rc<Icmp>,
    tcp: Rc<Tcp>,
    // Held for ownership: the dispatch hooks only keep weak references.
    _arp: Rc<Arp>,
    _udp: Rc<Udp>,
}

impl Adapter {
    /// Build the protocol tree and register on the bus. Fails when the
    /// configured subnet cannot hold the router's own address.
    pub fn attach(bus: Rc<dyn EmulatorBus>, config: StackConfig) -> Result<Adapter, StackError> {
        let core = StackCore::new(bus.clone());
        let router = Rc::new(RefCell::new(Router::new(&config)?));

        let eth = Ethernet::new(core.clone());
        *core.eth.borrow_mut() = Rc::downgrade(&eth);
        let arp = Arp::new(eth.clone());
        let ipv4 = Ipv4::new(eth.clone(), router.clone());
        let icmp = Icmp::new(ipv4.clone(), config.ping_server);
        let udp = Udp::new(ipv4.clone());
        let tcp = Tcp::new(core.clone(), ipv4.clone());

        // Capture tap: every frame entering the dispatcher.
        {
            let core = Rc::downgrade(&core);
            eth.on_receive_frame.subscribe(Box::new(move |bytes: &[u8]| {
                if let Some(core) = core.upgrade() {
                    core.record_capture(bytes);
                }
            }));
        }

        // Ethernet subprotocols, in dispatch order.
        {
            let arp = Rc::downgrade(&arp);
            eth.subprotocols.register(Box::new(move |frame: &EthernetFrame| {
                arp.upgrade().map_or(false, |a| a.handle_frame(frame))
            }));
        }
        {
            let ipv4 = Rc::downgrade(&ipv4);
            eth.subprotocols.register(Box::new(move |frame: &EthernetFrame| {
                ipv4.upgrade().map_or(false, |i| i.handle_frame(frame))
            }));
        }
        eth.subprotocols.register(Box::new(|frame: &EthernetFrame| {
            if frame.ethertype == ETHERTYPE_IPV6 {
                tracing::trace!("ipv6 frame blackholed");
                true
            } else {
                false
            }
        }));

        // The router answers ARP ahead of any client decode.
        {
            let responder = RouterArp {
                router: router.clone(),
                arp: Rc::downgrade(&arp),
            };
            arp.responders
                .register(Box::new(move |frame| responder.handle(frame)));
        }

        // IPv4 subprotocols.
        {
            let icmp = Rc::downgrade(&icmp);
            ipv4.subprotocols
                .register(Box::new(move |p| icmp.upgrade().map_or(false, |i| i.handle_frame(p))));
        }
        {
            let udp = Rc::downgrade(&udp);
            ipv4.subprotocols
                .register(Box::new(move |p| udp.upgrade().map_or(false, |u| u.handle_frame(p))));
        }
        {
            let tcp = Rc::downgrade(&tcp);
            ipv4.subprotocols
                .register(Box::new(move |p| tcp.upgrade().map_or(false, |t| t.handle_frame(p))));
        }

        // The router's DHCP server claims port 67.
        {
            let responder = RouterDhcp {
                router: router.clone(),
                udp: Rc::downgrade(&udp),
            };
            udp.responders
                .register(Box::new(move |datagram| responder.handle(datagram)));
        }

        // Frames out of the emulator enter the dispatcher.
        {
            let core = Rc::downgrade(&core);
            bus.register(
                NET_SEND_CHANNEL,
                Box::new(move |bytes| {
                    if let Some(core) = core.upgrade() {
                        core.ingest(bytes.to_vec());
                    }
                }),
            );
        }

        // Recursive subscription teardown for destroy().
        {
            let eth = Rc::downgrade(&eth);
            let arp = Rc::downgrade(&arp);
            let ipv4 = Rc::downgrade(&ipv4);
            let icmp = Rc::downgrade(&icmp);
            let udp = Rc::downgrade(&udp);
            let tcp = Rc::downgrade(&tcp);
            *core.teardown.borrow_mut() = Some(Box::new(move || {
                if let Some(eth) = eth.upgrade() {
                    eth.clear_subscriptions();
                }
                if let Some(arp) = arp.upgrade() {
                    arp.clear_subscriptions();
                }
                if let Some(ipv4) = ipv4.upgrade() {
                    ipv4.clear_subscriptions();
                }
                if let Some(icmp) = icmp.upgrade() {
                    icmp.clear_subscriptions();
                }
                if let Some(udp) = udp.upgrade() {
                    udp.clear_subscriptions();
                }
                if let Some(tcp) = tcp.upgrade() {
                    tcp.clear_subscriptions();
                }
            }));
        }

        tracing::info!(
            router_ip = %config.router_ip,
            router_mac = %config.router_mac,
            "adapter attached"
        );

        Ok(Adapter {
            core,
            config,
            router,
            icmp,
            tcp,
            _arp: arp,
            _udp: udp,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Advance the stack's clock and run every due timer (TCP
    /// retransmissions, deferred establishment). Drive this from the
    /// embedding event loop.
    pub fn poll(&self, now: Instant) {
        self.core.poll(now);
    }

    /// Earliest pending timer, for precise sleeping in a driving loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.borrow().next_deadline()
    }

    fn ensure_alive(&self) -> Result<(), StackError> {
        if self.core.is_destroyed() {
            Err(StackError::AdapterDestroyed)
        } else {
            Ok(())
        }
    }

    /// Register a host-side endpoint (boot sequence plumbing).
    pub fn register_device(&self, mac: MacAddress) -> Result<Device, StackError> {
        self.ensure_alive()?;
        self.router.borrow_mut().register_device(mac)
    }

    pub fn device_by_mac(&self, mac: MacAddress) -> Option<Device> {
        self.router.borrow().device_by_mac(mac)
    }

    pub fn device_by_ip(&self, ip: Ipv4Address) -> Option<Device> {
        self.router.borrow().device_by_ip(ip)
    }

    pub fn connect(
        &self,
        src_ip: Ipv4Address,
        dest_ip: Ipv4Address,
        src_port: u16,
        dest_port: u16,
    ) -> Result<TcpSocket, StackError> {
        self.ensure_alive()?;
        self.tcp.connect(src_ip, dest_ip, src_port, dest_port)
    }

    /// At most one listener per (ip, port).
    pub fn listen(
        &self,
        ip: Ipv4Address,
        port: u16,
        callback: impl FnMut(TcpSocket) + 'static,
    ) -> Result<(), StackError> {
        self.ensure_alive()?;
        self.tcp.listen(ip, port, Box::new(callback))
    }

    pub fn listen_exact(
        &self,
        server_ip: Ipv4Address,
        client_ip: Ipv4Address,
        server_port: u16,
        client_port: u16,
    ) -> Result<TcpSocket, StackError> {
        self.ensure_alive()?;
        self.tcp
            .listen_exact(server_ip, client_ip, server_port, client_port)
    }

    /// Liveness probe; the future resolves when the echo reply arrives.
    pub fn ping(&self, src_ip: Ipv4Address, dest_ip: Ipv4Address) -> Result<Ping, StackError> {
        self.ensure_alive()?;
        self.icmp.ping(src_ip, dest_ip)
    }

    pub fn start_capture(&self) -> Result<(), StackError> {
        self.ensure_alive()?;
        *self.core.capture.borrow_mut() = Some(PcapStream::new());
        Ok(())
    }

    /// Stop capturing and return the pcap buffer, if a capture was
    /// running.
    pub fn stop_capture(&self) -> Option<Vec<u8>> {
        self.core.capture.borrow_mut().take().map(PcapStream::finish)
    }

    /// Tear down every handler and release the bus. The adapter refuses
    /// all further operations.
    pub fn destroy(&self) {
        tracing::info!("adapter destroyed");
        self.core.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }
}
