//! User-space virtual network stack for an emulator-hosted PostgreSQL.
//!
//! The emulator exposes a virtual Ethernet NIC as a byte bus; this crate
//! terminates enough of the Internet suite on top of it (Ethernet, ARP,
//! IPv4, ICMP, UDP + DHCP, TCP) for a standard wire-protocol client to
//! reach the server inside the guest, with no kernel sockets anywhere.
//!
//! Everything runs single-threaded and cooperative: frames dispatch to
//! completion, and the only timers are TCP retransmission and deferred
//! establishment callbacks, driven through [`Adapter::poll`].
//!
//! ```no_run
//! use std::rc::Rc;
//! use vnet::{Adapter, StackConfig};
//!
//! # fn bus() -> Rc<dyn vnet::EmulatorBus> { unimplemented!() }
//! let adapter = Adapter::attach(bus(), StackConfig::default())?;
//! let client = adapter.register_device("02:00:00:00:00:01".parse()?).unwrap();
//! let sock = adapter.connect(client.ip, "192.168.0.1".parse()?, 50000, 5432)?;
//! sock.on_established(|| println!("connected"));
//! sock.write(b"startup")?;
//! # Ok::<(), vnet::StackError>(())
//! ```

pub mod addr;
pub mod arp;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod eth;
pub mod icmp;
pub mod ipv4;
pub mod pcap;
pub mod pipeline;
pub mod router;
pub mod stack;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod wire;

pub use addr::{Ipv4Address, MacAddress};
pub use config::StackConfig;
pub use error::StackError;
pub use icmp::Ping;
pub use router::Device;
pub use stack::{Adapter, EmulatorBus, NET_RECEIVE_CHANNEL, NET_SEND_CHANNEL};
pub use tcp::{TcpSocket, TcpState};
