//! DHCP message codec and the router's DHCP server.

use crate::addr::{Ipv4Address, MacAddress};
use crate::router::Router;
use crate::udp::{Udp, UdpDatagram};
use byteorder::{ByteOrder, NetworkEndian};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

pub const MAGIC_COOKIE: u32 = 0x6382_5363;

pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST: u8 = 28;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;

pub const MSG_DISCOVER: u8 = 1;
pub const MSG_OFFER: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_ACK: u8 = 5;

const FIXED_LEN: usize = 236;
const OPTIONS_START: usize = FIXED_LEN + 4;
const LEASE_SECONDS: u32 = 86_400;
const HOST_NAME: &str = "emulatorhost";

/// One option TLV. Unknown codes pass through decode/encode untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

/// A decoded DHCP message (BOOTP framing with the DHCP magic cookie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub operation: u8,
    pub hardware_type: u8,
    pub hardware_size: u8,
    pub xid: u32,
    pub seconds: u16,
    pub flags: u16,
    pub client_ip: Ipv4Address,
    pub your_ip: Ipv4Address,
    pub server_ip: Ipv4Address,
    pub gateway_ip: Ipv4Address,
    pub client_mac: MacAddress,
    pub server_name: String,
    pub boot_file: String,
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    pub fn parse(bytes: &[u8]) -> Option<DhcpMessage> {
        if bytes.len() < OPTIONS_START {
            tracing::warn!(len = bytes.len(), "short dhcp message");
            return None;
        }
        let hardware_type = bytes[1];
        let hardware_size = bytes[2];
        if hardware_type != 1 || hardware_size != 6 {
            tracing::warn!(hardware_type, hardware_size, "unsupported dhcp hardware");
            return None;
        }
        if NetworkEndian::read_u32(&bytes[FIXED_LEN..FIXED_LEN + 4]) != MAGIC_COOKIE {
            tracing::warn!("missing dhcp magic cookie");
            return None;
        }
        let mut client_mac = [0u8; 6];
        client_mac.copy_from_slice(&bytes[28..34]);

        let mut options = Vec::new();
        let opts = &bytes[OPTIONS_START..];
        let mut i = 0;
        while i < opts.len() {
            let code = opts[i];
            if code == 255 {
                break;
            }
            if code == 0 {
                i += 1;
                continue;
            }
            if i + 1 >= opts.len() {
                tracing::warn!(code, "truncated dhcp option");
                return None;
            }
            let len = opts[i + 1] as usize;
            if i + 2 + len > opts.len() {
                tracing::warn!(code, len, "truncated dhcp option");
                return None;
            }
            options.push(DhcpOption {
                code,
                data: opts[i + 2..i + 2 + len].to_vec(),
            });
            i += 2 + len;
        }

        Some(DhcpMessage {
            operation: bytes[0],
            hardware_type,
            hardware_size,
            xid: NetworkEndian::read_u32(&bytes[4..8]),
            seconds: NetworkEndian::read_u16(&bytes[8..10]),
            flags: NetworkEndian::read_u16(&bytes[10..12]),
            client_ip: Ipv4Address([bytes[12], bytes[13], bytes[14], bytes[15]]),
            your_ip: Ipv4Address([bytes[16], bytes[17], bytes[18], bytes[19]]),
            server_ip: Ipv4Address([bytes[20], bytes[21], bytes[22], bytes[23]]),
            gateway_ip: Ipv4Address([bytes[24], bytes[25], bytes[26], bytes[27]]),
            client_mac: MacAddress(client_mac),
            server_name: fixed_text(&bytes[44..108]),
            boot_file: fixed_text(&bytes[108..236]),
            options,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; OPTIONS_START];
        buf[0] = self.operation;
        buf[1] = self.hardware_type;
        buf[2] = self.hardware_size;
        NetworkEndian::write_u32(&mut buf[4..8], self.xid);
        NetworkEndian::write_u16(&mut buf[8..10], self.seconds);
        NetworkEndian::write_u16(&mut buf[10..12], self.flags);
        buf[12..16].copy_from_slice(&self.client_ip.octets());
        buf[16..20].copy_from_slice(&self.your_ip.octets());
        buf[20..24].copy_from_slice(&self.server_ip.octets());
        buf[24..28].copy_from_slice(&self.gateway_ip.octets());
        buf[28..34].copy_from_slice(&self.client_mac.octets());
        write_fixed_text(&mut buf[44..108], &self.server_name);
        write_fixed_text(&mut buf[108..236], &self.boot_file);
        NetworkEndian::write_u32(&mut buf[FIXED_LEN..FIXED_LEN + 4], MAGIC_COOKIE);
        for option in &self.options {
            buf.push(option.code);
            buf.push(option.data.len() as u8);
            buf.extend_from_slice(&option.data);
        }
        buf.push(255);
        buf
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    pub fn message_type(&self) -> Option<u8> {
        self.option(OPT_MESSAGE_TYPE).and_then(|d| d.first().copied())
    }
}

fn fixed_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_text(slot: &mut [u8], text: &str) {
    // Leave at least one NUL terminator.
    let n = text.len().min(slot.len() - 1);
    slot[..n].copy_from_slice(&text.as_bytes()[..n]);
}

/// The router's DHCP server: allocates addresses out of the device table
/// for DISCOVER and confirms them on REQUEST.
pub(crate) struct RouterDhcp {
    pub(crate) router: Rc<RefCell<Router>>,
    pub(crate) udp: Weak<Udp>,
}

impl RouterDhcp {
    /// Registered as a UDP responder subprotocol.
    pub(crate) fn handle(&self, datagram: &UdpDatagram) -> bool {
        let router_ip = self.router.borrow().ip();
        if datagram.dest_port != SERVER_PORT {
            return false;
        }
        if datagram.dest_ip != router_ip && !datagram.dest_ip.is_broadcast() {
            return false;
        }
        // Our own replies loop back through the dispatcher.
        if datagram.src_ip == router_ip {
            return true;
        }
        let Some(request) = DhcpMessage::parse(&datagram.payload) else {
            return true;
        };
        if request.operation != OP_BOOTREQUEST {
            return true;
        }
        match request.message_type() {
            Some(MSG_DISCOVER) => self.reply(&request, MSG_OFFER),
            Some(MSG_REQUEST) => self.reply(&request, MSG_ACK),
            other => {
                tracing::debug!(message_type = ?other, "ignored dhcp message");
            }
        }
        true
    }

    fn reply(&self, request: &DhcpMessage, reply_type: u8) {
        let (router_ip, subnet_mask, device) = {
            let mut router = self.router.borrow_mut();
            let device = match router.get_or_register_device(request.client_mac) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!(error = %e, mac = %request.client_mac, "dhcp allocation failed");
                    return;
                }
            };
            if reply_type == MSG_ACK {
                router.confirm(request.client_mac);
            }
            (router.ip(), router.subnet_mask(), device)
        };

        let reply = DhcpMessage {
            operation: OP_BOOTREPLY,
            hardware_type: 1,
            hardware_size: 6,
            xid: request.xid,
            seconds: 0,
            flags: request.flags,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: device.ip,
            server_ip: router_ip,
            gateway_ip: Ipv4Address::UNSPECIFIED,
            client_mac: request.client_mac,
            server_name: String::new(),
            boot_file: String::new(),
            options: vec![
                DhcpOption {
                    code: OPT_MESSAGE_TYPE,
                    data: vec![reply_type],
                },
                DhcpOption {
                    code: OPT_SUBNET_MASK,
                    data: subnet_mask.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_ROUTER,
                    data: router_ip.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_DNS,
                    data: router_ip.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_HOST_NAME,
                    data: HOST_NAME.as_bytes().to_vec(),
                },
                DhcpOption {
                    code: OPT_DOMAIN_NAME,
                    data: HOST_NAME.as_bytes().to_vec(),
                },
                DhcpOption {
                    code: OPT_BROADCAST,
                    data: Ipv4Address::BROADCAST.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_LEASE_TIME,
                    data: LEASE_SECONDS.to_be_bytes().to_vec(),
                },
                DhcpOption {
                    code: OPT_SERVER_ID,
                    data: router_ip.octets().to_vec(),
                },
            ],
        };

        tracing::debug!(
            reply = if reply_type == MSG_OFFER { "OFFER" } else { "ACK" },
            mac = %request.client_mac,
            ip = %device.ip,
            "dhcp reply"
        );

        let Some(udp) = self.udp.upgrade() else {
            return;
        };
        let datagram = UdpDatagram {
            src_ip: router_ip,
            dest_ip: Ipv4Address::BROADCAST,
            src_port: SERVER_PORT,
            dest_port: CLIENT_PORT,
            payload: reply.encode(),
        };
        if let Err(e) = udp.send(&datagram) {
            tracing::error!(error = %e, "failed to emit dhcp reply");
        }
    }
}
