//! Device registry and address allocation for the virtual subnet.
//!
//! The router owns the `ip -> mac` and `mac -> device` tables consulted
//! by the IPv4 emitter and served by the ARP and DHCP responders. It
//! registers itself through the ordinary allocation path, so the first
//! host address of the subnet always answers with the router's MAC.

use crate::addr::{Ipv4Address, MacAddress};
use crate::config::StackConfig;
use crate::error::StackError;
use std::collections::HashMap;

/// One entry in the router's device table. Never removed during the
/// adapter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    /// Set once the device completes DHCP REQUEST (not merely DISCOVER).
    pub confirmed: bool,
}

pub struct Router {
    mac: MacAddress,
    ip: Ipv4Address,
    subnet_mask: Ipv4Address,
    ip_to_mac: HashMap<Ipv4Address, MacAddress>,
    devices: HashMap<MacAddress, Device>,
}

impl Router {
    /// Fails when the configured subnet has no free host address for the
    /// router itself (a /31 or /32 mask).
    pub fn new(config: &StackConfig) -> Result<Router, StackError> {
        let mut router = Router {
            mac: config.router_mac,
            ip: config.router_ip,
            subnet_mask: config.subnet_mask,
            ip_to_mac: HashMap::new(),
            devices: HashMap::new(),
        };
        // The fixed router address resolves to the router MAC without
        // occupying a device slot.
        router.ip_to_mac.insert(router.ip, router.mac);
        let device = router.register_device(config.router_mac)?;
        router.confirm(device.mac);
        Ok(router)
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn ip(&self) -> Ipv4Address {
        self.ip
    }

    pub fn subnet_mask(&self) -> Ipv4Address {
        self.subnet_mask
    }

    pub fn network(&self) -> Ipv4Address {
        self.ip & self.subnet_mask
    }

    /// Register `mac`, allocating the next free in-subnet address.
    /// Idempotent for a MAC that is already registered.
    pub fn register_device(&mut self, mac: MacAddress) -> Result<Device, StackError> {
        if let Some(existing) = self.devices.get(&mac) {
            return Ok(*existing);
        }
        let ip = self.allocate_ip().ok_or(StackError::PoolExhausted {
            network: self.network(),
        })?;
        let device = Device {
            mac,
            ip,
            confirmed: false,
        };
        self.ip_to_mac.insert(ip, mac);
        self.devices.insert(mac, device);
        tracing::debug!(%mac, %ip, "device registered");
        Ok(device)
    }

    pub fn get_or_register_device(&mut self, mac: MacAddress) -> Result<Device, StackError> {
        self.register_device(mac)
    }

    pub fn device_by_mac(&self, mac: MacAddress) -> Option<Device> {
        self.devices.get(&mac).copied()
    }

    pub fn device_by_ip(&self, ip: Ipv4Address) -> Option<Device> {
        let mac = self.ip_to_mac.get(&ip)?;
        self.devices.get(mac).copied()
    }

    pub fn confirm(&mut self, mac: MacAddress) {
        if let Some(device) = self.devices.get_mut(&mac) {
            device.confirmed = true;
        }
    }

    /// Next-hop MAC for `ip`: the limited broadcast maps to the broadcast
    /// MAC, everything else to the owning device.
    pub fn resolve(&self, ip: Ipv4Address) -> Option<MacAddress> {
        if ip.is_broadcast() {
            return Some(MacAddress::BROADCAST);
        }
        self.ip_to_mac.get(&ip).copied()
    }

    /// Scan the subnet linearly for a free host address, skipping the
    /// network address, the directed broadcast and anything assigned.
    fn allocate_ip(&self) -> Option<Ipv4Address> {
        let network = u32::from(self.network());
        let broadcast = u32::from(self.network() | !self.subnet_mask);
        for candidate in (network + 1)..broadcast {
            let ip = Ipv4Address::from(candidate);
            if !self.ip_to_mac.contains_key(&ip) {
                return Some(ip);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StackConfig {
        StackConfig::default()
    }

    #[test]
    fn test_router_is_first_device() {
        let router = Router::new(&test_config()).unwrap();
        let device = router.device_by_mac(router.mac()).unwrap();
        assert_eq!(device.ip, Ipv4Address::new(192, 168, 0, 1));
        assert!(device.confirmed);
        assert_eq!(router.resolve(Ipv4Address::new(192, 168, 0, 1)), Some(router.mac()));
        assert_eq!(router.resolve(router.ip()), Some(router.mac()));
    }

    #[test]
    fn test_allocation_unique_and_in_range() {
        let mut router = Router::new(&test_config()).unwrap();
        let network = router.network();
        let broadcast = network | !router.subnet_mask();
        let mut seen = std::collections::HashSet::new();
        seen.insert(router.device_by_mac(router.mac()).unwrap().ip);
        for i in 0..64u8 {
            let mac = MacAddress([0x02, 0, 0, 0, 0, i]);
            let device = router.register_device(mac).unwrap();
            assert_ne!(device.ip, network);
            assert_ne!(device.ip, broadcast);
            assert_eq!(device.ip & router.subnet_mask(), network);
            assert!(seen.insert(device.ip), "duplicate ip {}", device.ip);
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut router = Router::new(&test_config()).unwrap();
        let mac = MacAddress([0x02, 0, 0, 0, 0, 1]);
        let first = router.register_device(mac).unwrap();
        let second = router.get_or_register_device(mac).unwrap();
        assert_eq!(first.ip, second.ip);
    }

    #[test]
    fn test_confirm_flag() {
        let mut router = Router::new(&test_config()).unwrap();
        let mac = MacAddress([0x02, 0, 0, 0, 0, 1]);
        assert!(!router.register_device(mac).unwrap().confirmed);
        router.confirm(mac);
        assert!(router.device_by_mac(mac).unwrap().confirmed);
    }

    #[test]
    fn test_pool_exhaustion() {
        let config = StackConfig {
            router_ip: Ipv4Address::new(10, 0, 0, 1),
            subnet_mask: Ipv4Address::new(255, 255, 255, 248),
            ping_server: Ipv4Address::new(10, 0, 0, 1),
            ..StackConfig::default()
        };
        // /29: six host addresses, one taken by the router itself and one
        // by its fixed address.
        let mut router = Router::new(&config).unwrap();
        let mut registered = 0;
        for i in 0..8u8 {
            match router.register_device(MacAddress([0x02, 0, 0, 0, 1, i])) {
                Ok(_) => registered += 1,
                Err(StackError::PoolExhausted { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(registered, 4);
    }

    #[test]
    fn test_unknown_ip_unresolved() {
        let router = Router::new(&test_config()).unwrap();
        assert_eq!(router.resolve(Ipv4Address::new(192, 168, 0, 99)), None);
        assert_eq!(router.resolve(Ipv4Address::BROADCAST), Some(MacAddress::BROADCAST));
    }
}
