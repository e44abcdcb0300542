//! Stack configuration shared between the adapter and its embedder.

use crate::addr::{Ipv4Address, MacAddress};
use serde::{Deserialize, Serialize};

/// Configuration for one adapter instance.
///
/// The defaults are the fixed network the emulator boots into; embedders
/// that need a different subnet can deserialize their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub router_mac: MacAddress,
    pub router_ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
    /// Address the ICMP layer answers echo requests for.
    pub ping_server: Ipv4Address,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            router_mac: MacAddress([0x00, 0x0c, 0x13, 0x37, 0x42, 0x69]),
            router_ip: Ipv4Address::new(192, 168, 13, 37),
            subnet_mask: Ipv4Address::new(255, 255, 0, 0),
            ping_server: Ipv4Address::new(192, 168, 13, 37),
        }
    }
}
