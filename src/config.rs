//! Compile-time stack configuration.
//!
//! This bundles the values spec'd as "compile-time constants" in the
//! original design — local addressing, port, buffer sizes, and timeouts —
//! into a single value instead of scattering them as module-level consts,
//! so a single binary can be built for more than one device without
//! touching the engine's source.

use crate::wire::{EthernetAddress, Ipv4Address};

/// Default number of ticks (~262 ms each) to wait for a reply before
/// retransmitting.
pub const DEFAULT_RETRY_TIMEOUT: u16 = 8; // ~2.1s
/// Default number of ticks to linger in a FIN-driven wait state.
pub const DEFAULT_FIN_TIMEOUT: u16 = 40; // ~10.5s
/// Default number of retransmissions before giving up.
pub const DEFAULT_MAX_RETRYS: u8 = 5;
/// Default IPv4 TTL stamped on every emitted datagram.
pub const DEFAULT_TTL: u8 = 64;

/// Stack-wide configuration: addressing, buffer sizes, and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub local_mac: EthernetAddress,
    pub local_ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
    pub gateway_ip: Ipv4Address,
    pub local_port: u16,

    /// Capacity of the single in-flight TCP receive payload buffer.
    pub max_tcp_rx_data_size: usize,
    /// Capacity of the single in-flight TCP transmit payload buffer.
    pub max_tcp_tx_data_size: usize,
    /// `tx2`'s frame budget beyond the Ethernet header: IP + ICMP/TCP
    /// headers and payload together.
    pub max_eth_tx_data_size: usize,

    /// Ticks to wait before retransmitting an unacknowledged control/data
    /// frame.
    pub retry_timeout: u16,
    /// Ticks to linger in `FIN_WAIT_2`/`TIME_WAIT` before forcing `CLOSED`.
    pub fin_timeout: u16,
    /// Maximum number of retransmissions before the connection is
    /// abandoned.
    pub max_retrys: u8,
    /// IPv4 TTL stamped on every emitted datagram.
    pub default_ttl: u8,
}

impl Config {
    /// Build a `Config` with the spec's default timeouts, for the given
    /// addressing and buffer sizes.
    pub const fn new(
        local_mac: EthernetAddress,
        local_ip: Ipv4Address,
        subnet_mask: Ipv4Address,
        gateway_ip: Ipv4Address,
        local_port: u16,
        max_tcp_rx_data_size: usize,
        max_tcp_tx_data_size: usize,
        max_eth_tx_data_size: usize,
    ) -> Config {
        Config {
            local_mac,
            local_ip,
            subnet_mask,
            gateway_ip,
            local_port,
            max_tcp_rx_data_size,
            max_tcp_tx_data_size,
            max_eth_tx_data_size,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            fin_timeout: DEFAULT_FIN_TIMEOUT,
            max_retrys: DEFAULT_MAX_RETRYS,
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Does `addr` fall outside our local subnet, i.e. does it need to be
    /// routed via `gateway_ip` rather than resolved directly?
    pub fn needs_gateway(&self, addr: Ipv4Address) -> bool {
        let mask = self.subnet_mask.to_bits();
        (addr.to_bits() ^ self.local_ip.to_bits()) & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config::new(
            EthernetAddress([0x02, 0, 0, 0, 0, 1]),
            Ipv4Address::new(192, 168, 1, 2),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
            80,
            512,
            512,
            512,
        )
    }

    #[test]
    fn needs_gateway_for_off_subnet_target() {
        let config = sample_config();
        assert!(config.needs_gateway(Ipv4Address::new(10, 0, 0, 5)));
        assert!(!config.needs_gateway(Ipv4Address::new(192, 168, 1, 99)));
    }
}
