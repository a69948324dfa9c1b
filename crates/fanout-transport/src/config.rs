//! # Endpoint Configuration
//!
//! Plain config structs with serde derives so daemons can load them from
//! TOML. Validation happens once, at endpoint construction; a rejected
//! config is the only startup-fatal error in the crate.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::{Result, TransportError};
use crate::wire::HEADER_LEN;

/// How the receiver drives its notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierMode {
    /// The receiver allocates backing storage itself and streams events.
    #[default]
    Batched,
    /// The notifier decides accept/ignore per product and may supply the
    /// destination.
    PerProduct,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Sender endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// IPv4 multicast group address.
    pub multicast_addr: Ipv4Addr,
    /// Multicast UDP port.
    pub multicast_port: u16,
    /// TCP port for the retransmission back-channel. Zero picks an
    /// ephemeral port (query it with `Sender::back_channel_addr`).
    pub back_channel_port: u16,
    /// Local interface address to multicast from.
    pub interface_ip: Ipv4Addr,
    /// Maximum on-wire packet length, header included.
    pub mtu_data_len: u16,
    /// Shaped multicast rate in bits per second. Zero disables shaping.
    pub send_rate_bps: f64,
    /// Default retransmission-deadline fraction for `send_memory`.
    /// Zero means "use the minimum deadline".
    pub retx_deadline_fraction: f64,
    /// Multicast TTL.
    pub ttl: u8,
    /// Product index assigned to the first product.
    pub initial_product_id: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            multicast_addr: Ipv4Addr::new(239, 0, 0, 1),
            multicast_port: 5001,
            back_channel_port: 0,
            interface_ip: Ipv4Addr::UNSPECIFIED,
            mtu_data_len: 1460,
            send_rate_bps: 100_000_000.0,
            retx_deadline_fraction: 0.0,
            ttl: 1,
            initial_product_id: 0,
        }
    }
}

impl SenderConfig {
    /// Payload capacity of one packet under this config.
    pub fn max_data_len(&self) -> usize {
        self.mtu_data_len as usize - HEADER_LEN
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multicast_addr.is_multicast() {
            return Err(TransportError::ConfigInvalid(format!(
                "{} is not a multicast address",
                self.multicast_addr
            )));
        }
        if self.multicast_port == 0 {
            return Err(TransportError::ConfigInvalid(
                "multicast_port must be non-zero".into(),
            ));
        }
        if (self.mtu_data_len as usize) <= HEADER_LEN {
            return Err(TransportError::ConfigInvalid(format!(
                "mtu_data_len {} leaves no payload room",
                self.mtu_data_len
            )));
        }
        if self.send_rate_bps < 0.0 {
            return Err(TransportError::ConfigInvalid(
                "send_rate_bps must not be negative".into(),
            ));
        }
        if self.retx_deadline_fraction < 0.0 {
            return Err(TransportError::ConfigInvalid(
                "retx_deadline_fraction must not be negative".into(),
            ));
        }
        Ok(())
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Receiver endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// IPv4 multicast group address to join.
    pub multicast_addr: Ipv4Addr,
    /// Multicast UDP port.
    pub multicast_port: u16,
    /// Host of the sender's back-channel TCP server.
    pub sender_host: String,
    /// Port of the sender's back-channel TCP server.
    pub sender_port: u16,
    /// Local interface address for the IGMP join.
    pub interface_ip: Ipv4Addr,
    /// Notifier discipline.
    pub notifier_mode: NotifierMode,
    /// Simulated DATA-packet loss in per mille (0–1000). Control packets
    /// are never dropped by the injector.
    pub simulated_loss_per_mille: u16,
    /// Directory file products are created under in batched mode.
    pub receive_dir: PathBuf,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            multicast_addr: Ipv4Addr::new(239, 0, 0, 1),
            multicast_port: 5001,
            sender_host: "127.0.0.1".into(),
            sender_port: 5002,
            interface_ip: Ipv4Addr::UNSPECIFIED,
            notifier_mode: NotifierMode::Batched,
            simulated_loss_per_mille: 0,
            receive_dir: PathBuf::from("."),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.multicast_addr.is_multicast() {
            return Err(TransportError::ConfigInvalid(format!(
                "{} is not a multicast address",
                self.multicast_addr
            )));
        }
        if self.multicast_port == 0 || self.sender_port == 0 {
            return Err(TransportError::ConfigInvalid(
                "multicast_port and sender_port must be non-zero".into(),
            ));
        }
        if self.sender_host.is_empty() {
            return Err(TransportError::ConfigInvalid(
                "sender_host must not be empty".into(),
            ));
        }
        if self.simulated_loss_per_mille > 1000 {
            return Err(TransportError::ConfigInvalid(format!(
                "simulated_loss_per_mille {} exceeds 1000",
                self.simulated_loss_per_mille
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SenderConfig::default().validate().unwrap();
        ReceiverConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unicast_group() {
        let cfg = SenderConfig {
            multicast_addr: Ipv4Addr::new(10, 0, 0, 1),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(TransportError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_headerless_mtu() {
        let cfg = SenderConfig {
            mtu_data_len: HEADER_LEN as u16,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_excess_loss_rate() {
        let cfg = ReceiverConfig {
            simulated_loss_per_mille: 1001,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_data_len_subtracts_header() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.max_data_len(), 1444);
    }

    #[test]
    fn config_loads_from_toml() {
        let cfg: ReceiverConfig = toml::from_str(
            r#"
            multicast_addr = "239.1.2.3"
            multicast_port = 6000
            sender_host = "data.example.net"
            sender_port = 6001
            notifier_mode = "per_product"
            simulated_loss_per_mille = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.multicast_addr, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(cfg.notifier_mode, NotifierMode::PerProduct);
        assert_eq!(cfg.simulated_loss_per_mille, 50);
    }
}
