//! Configuration types for beacon discovery

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Well-known UDP port devices advertise on
pub const DEFAULT_DISCOVERY_PORT: u16 = 6;

/// Multicast group devices advertise to
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 222);

/// Configuration for the beacon discovery engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Multicast group to join
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,

    /// Local interface used for the group membership (0.0.0.0 lets the OS pick)
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Silence after which a device is considered gone (seconds)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    /// How often the registry is swept for silent devices (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Receive buffer size for a single datagram
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// How long `stop` waits for background tasks before aborting them (milliseconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            multicast_group: default_multicast_group(),
            interface: default_interface(),
            liveness_timeout_secs: default_liveness_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            recv_buffer_size: default_recv_buffer_size(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl DiscoveryConfig {
    /// Returns the liveness timeout as a Duration
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Returns the sweep interval as a Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Returns the shutdown grace period as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Local address the listening socket binds to
    pub fn bind_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port cannot be 0".to_string());
        }

        if !self.multicast_group.is_multicast() {
            return Err(format!(
                "{} is not an IPv4 multicast address",
                self.multicast_group
            ));
        }

        if self.liveness_timeout_secs == 0 {
            return Err("liveness_timeout_secs cannot be 0".to_string());
        }

        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs cannot be 0".to_string());
        }

        // Eviction latency is bounded by the sweep period, so it may not exceed the timeout
        if self.sweep_interval_secs > self.liveness_timeout_secs {
            return Err(format!(
                "sweep_interval_secs ({}) cannot exceed liveness_timeout_secs ({})",
                self.sweep_interval_secs, self.liveness_timeout_secs
            ));
        }

        if self.recv_buffer_size == 0 {
            return Err("recv_buffer_size cannot be 0".to_string());
        }

        Ok(())
    }
}

// Default configuration values
fn default_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_multicast_group() -> Ipv4Addr {
    DEFAULT_MULTICAST_GROUP
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_liveness_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_recv_buffer_size() -> usize {
    2048
}

fn default_shutdown_grace() -> u64 {
    2000
}
