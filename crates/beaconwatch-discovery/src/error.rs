//! Error types for the discovery engine

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors returned synchronously by the discovery engine.
///
/// Failures while a run is already receiving are not returned here; they are
/// reported once as `DiscoveryEvent::Fault`.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Creating or binding the listening socket failed
    #[error("Failed to bind discovery socket on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Joining the multicast group failed
    #[error("Failed to join multicast group {group} on interface {interface}: {source}")]
    Join {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    /// Invalid engine configuration
    #[error("Invalid discovery configuration: {0}")]
    InvalidConfig(String),
}

impl DiscoveryError {
    /// The underlying I/O error, if there is one
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            DiscoveryError::Bind { source, .. } | DiscoveryError::Join { source, .. } => Some(source),
            DiscoveryError::InvalidConfig(_) => None,
        }
    }
}
