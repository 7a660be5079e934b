//! Passive discovery of devices that announce themselves over UDP multicast
//!
//! Devices on the local segment periodically send a small UTF-16LE beacon to
//! a multicast group. This crate listens for those beacons and keeps a live
//! table of who is present:
//! - Parse each datagram into a name, IPv4 address and MAC address
//! - Track devices by MAC address with a liveness clock
//! - Evict devices that stay silent past the timeout
//! - Notify subscribers when devices appear, change or disappear
//!
//! # Architecture
//!
//! A run of the engine owns three background tasks: a receive loop, a sweep
//! loop and an event dispatcher. All registry changes go through one lock and
//! the events they produce are queued under that same lock, so every
//! subscriber sees the events of a device in the order they happened.
//!
//! # Example
//!
//! ```no_run
//! use beaconwatch_discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = DiscoveryService::new(DiscoveryConfig::default())?;
//!     let events = service.subscribe();
//!
//!     service.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let DiscoveryEvent::Discovered(device) = event {
//!             println!("found {device}");
//!         }
//!     }
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod beacon;
pub mod config;
pub mod error;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

pub use beacon::{decode_payload, encode_beacon, parse_beacon, parse_beacon_text};
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, Result};
pub use registry::{Observation, PresenceRegistry, RegistryEntry};
pub use service::{DiscoveryService, EventReceiver};
pub use transport::{BeaconTransport, MulticastSocket};
pub use types::{DeviceIdentity, DeviceSnapshot, DiscoveryEvent, EngineState, FaultCause, RunHandle};
