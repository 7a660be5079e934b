//! # beaconwatch core
//!
//! Configuration and error handling shared by the beaconwatch crates.
//!
//! - **Configuration**: [`AppConfig`] with a [`DiscoveryConfig`] section and a
//!   [`LoggingConfig`](config::LoggingConfig) section, loadable from YAML files
//!   with `BEACONWATCH__*` environment overrides.
//! - **Errors**: serializable error types built on `thiserror`.

pub mod config;
pub mod discovery_config;
pub mod error;

pub use config::AppConfig;
pub use discovery_config::DiscoveryConfig;
pub use error::{BeaconwatchError, IoError, IoErrorKind, Result};
