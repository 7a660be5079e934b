//! Engine configuration, shared with the CLI through `beaconwatch-core`

pub use beaconwatch_core::discovery_config::{
    DiscoveryConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_MULTICAST_GROUP,
};
