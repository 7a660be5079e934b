//! Types for discovered devices, lifecycle events and engine state

use beaconwatch_core::IoError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identity advertised by one beacon.
///
/// Equality covers exactly the three advertised fields; timestamps live in the
/// registry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Advertised host label
    pub name: String,

    /// Dotted-quad IPv4 address
    pub network_address: String,

    /// MAC address, uppercase, colon separated. Registry key.
    pub hardware_address: String,
}

impl DeviceIdentity {
    /// Creates an identity, normalizing the hardware address to uppercase
    pub fn new(
        name: impl Into<String>,
        network_address: impl Into<String>,
        hardware_address: impl AsRef<str>,
    ) -> Self {
        Self {
            name: name.into(),
            network_address: network_address.into(),
            hardware_address: hardware_address.as_ref().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.name, self.network_address, self.hardware_address
        )
    }
}

/// Why a run stopped itself
pub type FaultCause = IoError;

/// Event emitted to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// First beacon from a hardware address
    Discovered(DeviceIdentity),

    /// A known hardware address advertised different fields
    Changed(DeviceIdentity),

    /// The device stayed silent past the liveness timeout
    Removed(DeviceIdentity),

    /// Receiving failed; the engine has stopped itself
    Fault(FaultCause),
}

impl DiscoveryEvent {
    /// The device this event is about, if any
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        match self {
            DiscoveryEvent::Discovered(identity)
            | DiscoveryEvent::Changed(identity)
            | DiscoveryEvent::Removed(identity) => Some(identity),
            DiscoveryEvent::Fault(_) => None,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            DiscoveryEvent::Discovered(_) => "Device discovered on network",
            DiscoveryEvent::Changed(_) => "Device advertisement changed",
            DiscoveryEvent::Removed(_) => "Device went silent",
            DiscoveryEvent::Fault(_) => "Discovery stopped after a receive failure",
        }
    }
}

/// Lifecycle state of the discovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// No socket, no tasks
    Idle,
    /// Opening the socket
    Starting,
    /// Receiving and sweeping
    Running,
    /// Waiting for background tasks to exit
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Read-only view of a present device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,

    /// Time since the last beacon
    pub silent_for: Duration,

    /// Beacons attributed to this device in the current run
    pub beacon_count: u64,
}

impl DeviceSnapshot {
    /// Whole seconds since the last beacon
    pub fn silent_for_secs(&self) -> u64 {
        self.silent_for.as_secs()
    }
}

/// Handle to one run of the engine, returned by `start`
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: u64,
    local_addr: Option<SocketAddr>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub(crate) fn new(run_id: u64, local_addr: Option<SocketAddr>, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            local_addr,
            started_at: Utc::now(),
            cancel,
        }
    }

    /// Monotonic identifier of the run, unique per service
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Address the transport is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True until the run is stopped or faults
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the run has been stopped or has faulted
    pub async fn finished(&self) {
        self.cancel.cancelled().await
    }
}
