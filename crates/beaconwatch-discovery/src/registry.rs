//! Presence registry: the table of devices currently heard on the network.
//!
//! The table is keyed by hardware address and holds at most one entry per key.
//! Entries only leave through [`PresenceRegistry::sweep`] or
//! [`PresenceRegistry::clear`]; the receive path never removes anything.
//!
//! The registry itself is not synchronized. The engine owns it behind a single
//! mutex so `observe` and `sweep` never interleave.

use crate::types::{DeviceIdentity, DeviceSnapshot, DiscoveryEvent};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of feeding one identity to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The hardware address was unknown and has been inserted
    Discovered(DeviceIdentity),

    /// The hardware address was known with different fields; the identity was replaced
    Changed(DeviceIdentity),

    /// Same identity as before; only the liveness clock moved
    Refreshed,
}

impl Observation {
    /// Event to publish for this outcome, if any
    pub fn into_event(self) -> Option<DiscoveryEvent> {
        match self {
            Observation::Discovered(identity) => Some(DiscoveryEvent::Discovered(identity)),
            Observation::Changed(identity) => Some(DiscoveryEvent::Changed(identity)),
            Observation::Refreshed => None,
        }
    }
}

/// One present device
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    identity: DeviceIdentity,
    first_seen: Instant,
    last_seen: Instant,
    beacon_count: u64,
}

impl RegistryEntry {
    fn new(identity: DeviceIdentity, now: Instant) -> Self {
        Self {
            identity,
            first_seen: now,
            last_seen: now,
            beacon_count: 1,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn beacon_count(&self) -> u64 {
        self.beacon_count
    }

    /// Time since the last beacon, zero if `now` is earlier
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Table of present devices keyed by hardware address
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a beacon for `identity` seen at `now`
    pub fn observe(&mut self, identity: DeviceIdentity, now: Instant) -> Observation {
        match self.entries.entry(identity.hardware_address.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry::new(identity.clone(), now));
                Observation::Discovered(identity)
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.last_seen = now;
                entry.beacon_count += 1;

                if entry.identity == identity {
                    Observation::Refreshed
                } else {
                    entry.identity = identity.clone();
                    Observation::Changed(identity)
                }
            }
        }
    }

    /// Removes every entry silent for strictly longer than `timeout`.
    ///
    /// Evicted identities are returned in ascending hardware address order,
    /// each exactly once.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<DeviceIdentity> {
        let mut evicted = Vec::new();

        self.entries.retain(|_, entry| {
            if entry.silent_for(now) > timeout {
                evicted.push(entry.identity.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Drops every entry without reporting them
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry; the address is matched case-insensitively
    pub fn get(&self, hardware_address: &str) -> Option<&RegistryEntry> {
        self.entries.get(&hardware_address.to_ascii_uppercase())
    }

    /// Copies every entry out for collaborators
    pub fn snapshot(&self, now: Instant) -> Vec<DeviceSnapshot> {
        self.entries
            .values()
            .map(|entry| DeviceSnapshot {
                identity: entry.identity.clone(),
                silent_for: entry.silent_for(now),
                beacon_count: entry.beacon_count,
            })
            .collect()
    }
}
