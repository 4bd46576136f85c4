//! Presence state engine.
//!
//! Folds each scan snapshot into the stored device records and decides
//! when a device has arrived or departed. Departures are debounced by a
//! TTL so that a device missing from a scan or two (phones put their
//! radios to sleep) doesn't flicker.
//!
//! # Device lifecycle
//!
//! ```text
//!            seen                 missed                 missed, now - since >= ttl
//!  (new) ─────────► Online ──────────────► Absent{since} ─────────────────────────► Offline{since}
//!    emits Arrived    ▲                       │                     emits Departed      │
//!                     │        seen           │                                         │
//!                     └───────────────────────┘                                         │
//!                     ▲          seen, emits Arrived                                    │
//!                     └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::error::StoreError;
use crate::presence::{
    Device, DeviceId, Presence, ScanSnapshot, Transition, TransitionKind,
};
use crate::store::{CycleCommit, PresenceStore};
use crate::vendor;

/// Outcome of one reconciliation: the transitions it produced, plus the
/// committed record of every device it touched.
#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    pub transitions: Vec<Transition>,
    devices: HashMap<DeviceId, Device>,
}

impl Reconciliation {
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    #[cfg(test)]
    pub fn from_devices(transitions: Vec<Transition>, devices: Vec<Device>) -> Self {
        Reconciliation {
            transitions,
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
        }
    }
}

pub struct PresenceEngine {
    ttl: chrono::Duration,
}

impl PresenceEngine {
    pub fn new(ttl: Duration) -> Self {
        PresenceEngine {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Reconcile one snapshot against the store.
    ///
    /// All record changes are buffered and written through a single
    /// [`PresenceStore::commit_cycle`]; a store failure leaves the store
    /// exactly as it was. Arrivals come first in snapshot order, then
    /// departures in ascending identifier order.
    pub fn reconcile<S: PresenceStore + ?Sized>(
        &self,
        store: &mut S,
        snapshot: &ScanSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, StoreError> {
        let mut commit = CycleCommit::default();
        let mut seen = HashSet::new();

        for observation in &snapshot.observations {
            if !seen.insert(observation.id) {
                continue;
            }

            let (mut device, arrived) = match store.get_device(&observation.id)? {
                None => (Device::discovered(observation.id, now), true),
                Some(existing) => {
                    let arrived = matches!(existing.presence, Presence::Offline { .. });
                    if let Presence::Absent { since } = existing.presence {
                        debug!(
                            "{} back after {}s, within grace period",
                            existing.display_name(),
                            (now - since).num_seconds()
                        );
                    }
                    (existing, arrived)
                }
            };

            device.presence = Presence::Online;
            device.last_seen = now;
            device.address = observation.address.or(device.address);
            device.vendor = observation
                .vendor_hint
                .clone()
                .or_else(|| vendor::lookup(&device.id).map(str::to_string))
                .or(device.vendor);

            if arrived {
                commit.transitions.push(Transition {
                    device: device.id,
                    kind: TransitionKind::Arrived,
                    at: now,
                });
            }
            commit.devices.push(device);
        }

        let mut missing: Vec<Device> = store
            .list_devices(false)?
            .into_iter()
            .filter(|d| !seen.contains(&d.id))
            .collect();
        missing.sort_by_key(|d| d.id);

        for mut device in missing {
            let since = device.offline_since().unwrap_or(now);
            if now - since >= self.ttl {
                device.presence = Presence::Offline { since };
                commit.transitions.push(Transition {
                    device: device.id,
                    kind: TransitionKind::Departed,
                    at: now,
                });
                commit.devices.push(device);
            } else if device.presence == Presence::Online {
                debug!("{} missed a scan, pending departure", device.display_name());
                device.presence = Presence::Absent { since };
                commit.devices.push(device);
            }
        }

        let devices: HashMap<DeviceId, Device> =
            commit.devices.iter().map(|d| (d.id, d.clone())).collect();
        let transitions = commit.transitions.clone();

        if !commit.is_empty() {
            store.commit_cycle(commit)?;
        }

        for transition in &transitions {
            if let Some(device) = devices.get(&transition.device) {
                info!(
                    "{} {}",
                    device.display_name(),
                    match transition.kind {
                        TransitionKind::Arrived => "arrived",
                        TransitionKind::Departed => "departed",
                    }
                );
            }
        }

        Ok(Reconciliation {
            transitions,
            devices,
        })
    }
}
