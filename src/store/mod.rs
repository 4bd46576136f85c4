//! Durable record of known devices and their arrival/departure history.
//!
//! The engine is the only writer of presence state and writes once per
//! cycle through [`PresenceStore::commit_cycle`]. Everything else (the
//! `list`, `log` and `who` commands) only reads.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::presence::{Device, DeviceId, LoggedTransition, Transition};

mod sqlite;

#[cfg(test)]
pub mod memory;

pub use sqlite::SqliteStore;

/// Everything one reconciliation cycle decided, published as a unit.
#[derive(Clone, Debug, Default)]
pub struct CycleCommit {
    pub devices: Vec<Device>,
    pub transitions: Vec<Transition>,
}

impl CycleCommit {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.transitions.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub device: Option<DeviceId>,
    /// Keep only the most recent `limit` entries.
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        HistoryQuery {
            since: None,
            device: None,
            limit: 100,
        }
    }
}

pub trait PresenceStore: Send {
    fn get_device(&self, id: &DeviceId) -> Result<Option<Device>, StoreError>;

    /// Known devices, online ones first, labelled before unlabelled.
    fn list_devices(&self, include_offline: bool) -> Result<Vec<Device>, StoreError>;

    /// History entries matching `query`, oldest first.
    fn list_transitions(&self, query: &HistoryQuery) -> Result<Vec<LoggedTransition>, StoreError>;

    /// Atomically upsert the cycle's device records and append its
    /// transitions. Either all of it lands or none of it does. Labels
    /// and groups are never touched.
    fn commit_cycle(&mut self, commit: CycleCommit) -> Result<(), StoreError>;

    /// Name a device. Returns false if the device has never been seen.
    fn set_label(
        &mut self,
        id: &DeviceId,
        label: &str,
        group: Option<&str>,
    ) -> Result<bool, StoreError>;
}
