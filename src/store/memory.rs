use std::collections::HashMap;

use super::{CycleCommit, HistoryQuery, PresenceStore};
use crate::error::StoreError;
use crate::presence::{Device, DeviceId, LoggedTransition, Transition};

/// In-memory store for tests. `fail_commits` simulates an I/O failure
/// at commit time.
#[derive(Default)]
pub struct MemoryStore {
    devices: HashMap<DeviceId, Device>,
    history: Vec<Transition>,
    pub fail_commits: bool,
}

impl MemoryStore {
    pub fn history(&self) -> &[Transition] {
        &self.history
    }
}

impl PresenceStore for MemoryStore {
    fn get_device(&self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.get(id).cloned())
    }

    fn list_devices(&self, include_offline: bool) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self
            .devices
            .values()
            .filter(|d| include_offline || d.is_online())
            .cloned()
            .collect();
        devices.sort_by(|a, b| {
            b.is_online()
                .cmp(&a.is_online())
                .then_with(|| a.label.is_none().cmp(&b.label.is_none()))
                .then_with(|| a.label.cmp(&b.label))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(devices)
    }

    fn list_transitions(&self, query: &HistoryQuery) -> Result<Vec<LoggedTransition>, StoreError> {
        let matching: Vec<LoggedTransition> = self
            .history
            .iter()
            .filter(|t| query.device.is_none_or(|id| t.device == id))
            .filter(|t| query.since.is_none_or(|since| t.at >= since))
            .map(|t| LoggedTransition {
                transition: t.clone(),
                label: self.devices.get(&t.device).and_then(|d| d.label.clone()),
            })
            .collect();
        let skip = matching.len().saturating_sub(query.limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    fn commit_cycle(&mut self, commit: CycleCommit) -> Result<(), StoreError> {
        if self.fail_commits {
            return Err(StoreError::Io(std::io::Error::other("simulated failure")));
        }
        for mut device in commit.devices {
            if let Some(existing) = self.devices.get(&device.id) {
                device.label = existing.label.clone();
                device.group = existing.group.clone();
            }
            self.devices.insert(device.id, device);
        }
        self.history.extend(commit.transitions);
        Ok(())
    }

    fn set_label(
        &mut self,
        id: &DeviceId,
        label: &str,
        group: Option<&str>,
    ) -> Result<bool, StoreError> {
        match self.devices.get_mut(id) {
            Some(device) => {
                device.label = Some(label.to_string());
                if let Some(group) = group {
                    device.group = Some(group.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
