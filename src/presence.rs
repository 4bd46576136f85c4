use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use mac_address::MacAddress;
use serde_derive::Serialize;

use crate::error::ParseDeviceIdError;

/// Stable hardware address of a device. Always displayed upper-case,
/// colon separated, so equal addresses compare and print the same no
/// matter how the scan tool or the user spelled them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    /// First three octets, the vendor's OUI.
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }
}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', ":");
        normalized
            .parse::<MacAddress>()
            .map(|mac| DeviceId(mac.bytes()))
            .map_err(|_| ParseDeviceIdError(s.to_string()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
}

/// Where a device sits in the two-phase departure scheme.
///
/// `Absent` is still online from the outside: the device missed at
/// least one scan but its grace period has not run out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Online,
    Absent { since: DateTime<Utc> },
    Offline { since: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub label: Option<String>,
    pub group: Option<String>,
    pub vendor: Option<String>,
    pub address: Option<IpAddr>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub presence: Presence,
}

impl Device {
    /// A device observed for the first time.
    pub fn discovered(id: DeviceId, now: DateTime<Utc>) -> Self {
        Device {
            id,
            label: None,
            group: None,
            vendor: None,
            address: None,
            first_seen: now,
            last_seen: now,
            presence: Presence::Online,
        }
    }

    pub fn state(&self) -> DeviceState {
        match self.presence {
            Presence::Online | Presence::Absent { .. } => DeviceState::Online,
            Presence::Offline { .. } => DeviceState::Offline,
        }
    }

    /// When the engine first failed to observe the device, if it
    /// currently isn't being observed.
    pub fn offline_since(&self) -> Option<DateTime<Utc>> {
        match self.presence {
            Presence::Online => None,
            Presence::Absent { since } | Presence::Offline { since } => Some(since),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state() == DeviceState::Online
    }

    pub fn display_name(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        if let Some(vendor) = &self.vendor {
            let id = self.id.to_string();
            return format!("{} ({})", vendor, &id[id.len() - 8..]);
        }
        self.id.to_string()
    }
}

/// One device seen in a scan.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub id: DeviceId,
    pub address: Option<IpAddr>,
    pub vendor_hint: Option<String>,
}

/// Point-in-time scan result. Folded into device records, never stored.
#[derive(Clone, Debug)]
pub struct ScanSnapshot {
    pub taken_at: DateTime<Utc>,
    pub observations: Vec<Observation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Arrived,
    Departed,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Arrived => "arrived",
            TransitionKind::Departed => "left",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "arrived" => Some(TransitionKind::Arrived),
            "left" => Some(TransitionKind::Departed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub device: DeviceId,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

/// A transition read back from the history log, joined with the
/// device's label at read time.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedTransition {
    pub transition: Transition,
    pub label: Option<String>,
}

/// Human summary of who is home. Labelled devices are named, the rest
/// are counted.
pub fn who_is_home(online: &[Device]) -> String {
    if online.is_empty() {
        return "Nobody's home".to_string();
    }

    let named: Vec<&str> = online.iter().filter_map(|d| d.label.as_deref()).collect();
    let unnamed = online.len() - named.len();

    let mut parts = Vec::new();
    if !named.is_empty() {
        parts.push(format!("Home: {}", named.join(", ")));
    }
    if unnamed > 0 {
        parts.push(format!("+ {} other device(s)", unnamed));
    }
    parts.join("\n")
}
