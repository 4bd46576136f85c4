use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{CycleCommit, HistoryQuery, PresenceStore};
use crate::error::StoreError;
use crate::presence::{
    Device, DeviceId, LoggedTransition, Presence, Transition, TransitionKind,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS devices (
        mac TEXT PRIMARY KEY,
        name TEXT,
        vendor TEXT,
        ip TEXT,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        is_online INTEGER NOT NULL DEFAULT 0,
        offline_since INTEGER,
        "group" TEXT
    );

    CREATE TABLE IF NOT EXISTS presence_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mac TEXT NOT NULL,
        event_type TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        FOREIGN KEY (mac) REFERENCES devices(mac)
    );

    CREATE INDEX IF NOT EXISTS idx_history_mac ON presence_history(mac);
    CREATE INDEX IF NOT EXISTS idx_history_timestamp ON presence_history(timestamp);
"#;

const DEVICE_COLUMNS: &str =
    r#"mac, name, vendor, ip, first_seen, last_seen, is_online, offline_since, "group""#;

/// SQLite-backed presence store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database, creating its directory if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened presence store at {}", path.display());
        Ok(SqliteStore { conn })
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(key: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

fn parse_id(raw: &str) -> Result<DeviceId, StoreError> {
    raw.parse().map_err(|err| StoreError::Corrupt {
        key: raw.to_string(),
        reason: format!("{err}"),
    })
}

/// Raw column values; conversion happens outside the rusqlite row
/// closure so corruption is reported as such.
struct DeviceRow {
    mac: String,
    name: Option<String>,
    vendor: Option<String>,
    ip: Option<String>,
    first_seen: i64,
    last_seen: i64,
    is_online: bool,
    offline_since: Option<i64>,
    group: Option<String>,
}

impl DeviceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DeviceRow {
            mac: row.get(0)?,
            name: row.get(1)?,
            vendor: row.get(2)?,
            ip: row.get(3)?,
            first_seen: row.get(4)?,
            last_seen: row.get(5)?,
            is_online: row.get(6)?,
            offline_since: row.get(7)?,
            group: row.get(8)?,
        })
    }

    fn into_device(self) -> Result<Device, StoreError> {
        let id = parse_id(&self.mac)?;
        let last_seen = from_millis(&self.mac, self.last_seen)?;
        let since = self
            .offline_since
            .map(|ms| from_millis(&self.mac, ms))
            .transpose()?;
        let presence = match (self.is_online, since) {
            (true, None) => Presence::Online,
            (true, Some(since)) => Presence::Absent { since },
            (false, since) => Presence::Offline {
                since: since.unwrap_or(last_seen),
            },
        };
        let address = match self.ip {
            Some(ip) => Some(ip.parse::<IpAddr>().map_err(|err| StoreError::Corrupt {
                key: self.mac.clone(),
                reason: format!("bad address {ip}: {err}"),
            })?),
            None => None,
        };

        Ok(Device {
            id,
            label: self.name,
            group: self.group,
            vendor: self.vendor,
            address,
            first_seen: from_millis(&self.mac, self.first_seen)?,
            last_seen,
            presence,
        })
    }
}

impl PresenceStore for SqliteStore {
    fn get_device(&self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE mac = ?1"),
                params![id.to_string()],
                DeviceRow::read,
            )
            .optional()?;
        row.map(DeviceRow::into_device).transpose()
    }

    fn list_devices(&self, include_offline: bool) -> Result<Vec<Device>, StoreError> {
        let filter = if include_offline {
            ""
        } else {
            "WHERE is_online = 1"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices {filter}
             ORDER BY is_online DESC, name IS NULL, name, mac"
        ))?;
        let rows = stmt
            .query_map([], DeviceRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(DeviceRow::into_device).collect()
    }

    fn list_transitions(&self, query: &HistoryQuery) -> Result<Vec<LoggedTransition>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT h.mac, h.event_type, h.timestamp, d.name
             FROM presence_history h
             LEFT JOIN devices d ON h.mac = d.mac
             WHERE (?1 IS NULL OR h.mac = ?1)
               AND (?2 IS NULL OR h.timestamp >= ?2)
             ORDER BY h.timestamp DESC, h.id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![
                    query.device.map(|id| id.to_string()),
                    query.since.map(to_millis),
                    query.limit as i64,
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = rows
            .into_iter()
            .map(|(mac, event_type, ts, label)| {
                let kind =
                    TransitionKind::from_str_opt(&event_type).ok_or_else(|| StoreError::Corrupt {
                        key: mac.clone(),
                        reason: format!("unknown event type {event_type}"),
                    })?;
                Ok(LoggedTransition {
                    transition: Transition {
                        device: parse_id(&mac)?,
                        kind,
                        at: from_millis(&mac, ts)?,
                    },
                    label,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        entries.reverse();
        Ok(entries)
    }

    fn commit_cycle(&mut self, commit: CycleCommit) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO devices (mac, vendor, ip, first_seen, last_seen, is_online, offline_since)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(mac) DO UPDATE SET
                     vendor = COALESCE(excluded.vendor, devices.vendor),
                     ip = excluded.ip,
                     last_seen = excluded.last_seen,
                     is_online = excluded.is_online,
                     offline_since = excluded.offline_since",
            )?;
            for device in &commit.devices {
                upsert.execute(params![
                    device.id.to_string(),
                    device.vendor,
                    device.address.map(|a| a.to_string()),
                    to_millis(device.first_seen),
                    to_millis(device.last_seen),
                    device.is_online(),
                    device.offline_since().map(to_millis),
                ])?;
            }

            let mut append = tx.prepare(
                "INSERT INTO presence_history (mac, event_type, timestamp) VALUES (?1, ?2, ?3)",
            )?;
            for transition in &commit.transitions {
                append.execute(params![
                    transition.device.to_string(),
                    transition.kind.as_str(),
                    to_millis(transition.at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn set_label(
        &mut self,
        id: &DeviceId,
        label: &str,
        group: Option<&str>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn.execute(
            r#"UPDATE devices SET name = ?1, "group" = COALESCE(?2, "group") WHERE mac = ?3"#,
            params![label, group, id.to_string()],
        )?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/wifinder.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_commit_and_read_back() {
        let (_dir, mut store) = open();
        let mut phone = Device::discovered(id("aa:bb:cc:00:00:01"), at(0));
        phone.vendor = Some("Apple".to_string());
        phone.address = Some("192.168.1.10".parse().unwrap());
        let mut laptop = Device::discovered(id("aa:bb:cc:00:00:02"), at(0));
        laptop.presence = Presence::Absent { since: at(30) };

        store
            .commit_cycle(CycleCommit {
                devices: vec![phone.clone(), laptop.clone()],
                transitions: vec![Transition {
                    device: phone.id,
                    kind: TransitionKind::Arrived,
                    at: at(0),
                }],
            })
            .unwrap();

        assert_eq!(store.get_device(&phone.id).unwrap(), Some(phone.clone()));
        assert_eq!(store.get_device(&laptop.id).unwrap(), Some(laptop));
        assert_eq!(store.get_device(&id("aa:bb:cc:00:00:03")).unwrap(), None);

        let log = store.list_transitions(&HistoryQuery::default()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].transition.device, phone.id);
        assert_eq!(log[0].transition.kind, TransitionKind::Arrived);
    }

    #[test]
    fn test_offline_devices_are_filtered() {
        let (_dir, mut store) = open();
        let online = Device::discovered(id("aa:bb:cc:00:00:01"), at(0));
        let mut offline = Device::discovered(id("aa:bb:cc:00:00:02"), at(0));
        offline.presence = Presence::Offline { since: at(10) };
        store
            .commit_cycle(CycleCommit {
                devices: vec![offline.clone(), online.clone()],
                transitions: vec![],
            })
            .unwrap();

        let visible = store.list_devices(false).unwrap();
        assert_eq!(visible, vec![online.clone()]);
        let all = store.list_devices(true).unwrap();
        assert_eq!(all, vec![online, offline]);
    }

    #[test]
    fn test_commit_preserves_labels() {
        let (_dir, mut store) = open();
        let device = Device::discovered(id("aa:bb:cc:00:00:01"), at(0));
        store
            .commit_cycle(CycleCommit {
                devices: vec![device.clone()],
                transitions: vec![],
            })
            .unwrap();

        assert!(store.set_label(&device.id, "Alice", Some("family")).unwrap());
        assert!(!store.set_label(&id("aa:bb:cc:00:00:09"), "Ghost", None).unwrap());

        let mut seen_again = device.clone();
        seen_again.last_seen = at(30);
        store
            .commit_cycle(CycleCommit {
                devices: vec![seen_again],
                transitions: vec![],
            })
            .unwrap();

        let stored = store.get_device(&device.id).unwrap().unwrap();
        assert_eq!(stored.label.as_deref(), Some("Alice"));
        assert_eq!(stored.group.as_deref(), Some("family"));
        assert_eq!(stored.last_seen, at(30));
        assert_eq!(stored.first_seen, at(0));
    }

    #[test]
    fn test_history_filters_and_limits() {
        let (_dir, mut store) = open();
        let a = Device::discovered(id("aa:bb:cc:00:00:01"), at(0));
        let b = Device::discovered(id("aa:bb:cc:00:00:02"), at(0));
        let entry = |device: DeviceId, kind, secs| Transition {
            device,
            kind,
            at: at(secs),
        };
        store
            .commit_cycle(CycleCommit {
                devices: vec![a.clone(), b.clone()],
                transitions: vec![
                    entry(a.id, TransitionKind::Arrived, 0),
                    entry(b.id, TransitionKind::Arrived, 0),
                    entry(a.id, TransitionKind::Departed, 200),
                    entry(a.id, TransitionKind::Arrived, 400),
                ],
            })
            .unwrap();

        let only_a = store
            .list_transitions(&HistoryQuery {
                device: Some(a.id),
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        let kinds: Vec<_> = only_a.iter().map(|e| e.transition.kind).collect();
        assert_eq!(kinds, vec![TransitionKind::Departed, TransitionKind::Arrived]);

        let recent = store
            .list_transitions(&HistoryQuery {
                since: Some(at(100)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].transition.at < recent[1].transition.at);
    }

    #[test]
    fn test_failed_commit_writes_nothing() {
        let (_dir, mut store) = open();
        let device = Device::discovered(id("aa:bb:cc:00:00:01"), at(0));
        store
            .conn
            .execute_batch("DROP TABLE presence_history")
            .unwrap();

        let result = store.commit_cycle(CycleCommit {
            devices: vec![device.clone()],
            transitions: vec![Transition {
                device: device.id,
                kind: TransitionKind::Arrived,
                at: at(0),
            }],
        });
        assert!(result.is_err());
        assert_eq!(store.get_device(&device.id).unwrap(), None);
    }
}
