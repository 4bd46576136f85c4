use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The scan tool could not produce a snapshot. The cycle is skipped.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("unreadable scan output: {0}")]
    Output(String),

    #[error("{hosts} hosts up but none reported a hardware address; nmap needs root for ARP discovery")]
    NoHardwareAddresses { hosts: usize },
}

/// The presence store failed. The current cycle commits nothing.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// A single delivery sink failed. Never propagated past the dispatcher.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rejected with status {0}")]
    Rejected(u16),

    #[error("command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unsupported on this platform")]
    Unsupported,
}

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("not a hardware address: {0:?}")]
pub struct ParseDeviceIdError(pub String);
