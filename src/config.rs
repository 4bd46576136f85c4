use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::presence::DeviceId;

pub const DEFAULT_PANIC_MESSAGE: &str = "OHSHITOHSHITOHSHITOHSHITOHSHIT!";
pub const DEFAULT_NETWORK: &str = "192.168.1.0/24";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub network: String,
    /// Seconds between cycle starts.
    pub interval: u64,
    /// Seconds a device may go unseen before it is confirmed departed.
    pub device_ttl: u64,
    pub db_path: PathBuf,
    pub notify: NotifyConfig,
    pub panic: PanicConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            network: DEFAULT_NETWORK.to_string(),
            interval: 30,
            device_ttl: 180,
            db_path: PathBuf::from("wifinder.db"),
            notify: NotifyConfig::default(),
            panic: PanicConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub sound: bool,
    pub desktop: bool,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    pub quiet_hours_start: Option<u32>,
    pub quiet_hours_end: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub sink_timeout_seconds: Option<u64>,
    pub mqtt: Option<MqttConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            sound: true,
            desktop: false,
            telegram_token: None,
            telegram_chat_id: None,
            webhook_url: None,
            quiet_hours_start: None,
            quiet_hours_end: None,
            cooldown_seconds: None,
            sink_timeout_seconds: None,
            mqtt: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct PanicConfig {
    pub enabled: bool,
    pub message: String,
    pub sound_loops: u32,
    /// Only panic for devices nobody has labelled yet.
    pub only_unknown: bool,
    /// Hardware address -> message.
    pub custom_messages: HashMap<String, String>,
}

impl Default for PanicConfig {
    fn default() -> Self {
        PanicConfig {
            enabled: false,
            message: DEFAULT_PANIC_MESSAGE.to_string(),
            sound_loops: 1,
            only_unknown: true,
            custom_messages: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::de::from_str::<AppConfig>(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                AppConfig::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the config as TOML, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string(self)?;
        let write = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write)?;
        }
        std::fs::write(path, contents).map_err(write)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cidr(&self.network)?;

        if self.interval == 0 {
            return Err(ConfigError::invalid("interval", "must be at least 1 second"));
        }

        self.quiet_hours()?;

        if self.notify.telegram_token.is_some() != self.notify.telegram_chat_id.is_some() {
            return Err(ConfigError::invalid(
                "notify.telegram_token",
                "telegram_token and telegram_chat_id must be set together",
            ));
        }

        if self.notify.sink_timeout_seconds == Some(0) {
            return Err(ConfigError::invalid(
                "notify.sink_timeout_seconds",
                "must be at least 1 second",
            ));
        }

        self.custom_messages()?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn device_ttl(&self) -> Duration {
        Duration::from_secs(self.device_ttl)
    }

    /// Dedup window, one scan interval unless configured.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.notify.cooldown_seconds.unwrap_or(self.interval))
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.notify.sink_timeout_seconds.unwrap_or(10))
    }

    /// Quiet window as (start, end) hours, if both ends are configured.
    pub fn quiet_hours(&self) -> Result<Option<(u32, u32)>, ConfigError> {
        match (self.notify.quiet_hours_start, self.notify.quiet_hours_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => {
                for (field, hour) in [
                    ("notify.quiet_hours_start", start),
                    ("notify.quiet_hours_end", end),
                ] {
                    if hour > 23 {
                        return Err(ConfigError::invalid(field, format!("{hour} is not an hour 0-23")));
                    }
                }
                Ok(Some((start, end)))
            }
            _ => Err(ConfigError::invalid(
                "notify.quiet_hours_start",
                "quiet_hours_start and quiet_hours_end must be set together",
            )),
        }
    }

    /// Per-device messages keyed by normalized identifier.
    pub fn custom_messages(&self) -> Result<HashMap<DeviceId, String>, ConfigError> {
        self.panic
            .custom_messages
            .iter()
            .map(|(mac, message)| {
                mac.parse::<DeviceId>()
                    .map(|id| (id, message.clone()))
                    .map_err(|err| ConfigError::invalid("panic.custom_messages", err.to_string()))
            })
            .collect()
    }
}

fn validate_cidr(network: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::invalid("network", format!("{network:?}: {reason}"));

    let (addr, prefix) = network
        .split_once('/')
        .ok_or_else(|| invalid("expected address/prefix"))?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid("prefix length too long"));
    }
    Ok(())
}

/// The /24 around the address this host routes outbound traffic from,
/// or the default network if there is no IPv4 route.
pub fn detect_network() -> String {
    match outbound_ipv4() {
        Ok(addr) => subnet_24(addr),
        Err(err) => {
            debug!("Could not detect local network: {}", err);
            DEFAULT_NETWORK.to_string()
        }
    }
}

fn outbound_ipv4() -> std::io::Result<Ipv4Addr> {
    // connect() on UDP only picks a route; nothing is sent.
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) if !addr.is_unspecified() => Ok(addr),
        other => Err(std::io::Error::other(format!("no IPv4 route ({other})"))),
    }
}

fn subnet_24(addr: Ipv4Addr) -> String {
    let [a, b, c, _] = addr.octets();
    format!("{a}.{b}.{c}.0/24")
}
