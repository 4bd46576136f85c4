use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde_derive::Serialize;
use tokio::process::Command;

use super::{NotificationEvent, NotificationSink, Severity};
use crate::error::SinkError;
use crate::presence::TransitionKind;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Prints alerts to the terminal; panic alerts get a boxed banner.
pub struct ConsoleSink {
    banner: String,
}

impl ConsoleSink {
    pub fn new(banner: String) -> Self {
        ConsoleSink { banner }
    }

    fn render(&self, event: &NotificationEvent) -> String {
        let ts = event.at().with_timezone(&Local).format("%H:%M:%S");
        let symbol = match event.transition.kind {
            TransitionKind::Arrived => "●",
            TransitionKind::Departed => "○",
        };
        let line = format!("{ts} {symbol} {}", event.device.display_name());

        match event.severity {
            Severity::Normal => line,
            Severity::Panic => {
                let width = self.banner.chars().count() + 8;
                format!(
                    "┌{rule}┐\n│{banner:^width$}│\n└{rule}┘\n{line}",
                    rule = "─".repeat(width),
                    banner = self.banner,
                )
            }
        }
    }
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", self.render(event)).map_err(|err| SinkError::Command {
            command: "stdout".to_string(),
            reason: err.to_string(),
        })
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), SinkError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| SinkError::Command {
            command: program.to_string(),
            reason: err.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SinkError::Command {
            command: program.to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

fn ring_bell(out: &mut impl std::io::Write) -> Result<(), SinkError> {
    out.write_all(b"\x07")
        .and_then(|()| out.flush())
        .map_err(|err| SinkError::Command {
            command: "bell".to_string(),
            reason: err.to_string(),
        })
}

/// Plays the system alert sound; panic alerts repeat it.
pub struct SoundSink {
    panic_loops: u32,
}

impl SoundSink {
    pub fn new(panic_loops: u32) -> Self {
        SoundSink {
            panic_loops: panic_loops.max(1),
        }
    }

    fn loops(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Panic => self.panic_loops,
            Severity::Normal => 1,
        }
    }
}

#[async_trait]
impl NotificationSink for SoundSink {
    fn name(&self) -> &'static str {
        "sound"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        for _ in 0..self.loops(event.severity) {
            if cfg!(target_os = "macos") {
                run("afplay", &["/System/Library/Sounds/Glass.aiff"]).await?;
            } else if cfg!(target_os = "linux") {
                run("paplay", &["/usr/share/sounds/freedesktop/stereo/bell.oga"]).await?;
            } else {
                ring_bell(&mut std::io::stdout())?;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        Ok(())
    }
}

pub struct DesktopSink;

#[async_trait]
impl NotificationSink for DesktopSink {
    fn name(&self) -> &'static str {
        "desktop"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        if cfg!(target_os = "linux") {
            run(
                "notify-send",
                &["-a", "WiFinder", event.title.as_str(), event.message.as_str()],
            )
            .await
        } else if cfg!(target_os = "macos") {
            let script = format!(
                "display notification {:?} with title {:?}",
                event.message, event.title
            );
            run("osascript", &["-e", script.as_str()]).await
        } else {
            Err(SinkError::Unsupported)
        }
    }
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

pub struct TelegramSink {
    client: reqwest::Client,
    api_url: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: &str) -> Self {
        TelegramSink {
            client: reqwest::Client::new(),
            api_url: format!("https://api.telegram.org/bot{token}"),
            chat_id: chat_id.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let message = TelegramMessage {
            chat_id: &self.chat_id,
            text: format!("*{}*\n{}", event.title, event.message),
            parse_mode: "Markdown",
        };
        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_url))
            .json(&message)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(response.status().as_u16()))
        }
    }
}

#[derive(Serialize)]
struct WebhookDevice {
    mac: String,
    name: Option<String>,
    vendor: Option<String>,
    ip: Option<String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    timestamp: String,
    kind: TransitionKind,
    severity: Severity,
    device: WebhookDevice,
}

impl<'a> WebhookPayload<'a> {
    fn from_event(event: &'a NotificationEvent) -> Self {
        WebhookPayload {
            title: &event.title,
            message: &event.message,
            timestamp: event.at().to_rfc3339(),
            kind: event.transition.kind,
            severity: event.severity,
            device: WebhookDevice {
                mac: event.device.id.to_string(),
                name: event.device.label.clone(),
                vendor: event.device.vendor.clone(),
                ip: event.device.address.map(|a| a.to_string()),
            },
        }
    }
}

/// POSTs each alert as JSON to a user-supplied URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Self {
        WebhookSink {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::from_event(event))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::presence::{Device, Transition};

    fn event(severity: Severity) -> NotificationEvent {
        let now = Utc::now();
        let mut device = Device::discovered("aa:bb:cc:dd:ee:ff".parse().unwrap(), now);
        device.label = Some("Alice".to_string());
        device.address = Some("192.168.1.10".parse().unwrap());
        NotificationEvent {
            transition: Transition {
                device: device.id,
                kind: TransitionKind::Arrived,
                at: now,
            },
            device,
            title: "Arrival".to_string(),
            message: "Alice is now home".to_string(),
            severity,
            destinations: vec!["webhook"],
        }
    }

    #[test]
    fn test_console_banner_only_for_panic() {
        let sink = ConsoleSink::new("RUN".to_string());
        let normal = sink.render(&event(Severity::Normal));
        assert!(normal.ends_with("● Alice"));
        assert!(!normal.contains("RUN"));

        let panic = sink.render(&event(Severity::Panic));
        let lines: Vec<&str> = panic.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "│    RUN    │");
        assert!(lines[3].ends_with("● Alice"));
    }

    #[test]
    fn test_sound_loops() {
        let sink = SoundSink::new(3);
        assert_eq!(sink.loops(Severity::Panic), 3);
        assert_eq!(sink.loops(Severity::Normal), 1);
        assert_eq!(SoundSink::new(0).loops(Severity::Panic), 1);
    }

    struct ClosedPipe;

    impl std::io::Write for ClosedPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_bell_surfaces_flush_errors() {
        let mut out = Vec::new();
        ring_bell(&mut out).unwrap();
        assert_eq!(out, b"\x07");

        assert!(matches!(
            ring_bell(&mut ClosedPipe),
            Err(SinkError::Command { command, .. }) if command == "bell"
        ));
    }

    #[test]
    fn test_webhook_payload() {
        let event = event(Severity::Panic);
        let payload = serde_json::to_value(WebhookPayload::from_event(&event)).unwrap();
        assert_eq!(payload["kind"], "arrived");
        assert_eq!(payload["severity"], "panic");
        assert_eq!(payload["device"]["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(payload["device"]["name"], "Alice");
        assert_eq!(payload["device"]["ip"], "192.168.1.10");
        assert!(payload["device"]["vendor"].is_null());
    }
}
