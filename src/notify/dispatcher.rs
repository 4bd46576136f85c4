use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use futures::future::join_all;
use log::{debug, warn};

use super::{NotificationEvent, NotificationSink, Severity};
use crate::config::AppConfig;
use crate::engine::Reconciliation;
use crate::error::{ConfigError, SinkError};
use crate::presence::{Device, DeviceId, Transition, TransitionKind};

/// Daily window, in local hours, during which normal alerts are held
/// back. Inclusive of `start`, exclusive of `end`, and may wrap past
/// midnight (23 to 7). Equal ends make an empty window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuietHours {
    start: u32,
    end: u32,
}

impl QuietHours {
    pub fn new(start: u32, end: u32) -> Self {
        QuietHours { start, end }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    pub quiet_hours: Option<QuietHours>,
    pub panic_enabled: bool,
    pub panic_banner: String,
    pub panic_only_unknown: bool,
    pub custom_messages: HashMap<DeviceId, String>,
    /// Identical (device, kind) alerts inside this window are dropped.
    pub cooldown: Duration,
    pub sink_timeout: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(DispatchPolicy {
            quiet_hours: config
                .quiet_hours()?
                .map(|(start, end)| QuietHours::new(start, end)),
            panic_enabled: config.panic.enabled,
            panic_banner: config.panic.message.clone(),
            panic_only_unknown: config.panic.only_unknown,
            custom_messages: config.custom_messages()?,
            cooldown: config.cooldown(),
            sink_timeout: config.sink_timeout(),
        })
    }
}

pub struct Dispatcher {
    policy: DispatchPolicy,
    sinks: Vec<Box<dyn NotificationSink>>,
    recent: HashMap<(DeviceId, TransitionKind), DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(policy: DispatchPolicy, sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Dispatcher {
            policy,
            sinks,
            recent: HashMap::new(),
        }
    }

    /// Turn a cycle's transitions into alerts and deliver them. Returns
    /// the events handed to the sinks, whether or not every sink
    /// succeeded.
    pub async fn dispatch(
        &mut self,
        cycle: &Reconciliation,
        now: DateTime<Utc>,
    ) -> Vec<NotificationEvent> {
        let cooldown = chrono::Duration::from_std(self.policy.cooldown)
            .unwrap_or(chrono::Duration::MAX);
        self.recent.retain(|_, sent_at| now - *sent_at < cooldown);

        let hour = now.with_timezone(&Local).hour();
        let quiet = self.policy.quiet_hours.is_some_and(|q| q.contains(hour));

        let mut sent = Vec::new();
        for transition in &cycle.transitions {
            let Some(device) = cycle.device(&transition.device) else {
                warn!("No record for {}, not notifying", transition.device);
                continue;
            };

            let severity = self.severity(transition, device);
            if quiet && severity != Severity::Panic {
                debug!("Quiet hours, holding back {:?} for {}", transition.kind, device.id);
                continue;
            }

            let key = (transition.device, transition.kind);
            if self.recent.contains_key(&key) {
                debug!("Already notified {:?} for {}", transition.kind, device.id);
                continue;
            }

            let event = self.compose(transition, device, severity);
            self.deliver(&event).await;
            debug!(
                "{:?} for {} handed to {}",
                transition.kind,
                device.id,
                event.destinations.join(", ")
            );
            self.recent.insert(key, now);
            sent.push(event);
        }
        sent
    }

    fn severity(&self, transition: &Transition, device: &Device) -> Severity {
        let promoted = self.policy.panic_enabled
            && transition.kind == TransitionKind::Arrived
            && !(self.policy.panic_only_unknown && device.label.is_some());
        if promoted {
            Severity::Panic
        } else {
            Severity::Normal
        }
    }

    fn compose(
        &self,
        transition: &Transition,
        device: &Device,
        severity: Severity,
    ) -> NotificationEvent {
        let name = device.display_name();
        let details = [
            device.vendor.clone().unwrap_or_else(|| "Unknown vendor".to_string()),
            device.id.to_string(),
            device
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "no address".to_string()),
        ]
        .join(" · ");

        let (title, default_message) = match transition.kind {
            TransitionKind::Arrived if device.first_seen == transition.at => {
                ("New Device", format!("New device {name} joined the network\n{details}"))
            }
            TransitionKind::Arrived => ("Arrival", format!("{name} is now home\n{details}")),
            TransitionKind::Departed => ("Departure", format!("{name} has left\n{details}")),
        };

        let custom = match transition.kind {
            TransitionKind::Arrived => self.policy.custom_messages.get(&device.id).cloned(),
            TransitionKind::Departed => None,
        };
        let message = custom.unwrap_or(default_message);

        let message = match severity {
            Severity::Panic => format!("*** {} ***\n{}", self.policy.panic_banner, message),
            Severity::Normal => message,
        };

        NotificationEvent {
            transition: transition.clone(),
            device: device.clone(),
            title: title.to_string(),
            message,
            severity,
            destinations: self.sinks.iter().map(|s| s.name()).collect(),
        }
    }

    async fn deliver(&self, event: &NotificationEvent) {
        let timeout = self.policy.sink_timeout;
        let results = join_all(self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(timeout, sink.send(event)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(timeout)),
            };
            (sink.name(), result)
        }))
        .await;

        for (name, result) in results {
            if let Err(err) = result {
                warn!(
                    "{} notification for {} failed: {}",
                    name, event.transition.device, err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSink {
        received: Arc<Mutex<Vec<NotificationEvent>>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
            self.received.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), SinkError> {
            Err(SinkError::Rejected(500))
        }
    }

    struct StuckSink;

    #[async_trait]
    impl NotificationSink for StuckSink {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            quiet_hours: None,
            panic_enabled: false,
            panic_banner: "PANIC".to_string(),
            panic_only_unknown: true,
            custom_messages: HashMap::new(),
            cooldown: Duration::from_secs(30),
            sink_timeout: Duration::from_secs(10),
        }
    }

    fn local(hour: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2024, 1, 10, hour, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn device(label: Option<&str>, first_seen: DateTime<Utc>) -> Device {
        let mut d = Device::discovered("aa:bb:cc:dd:ee:ff".parse().unwrap(), first_seen);
        d.label = label.map(str::to_string);
        d.vendor = Some("Apple".to_string());
        d.address = Some("192.168.1.10".parse().unwrap());
        d
    }

    fn cycle(device: &Device, kind: TransitionKind, at: DateTime<Utc>) -> Reconciliation {
        Reconciliation::from_devices(
            vec![Transition {
                device: device.id,
                kind,
                at,
            }],
            vec![device.clone()],
        )
    }

    fn dispatcher(policy: DispatchPolicy, sink: &RecordingSink) -> Dispatcher {
        Dispatcher::new(policy, vec![Box::new(sink.clone())])
    }

    #[test]
    fn test_quiet_hours_window() {
        let overnight = QuietHours::new(23, 7);
        assert!(overnight.contains(23));
        assert!(overnight.contains(2));
        assert!(!overnight.contains(7));
        assert!(!overnight.contains(12));

        let daytime = QuietHours::new(9, 17);
        assert!(daytime.contains(9));
        assert!(!daytime.contains(17));
        assert!(!daytime.contains(8));

        assert!(!QuietHours::new(5, 5).contains(5));
    }

    #[tokio::test]
    async fn test_default_messages() {
        let sink = RecordingSink::default();
        let mut dispatcher = dispatcher(policy(), &sink);
        let now = local(12);
        let d = device(None, now - chrono::Duration::hours(1));

        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Arrival");
        assert_eq!(sent[0].severity, Severity::Normal);
        assert_eq!(sent[0].destinations, vec!["recording"]);
        assert!(sent[0].message.contains("Apple (DD:EE:FF) is now home"));
        assert!(sent[0].message.contains("Apple · AA:BB:CC:DD:EE:FF · 192.168.1.10"));

        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Departed, now), now).await;
        assert_eq!(sent[0].title, "Departure");
        assert!(sent[0].message.contains("has left"));
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_new_device_title() {
        let sink = RecordingSink::default();
        let mut dispatcher = dispatcher(policy(), &sink);
        let now = local(12);
        let d = device(None, now);

        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent[0].title, "New Device");
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_normal_but_not_panic() {
        let sink = RecordingSink::default();
        let mut quiet = policy();
        quiet.quiet_hours = Some(QuietHours::new(23, 7));
        let now = local(2);
        let d = device(None, now);

        let mut normal = dispatcher(quiet.clone(), &sink);
        assert!(normal.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await.is_empty());
        assert_eq!(sink.count(), 0);

        quiet.panic_enabled = true;
        let mut panicky = dispatcher(quiet, &sink);
        let sent = panicky.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Panic);
        assert_eq!(sink.count(), 1);

        // departures are never panic, so they stay quiet
        let sent = panicky.dispatch(&cycle(&d, TransitionKind::Departed, now), now).await;
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_replay_within_cooldown_sends_once() {
        let sink = RecordingSink::default();
        let mut dispatcher = dispatcher(policy(), &sink);
        let now = local(12);
        let d = device(None, now);
        let replayed = cycle(&d, TransitionKind::Arrived, now);

        assert_eq!(dispatcher.dispatch(&replayed, now).await.len(), 1);
        assert!(dispatcher.dispatch(&replayed, now).await.is_empty());
        let later = now + chrono::Duration::seconds(29);
        assert!(dispatcher.dispatch(&replayed, later).await.is_empty());
        assert_eq!(sink.count(), 1);

        let expired = now + chrono::Duration::seconds(30);
        assert_eq!(dispatcher.dispatch(&replayed, expired).await.len(), 1);
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_suppressed_events_are_not_remembered() {
        let sink = RecordingSink::default();
        let mut quiet = policy();
        quiet.quiet_hours = Some(QuietHours::new(1, 3));
        quiet.cooldown = Duration::from_secs(7200);
        let mut dispatcher = dispatcher(quiet, &sink);
        let d = device(None, local(0));

        let at_two = local(2);
        assert!(dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, at_two), at_two).await.is_empty());
        let at_three = local(3);
        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, at_three), at_three).await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_panic_formatting_and_custom_messages() {
        let sink = RecordingSink::default();
        let mut panic = policy();
        panic.panic_enabled = true;
        let d = device(None, local(0));
        panic
            .custom_messages
            .insert(d.id, "The landlord is here".to_string());
        let mut dispatcher = dispatcher(panic, &sink);
        let now = local(12);

        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent[0].severity, Severity::Panic);
        assert_eq!(sent[0].message, "*** PANIC ***\nThe landlord is here");
    }

    #[tokio::test]
    async fn test_only_unknown_devices_panic() {
        let sink = RecordingSink::default();
        let mut panic = policy();
        panic.panic_enabled = true;
        let mut dispatcher = dispatcher(panic.clone(), &sink);
        let now = local(12);
        let known = device(Some("Alice"), local(0));

        let sent = dispatcher.dispatch(&cycle(&known, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent[0].severity, Severity::Normal);
        assert!(sent[0].message.starts_with("Alice is now home"));

        panic.panic_only_unknown = false;
        let mut everyone = Dispatcher::new(panic, vec![Box::new(sink.clone())]);
        let sent = everyone.dispatch(&cycle(&known, TransitionKind::Arrived, now), now).await;
        assert_eq!(sent[0].severity, Severity::Panic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_stuck_sinks_are_isolated() {
        let sink = RecordingSink::default();
        let mut dispatcher = Dispatcher::new(
            policy(),
            vec![
                Box::new(FailingSink),
                Box::new(StuckSink),
                Box::new(sink.clone()),
            ],
        );
        let now = local(12);
        let d = device(None, now);

        let started = tokio::time::Instant::now();
        let sent = dispatcher.dispatch(&cycle(&d, TransitionKind::Arrived, now), now).await;

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destinations, vec!["failing", "stuck", "recording"]);
        assert_eq!(sink.count(), 1);
        assert!(started.elapsed() <= Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_transition_without_record_is_skipped() {
        let sink = RecordingSink::default();
        let mut dispatcher = dispatcher(policy(), &sink);
        let now = local(12);
        let orphan = Reconciliation::from_devices(
            vec![Transition {
                device: "aa:bb:cc:00:00:09".parse().unwrap(),
                kind: TransitionKind::Arrived,
                at: now,
            }],
            vec![],
        );
        assert!(dispatcher.dispatch(&orphan, now).await.is_empty());
    }
}
