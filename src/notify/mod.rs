//! Notification policy and delivery.
//!
//! The [`Dispatcher`] decides which transitions become alerts and what
//! they say; sinks deliver them. Sinks are fire-and-forget: a failing
//! or slow sink is logged and never holds up the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use crate::config::AppConfig;
use crate::error::SinkError;
use crate::presence::{Device, Transition};

mod dispatcher;
pub mod mqtt;
mod sinks;

pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use sinks::{ConsoleSink, DesktopSink, SoundSink, TelegramSink, WebhookSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Panic,
}

#[derive(Clone, Debug)]
pub struct NotificationEvent {
    pub transition: Transition,
    /// The device as committed in the cycle that produced the transition.
    pub device: Device,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    /// Names of the sinks the event was handed to.
    pub destinations: Vec<&'static str>,
}

impl NotificationEvent {
    pub fn at(&self) -> DateTime<Utc> {
        self.transition.at
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError>;
}

/// Sinks enabled by the config, in delivery order. MQTT is wired up
/// separately since it needs its event loop driven.
pub fn configured_sinks(config: &AppConfig) -> Vec<Box<dyn NotificationSink>> {
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(ConsoleSink::new(
        config.panic.message.clone(),
    ))];

    if config.notify.desktop {
        sinks.push(Box::new(DesktopSink));
    }
    if config.notify.sound {
        sinks.push(Box::new(SoundSink::new(config.panic.sound_loops)));
    }
    if let (Some(token), Some(chat_id)) = (
        config.notify.telegram_token.as_ref(),
        config.notify.telegram_chat_id.as_ref(),
    ) {
        sinks.push(Box::new(TelegramSink::new(token, chat_id)));
    }
    if let Some(url) = &config.notify.webhook_url {
        sinks.push(Box::new(WebhookSink::new(url)));
    }
    sinks
}
