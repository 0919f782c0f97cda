use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;
use warden_core::{InboundEvent, InboundPublisherPort};

use crate::engine::SYSTEM_CHANNEL;

const DEFAULT_INTERVAL_SECS: u64 = 30 * 60;

/// Fires a synthetic prompt through the responder at a fixed interval,
/// independent of any cron job. Used for ambient check-ins ("has anything
/// changed since we last talked?") rather than user-scheduled reminders.
pub struct HeartbeatEngine {
    publisher: Arc<dyn InboundPublisherPort>,
    interval: std::time::Duration,
    prompt: String,
}

impl HeartbeatEngine {
    pub fn new(publisher: Arc<dyn InboundPublisherPort>) -> Self {
        Self {
            publisher,
            interval: std::time::Duration::from_secs(DEFAULT_INTERVAL_SECS),
            prompt: "heartbeat".to_string(),
        }
    }

    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat producer started");
        let mut interval = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so the heartbeat honors
        // a full interval before the first synthetic event.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.fire().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat producer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn fire(&self) {
        let mut metadata = BTreeMap::new();
        metadata.insert("payload_kind".to_string(), Value::String("heartbeat".to_string()));

        let event = InboundEvent {
            channel: SYSTEM_CHANNEL.to_string(),
            chat_id: "heartbeat".to_string(),
            sender_id: "heartbeat".to_string(),
            content: self.prompt.clone(),
            message_id: None,
            timestamp: Utc::now(),
            participant: None,
            is_group: false,
            mentioned_bot: false,
            reply_to_bot: false,
            reply_to_message_id: None,
            reply_to_participant: None,
            reply_to_text: None,
            media: Vec::new(),
            raw_metadata: metadata,
        };
        self.publisher.publish_inbound(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingPublisher {
        events: Mutex<Vec<InboundEvent>>,
    }

    #[async_trait]
    impl InboundPublisherPort for RecordingPublisher {
        async fn publish_inbound(&self, event: InboundEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn fire_publishes_a_system_channel_event() {
        let publisher = Arc::new(RecordingPublisher {
            events: Mutex::new(Vec::new()),
        });
        let heartbeat = HeartbeatEngine::new(publisher.clone()).with_prompt("check in");
        heartbeat.fire().await;

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, SYSTEM_CHANNEL);
        assert_eq!(events[0].content, "check in");
    }
}
