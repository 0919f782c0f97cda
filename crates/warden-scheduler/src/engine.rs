use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};
use warden_core::{InboundEvent, InboundPublisherPort};

use crate::store::JobStore;
use crate::types::Payload;

/// "system"-channel pseudo-chat the cron producer publishes synthetic
/// inbound events onto; the orchestrator recognises this channel and skips
/// normal sender/policy handling for it.
pub const SYSTEM_CHANNEL: &str = "system";

/// Drains due jobs from a [`JobStore`] on a fixed poll and publishes a
/// synthetic inbound event per firing. Never calls the responder directly:
/// the orchestrator decides what a `system`-channel event means.
pub struct SchedulerEngine {
    store: Arc<JobStore>,
    publisher: Arc<dyn InboundPublisherPort>,
    poll_interval: std::time::Duration,
}

impl SchedulerEngine {
    pub fn new(store: Arc<JobStore>, publisher: Arc<dyn InboundPublisherPort>) -> Self {
        Self {
            store,
            publisher,
            poll_interval: std::time::Duration::from_secs(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("cron scheduler started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for job in self.store.due_jobs(now_ms) {
            let event = build_event(&job.id, &job.name, &job.payload, now_ms);
            self.publisher.publish_inbound(event).await;
            if let Err(e) = self.store.record_fire(&job.id, now_ms) {
                error!(job_id = %job.id, error = %e, "failed to record cron job fire");
            }
        }
    }
}

fn build_event(job_id: &str, job_name: &str, payload: &Payload, now_ms: i64) -> InboundEvent {
    let mut metadata = BTreeMap::new();
    metadata.insert("cron_job_id".to_string(), Value::String(job_id.to_string()));
    metadata.insert("cron_job_name".to_string(), Value::String(job_name.to_string()));

    let content = match payload {
        Payload::Text {
            message,
            deliver,
            to,
            channel,
        } => {
            metadata.insert("payload_kind".to_string(), Value::String("text".to_string()));
            metadata.insert("deliver".to_string(), Value::Bool(*deliver));
            if let Some(to) = to {
                metadata.insert("deliver_to".to_string(), Value::String(to.clone()));
            }
            if let Some(channel) = channel {
                metadata.insert(
                    "deliver_channel".to_string(),
                    Value::String(channel.clone()),
                );
            }
            message.clone()
        }
        Payload::VoiceBroadcast {
            messages,
            randomize,
            group,
            chat_id,
            channel,
            voice,
            tts_route,
            verbatim,
            max_sentences,
            max_chars,
        } => {
            metadata.insert(
                "payload_kind".to_string(),
                Value::String("voice_broadcast".to_string()),
            );
            metadata.insert("verbatim".to_string(), Value::Bool(*verbatim));
            metadata.insert(
                "voice_channel".to_string(),
                Value::String(channel.clone()),
            );
            if let Some(group) = group {
                metadata.insert("voice_group".to_string(), Value::String(group.clone()));
            }
            if let Some(chat_id) = chat_id {
                metadata.insert("voice_chat_id".to_string(), Value::String(chat_id.clone()));
            }
            if let Some(voice) = voice {
                metadata.insert("voice_name".to_string(), Value::String(voice.clone()));
            }
            if let Some(tts_route) = tts_route {
                metadata.insert("tts_route".to_string(), Value::String(tts_route.clone()));
            }
            if let Some(max_sentences) = max_sentences {
                metadata.insert(
                    "max_sentences".to_string(),
                    Value::Number((*max_sentences).into()),
                );
            }
            if let Some(max_chars) = max_chars {
                metadata.insert("max_chars".to_string(), Value::Number((*max_chars).into()));
            }
            choose_phrase(messages, *randomize)
        }
    };

    InboundEvent {
        channel: SYSTEM_CHANNEL.to_string(),
        chat_id: format!("cron:{job_id}"),
        sender_id: "cron".to_string(),
        content,
        message_id: None,
        timestamp: chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now),
        participant: None,
        is_group: false,
        mentioned_bot: false,
        reply_to_bot: false,
        reply_to_message_id: None,
        reply_to_participant: None,
        reply_to_text: None,
        media: Vec::new(),
        raw_metadata: metadata,
    }
}

fn choose_phrase(messages: &[String], randomize: bool) -> String {
    if messages.is_empty() {
        return String::new();
    }
    if randomize {
        let mut rng = rand::thread_rng();
        messages
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| messages[0].clone())
    } else {
        messages[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::types::Schedule;
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
    async fn due_text_job_publishes_and_is_removed_when_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("jobs.json")).unwrap());
        let job = store
            .add_job(
                "wakeup".to_string(),
                Schedule::At { at_ms: 1 },
                Payload::Text {
                    message: "good morning".to_string(),
                    deliver: true,
                    to: Some("123".to_string()),
                    channel: Some("whatsapp".to_string()),
                },
            )
            .unwrap();

        let publisher = Arc::new(RecordingPublisher {
            events: Mutex::new(Vec::new()),
        });
        let engine = SchedulerEngine::new(store.clone(), publisher.clone());
        engine.tick().await;

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, SYSTEM_CHANNEL);
        assert_eq!(events[0].content, "good morning");
        assert!(store.get_job(&job.id).is_none());
    }

    #[test]
    fn non_randomized_voice_broadcast_always_picks_first_phrase() {
        let phrases = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(choose_phrase(&phrases, false), "a");
    }
}
