use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::error;
use warden_core::{InboundEvent, InboundPublisherPort, OutboundEvent};

use crate::queue::BoundedDropQueue;

/// Reaction-only delivery instruction for a channel adapter, mirroring the
/// fields `Intent::SendReaction` carries.
#[derive(Debug, Clone)]
pub struct ReactionDispatch {
    pub channel: String,
    pub chat_id: String,
    pub message_id: String,
    pub emoji: String,
    pub participant: Option<String>,
}

/// Snapshot of queue depths and cumulative drop counts, for the `/status`
/// admin command and health checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStatus {
    pub inbound_len: usize,
    pub outbound_len: usize,
    pub reaction_len: usize,
    pub inbound_dropped: usize,
    pub outbound_dropped: usize,
    pub reaction_dropped: usize,
}

/// In-process message bus decoupling channel adapters from the pipeline
/// consumer. Three bounded, drop-oldest queues; outbound and reaction
/// consumption additionally fan out to per-channel subscribers so multiple
/// channel adapters can share one bus without the consumer knowing which
/// channels exist.
pub struct MessageBus {
    inbound: BoundedDropQueue<InboundEvent>,
    outbound: BoundedDropQueue<OutboundEvent>,
    reaction: BoundedDropQueue<ReactionDispatch>,
    outbound_subscribers: DashMap<String, Vec<mpsc::Sender<OutboundEvent>>>,
    reaction_subscribers: DashMap<String, Vec<mpsc::Sender<ReactionDispatch>>>,
}

impl MessageBus {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize, reaction_capacity: usize) -> Self {
        Self {
            inbound: BoundedDropQueue::new("inbound", inbound_capacity),
            outbound: BoundedDropQueue::new("outbound", outbound_capacity),
            reaction: BoundedDropQueue::new("reaction", reaction_capacity),
            outbound_subscribers: DashMap::new(),
            reaction_subscribers: DashMap::new(),
        }
    }

    pub async fn publish_inbound(&self, event: InboundEvent) {
        self.inbound.push(event).await;
    }

    pub async fn consume_inbound(&self) -> InboundEvent {
        self.inbound.pop().await
    }

    pub async fn publish_outbound(&self, event: OutboundEvent) {
        self.outbound.push(event).await;
    }

    pub async fn consume_outbound(&self) -> OutboundEvent {
        self.outbound.pop().await
    }

    pub async fn publish_reaction(&self, reaction: ReactionDispatch) {
        self.reaction.push(reaction).await;
    }

    pub async fn consume_reaction(&self) -> ReactionDispatch {
        self.reaction.pop().await
    }

    /// Registers a per-channel subscriber for outbound delivery. The adapter
    /// owning `channel` reads from `rx` instead of polling `consume_outbound`
    /// itself, so `dispatch_outbound` must be running for this to fire.
    pub fn subscribe_outbound(&self, channel: impl Into<String>) -> mpsc::Receiver<OutboundEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.outbound_subscribers
            .entry(channel.into())
            .or_default()
            .push(tx);
        rx
    }

    pub fn subscribe_reaction(&self, channel: impl Into<String>) -> mpsc::Receiver<ReactionDispatch> {
        let (tx, rx) = mpsc::channel(64);
        self.reaction_subscribers
            .entry(channel.into())
            .or_default()
            .push(tx);
        rx
    }

    /// Background loop: drains the outbound queue and fans each message out
    /// to subscribers registered for its channel. Polls with a 1-second
    /// timeout so a stop signal propagates promptly even when idle.
    pub async fn dispatch_outbound(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = tokio::time::timeout(Duration::from_secs(1), self.consume_outbound()) => {
                    if let Ok(msg) = msg {
                        if let Some(subscribers) = self.outbound_subscribers.get(&msg.channel) {
                            for tx in subscribers.iter() {
                                if tx.send(msg.clone()).await.is_err() {
                                    error!(channel = %msg.channel, "outbound subscriber channel closed");
                                }
                            }
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn dispatch_reactions(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = tokio::time::timeout(Duration::from_secs(1), self.consume_reaction()) => {
                    if let Ok(msg) = msg {
                        if let Some(subscribers) = self.reaction_subscribers.get(&msg.channel) {
                            for tx in subscribers.iter() {
                                if tx.send(msg.clone()).await.is_err() {
                                    error!(channel = %msg.channel, "reaction subscriber channel closed");
                                }
                            }
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn status(&self) -> BusStatus {
        BusStatus {
            inbound_len: self.inbound.len().await,
            outbound_len: self.outbound.len().await,
            reaction_len: self.reaction.len().await,
            inbound_dropped: self.inbound.dropped_count(),
            outbound_dropped: self.outbound.dropped_count(),
            reaction_dropped: self.reaction.dropped_count(),
        }
    }
}

#[async_trait]
impl InboundPublisherPort for MessageBus {
    async fn publish_inbound(&self, event: InboundEvent) {
        MessageBus::publish_inbound(self, event).await;
    }
}

/// Convenience alias for the common case of sharing one bus across tasks.
pub type SharedBus = Arc<MessageBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event() -> InboundEvent {
        InboundEvent {
            channel: "whatsapp".to_string(),
            chat_id: "123".to_string(),
            sender_id: "456".to_string(),
            content: "hi".to_string(),
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
            raw_metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn publish_and_consume_round_trips() {
        let bus = MessageBus::new(4, 4, 4);
        bus.publish_inbound(sample_event()).await;
        let event = bus.consume_inbound().await;
        assert_eq!(event.chat_id, "123");
    }

    #[tokio::test]
    async fn status_reports_queue_depth_and_drops() {
        let bus = MessageBus::new(1, 4, 4);
        bus.publish_inbound(sample_event()).await;
        bus.publish_inbound(sample_event()).await;
        let status = bus.status().await;
        assert_eq!(status.inbound_len, 1);
        assert_eq!(status.inbound_dropped, 1);
    }
}
