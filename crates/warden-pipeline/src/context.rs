use warden_core::{Intent, InboundEvent, PolicyDecision};

/// Mutable state threaded through the middleware chain for one inbound
/// event. Middleware that needs to enrich the event (e.g. reply-context)
/// replaces `event` with a modified clone rather than mutating fields in
/// place, matching how the event itself is treated as an immutable value.
pub struct PipelineContext {
    pub event: InboundEvent,
    pub decision: Option<PolicyDecision>,
    pub intents: Vec<Intent>,
    pub reply: Option<String>,
    pub halted: bool,
}

impl PipelineContext {
    pub fn new(event: InboundEvent) -> Self {
        Self {
            event,
            decision: None,
            intents: Vec::new(),
            reply: None,
            halted: false,
        }
    }

    /// Appends a `RecordMetric` intent with no labels and value 1 — the
    /// shorthand most middleware reaches for.
    pub fn metric(&mut self, name: impl Into<String>) {
        self.metric_with(name, 1, Vec::new());
    }

    pub fn metric_with(&mut self, name: impl Into<String>, value: i64, labels: Vec<(String, String)>) {
        self.intents.push(Intent::RecordMetric {
            name: name.into(),
            value,
            labels,
        });
    }

    /// Signals the pipeline to stop executing further middleware.
    pub fn halt(&mut self) {
        self.halted = true;
    }
}
