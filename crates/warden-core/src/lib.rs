pub mod archive;
pub mod config;
pub mod error;
pub mod event;
pub mod intent;
pub mod policy_decision;
pub mod ports;
pub mod security;
pub mod types;

pub use archive::{ArchivedMessage, ReplyArchivePort};
pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use event::{InboundEvent, OutboundEvent, ReactionMeta};
pub use intent::{Intent, ManualMemoryKind};
pub use policy_decision::PolicyDecision;
pub use ports::{
    GroupDirectoryPort, InboundPublisherPort, LlmClassifierPort, LlmRisk, MemoryNotesPort,
    ModelRouterPort, ReadyReport, ResponderPort, RouteProfile, RuntimeSupervisorPort,
    SecurityPort, TelemetryPort, TtsAudio, TtsPort,
};
pub use security::{SecurityAction, SecurityResult, SecurityStage, Severity};
pub use types::{
    AllowedToolsMode, NotesMode, SessionKey, ToolAccessMode, VoiceOutputMode, WhenToReplyMode,
    WhoCanTalkMode,
};
