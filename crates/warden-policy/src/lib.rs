pub mod engine;
pub mod identity;
pub mod loader;
pub mod persona;
pub mod schema;

pub use engine::{ActorContext, EffectivePolicy, MemoryNotesDecision, PolicyEngine};
pub use identity::{normalize_identity_token, normalize_sender_list, resolve_actor_identity, ActorIdentity};
pub use loader::{ensure_policy_file, load_policy, save_policy};
pub use persona::{load_persona_text, resolve_persona_path};
pub use schema::PolicyConfig;
