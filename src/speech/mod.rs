//! Unified speech-model driver: wire events, outbound queue discipline,
//! and the per-call bidirectional session.

pub mod events;
pub mod queue;
pub mod session;

pub use events::{ClientEvent, ContentKind, Role, ServerEvent};
pub use queue::EventQueue;
pub use session::{AgentCallbacks, SpeechAgentSession, ToolUseRequest};
