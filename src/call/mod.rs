//! Call session core: per-call state machine, media egress, and the
//! process-wide registry.

pub mod manager;
pub mod media;
pub mod session;

pub use manager::{CallManager, InitiateResult};
pub use media::{EgressControl, EgressQueue};
pub use session::{CallSession, CallState, Speaker, TranscriptEntry};
