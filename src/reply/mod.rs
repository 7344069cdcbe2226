//! Per-conversation reply state machine.
//!
//! `COLLECTING -> CONFIRMING -> DONE`, with an orthogonal sticky stop flag.

pub mod engine;
pub mod extract;
pub mod flows;
pub mod machine;
pub mod state;

pub use engine::{FollowUpOutcome, ReplyEngine, ReplyOutcome};
pub use extract::{FieldExtractor, RegexFieldExtractor};
pub use flows::FlowCatalog;
pub use state::{ReplyStage, ReplyState, StopReason};
