//! Outbound dispatch: idempotency check, send claim, provider call.

pub mod dispatcher;
pub mod similarity;

pub use dispatcher::{DispatchOutcome, Dispatcher, OutboundRequest};
