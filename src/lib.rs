//! Leadline: inbound lead messaging with idempotent dispatch, a reply state
//! machine and rule-based automation.

pub mod api;
pub mod automation;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod reply;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
