//! Inbound message pipeline.
//!
//! Every webhook delivery flows through:
//! 1. `normalize()`: channel payload to canonical events
//! 2. `Resolver::resolve()`: dedup and identity, inline with the request
//! 3. `ReplyEngine` then event rules, in a spawned task

pub mod processor;

pub use processor::InboundProcessor;
