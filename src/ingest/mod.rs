//! Inbound ingestion: webhook payload normalization and identity resolution.

pub mod normalizer;
pub mod resolver;
pub mod types;

pub use normalizer::normalize;
pub use resolver::Resolver;
pub use types::{InboundEvent, Resolution};
