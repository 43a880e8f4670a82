pub mod auth;
pub mod config;
pub mod engine;
pub mod ingress;
pub mod metrics;
pub mod request;
pub mod runner;
pub mod supervisor;

// Re-export key types for integration tests and embedding.
pub use crate::config::{ConfigError, EngineConfig};
pub use crate::engine::{Phase, RuleEngineHandle, RuleSet, RuleSetBuilder};
pub use crate::metrics::EngineMetrics;
pub use crate::request::{Disposition, InBandVerdict, ParsedRequest};
pub use crate::supervisor::Supervisor;
