//! Connectivity for networked light strips.
//!
//! ```text
//! orchestrator ──► wifi ──► discovery
//!      │                     │
//!      ├──► mqtt (session) ◄─┘ broker uri
//!      ├──► registration
//!      └──► persistence
//! ```

pub mod discovery;
pub mod mqtt;
pub mod orchestrator;
pub mod persistence;
pub mod registration;
pub mod wifi;

pub use orchestrator::{Orchestrator, OrchestratorError, ProvisionOutcome, RunOutcome};
