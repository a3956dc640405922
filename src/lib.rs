//! agentgov - thermodynamic governance runtime for concurrent AI agents
//!
//! Agents report updates; the engine integrates a four-dimensional EISV
//! state per update and issues a verdict. A background detector recovers
//! stuck agents, directly when safe and through dialectic peer review when
//! not. See the `eisv-dynamics` crate for the state equations.

pub mod audit;
pub mod cache;
pub mod config;
pub mod dialectic;
pub mod engine;
pub mod error;
pub mod identity;
pub mod knowledge;
pub mod lock;
pub mod observe;
pub mod ops;
pub mod recovery;
pub mod store;
pub mod summarize;

#[cfg(test)]
mod tests;

pub use engine::{GovernanceEngine, UpdateRequest, UpdateResult};
pub use error::{ErrorCode, GovError, GovResult};
pub use identity::{AgentIdentity, AgentStatus, IdentityResolver, TrustTier};
pub use ops::Services;
