//! EISV dynamics library for agent governance
//!
//! Models a single agent as a four-dimensional thermodynamic state
//! `(E, I, S, V)` — energy, information integrity, entropy, void integral —
//! advanced one forward-Euler step per reported update. From the new state
//! the library derives a coherence scalar, a risk score, a margin
//! classification, a trajectory regime, a governance verdict, and the
//! sampling parameters the agent should apply on its next turn.
//!
//! Everything in this crate is CPU-only and synchronous. Persistence,
//! locking, and lifecycle live in the `agentgov` service crate.

pub mod genesis;
pub mod integrator;
pub mod params;
pub mod regime;
pub mod risk;
pub mod sampling;
pub mod state;
pub mod verdict;

pub use genesis::GenesisSignature;
pub use integrator::{DynamicsError, StateInputs, StepReport, advance};
pub use params::{DynamicsParams, IDynamicsMode};
pub use regime::Regime;
pub use risk::{CalibrationTable, Margin, coherence, margin_of, risk_score};
pub use sampling::SamplingParams;
pub use state::{EisvState, HistoryPoint, HistoryRing};
pub use verdict::{Verdict, VerdictOutcome};
