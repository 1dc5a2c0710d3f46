//! Decision making and the engine loop

pub mod decision;
pub mod engine;

pub use decision::{in_settlement_window, AdvisoryProvider, Decision, DecisionAction, DecisionPolicy};
pub use engine::{ArbitrageEngine, CycleReport, EngineHandle, SessionSummary};
