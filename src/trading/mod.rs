//! Trading execution modules

pub mod breakers;
pub mod dry_run;
pub mod executor;
pub mod position;
pub mod position_manager;

pub use breakers::{BreakerTrip, CircuitBreakers, TradeAction};
pub use dry_run::{DryRunLedger, PaperAccount, PaperMetrics};
pub use executor::{Executor, RotationResult};
pub use position::{ArbPosition, SymbolState};
pub use position_manager::{PositionManager, SessionStats, SyncReport};
