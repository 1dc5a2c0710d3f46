//! Utility modules

pub mod logger;
pub mod metrics;

pub use logger::init as init_logging;
