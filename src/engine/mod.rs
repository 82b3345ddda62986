//! Settlement engine
//!
//! Loan lifecycle orchestration and the background reconciliation monitor.

mod clock;
mod monitor;
mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use monitor::{reconciliation_monitor, MonitorReport, ReconciliationMonitor};
pub use service::{EngineSettings, SettlementEngine};
