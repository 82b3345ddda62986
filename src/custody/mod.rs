//! Custody token side effects

mod coordinator;

pub use coordinator::{CustodyCoordinator, CustodyOutcome};
