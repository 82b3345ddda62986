//! Loan domain module
//!
//! Contains the loan models and the lifecycle state machine.

mod model;
pub mod state_machine;

pub use model::*;
pub use state_machine::{LoanStateMachine, TransitionError};
