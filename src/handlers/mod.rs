//! API handlers for ParcelVault

mod health;
mod loan;

pub use health::*;
pub use loan::*;
