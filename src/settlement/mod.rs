//! Settlement network access and transfer verification

mod client;
mod model;
pub mod simulated;
mod verifier;

pub use client::{ClientError, HttpSettlementClient, SettlementClient};
pub use model::*;
pub use verifier::SettlementVerifier;
