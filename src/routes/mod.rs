//! Route definitions for ParcelVault API

mod loan;

pub use loan::loan_routes;
