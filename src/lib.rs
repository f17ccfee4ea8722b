//! Zero-confirmation cross-chain loans
//!
//! A borrower signs a liquidity request and publishes it; a keeper watching the
//! channel lends against the bitcoin deposit as soon as it confirms, before the
//! attestation network has minted the collateral on the settlement chain. Once the
//! attestation signature lands the loan is repaid through its borrow proxy, or the
//! keeper defaults it after expiry.

pub mod api;
pub mod backend;
pub mod config;
pub mod contracts;
pub mod driver;
pub mod error;
pub mod keeper;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod pubsub;
pub mod request;
pub mod rpc;
pub mod state;

#[cfg(test)]
mod testing;

pub use driver::Driver;
pub use error::{ZeroError, ZeroResult};
pub use lifecycle::{RetryPolicy, Zero};
pub use proxy::BorrowProxy;
pub use request::{LiquidityRequest, LiquidityRequestParcel};
