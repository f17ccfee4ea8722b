//! Keeper daemon
//!
//! The keeper:
//! 1. Resumes unfinished parcels from the store
//! 2. Listens for liquidity requests on the signaling channel
//! 3. Drives each parcel through deposit, attestation and borrow
//! 4. Defaults loans whose expiry block has passed

pub mod engine;

pub use engine::KeeperEngine;
