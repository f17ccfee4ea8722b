//! Parcel persistence
//!
//! Handles:
//! - Loan progress records keyed by deposit address
//! - Resuming unfinished parcels after a restart
//! - Aggregate counts for the status API

mod manager;
mod memory;

pub use manager::PgParcelStore;
pub use memory::MemoryParcelStore;

use crate::error::ZeroResult;
use crate::lifecycle::{LoanProgress, LoanState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Storage for loan progress
#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Insert or replace the record for `progress.key()`
    async fn save(&self, progress: &LoanProgress) -> ZeroResult<()>;

    async fn load(&self, deposit_address: &str) -> ZeroResult<Option<LoanProgress>>;

    /// Records not yet repaid or defaulted
    async fn unfinished(&self) -> ZeroResult<Vec<LoanProgress>>;

    /// Every record, most recently updated first
    async fn list(&self, limit: usize) -> ZeroResult<Vec<LoanProgress>>;

    async fn stats(&self) -> ZeroResult<ParcelStats>;

    async fn health_check(&self) -> ZeroResult<()>;
}

/// Parcel counts per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParcelStats {
    pub parceled: u64,
    pub deposited: u64,
    pub attestation_pending: u64,
    pub attested: u64,
    pub borrowed: u64,
    pub repaid: u64,
    pub defaulted: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl ParcelStats {
    pub(crate) fn count(&mut self, state: LoanState) {
        match state {
            LoanState::Created | LoanState::Parceled => self.parceled += 1,
            LoanState::Deposited => self.deposited += 1,
            LoanState::AttestationPending => self.attestation_pending += 1,
            LoanState::Attested => self.attested += 1,
            LoanState::Borrowed => self.borrowed += 1,
            LoanState::Repaid => self.repaid += 1,
            LoanState::Defaulted => self.defaulted += 1,
        }
    }

    /// Counts labelled with their state name
    pub fn by_state(&self) -> [(&'static str, u64); 7] {
        [
            (LoanState::Parceled.as_str(), self.parceled),
            (LoanState::Deposited.as_str(), self.deposited),
            (LoanState::AttestationPending.as_str(), self.attestation_pending),
            (LoanState::Attested.as_str(), self.attested),
            (LoanState::Borrowed.as_str(), self.borrowed),
            (LoanState::Repaid.as_str(), self.repaid),
            (LoanState::Defaulted.as_str(), self.defaulted),
        ]
    }

    pub fn total(&self) -> u64 {
        self.parceled
            + self.deposited
            + self.attestation_pending
            + self.attested
            + self.borrowed
            + self.repaid
            + self.defaulted
    }
}
