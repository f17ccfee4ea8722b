//! Process-local parcel store

use super::{ParcelStats, ParcelStore};
use crate::error::ZeroResult;
use crate::lifecycle::LoanProgress;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Parcel store that forgets everything on exit
#[derive(Default)]
pub struct MemoryParcelStore {
    parcels: DashMap<String, (LoanProgress, DateTime<Utc>)>,
}

impl MemoryParcelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }
}

#[async_trait]
impl ParcelStore for MemoryParcelStore {
    async fn save(&self, progress: &LoanProgress) -> ZeroResult<()> {
        self.parcels
            .insert(progress.key().to_string(), (progress.clone(), Utc::now()));
        Ok(())
    }

    async fn load(&self, deposit_address: &str) -> ZeroResult<Option<LoanProgress>> {
        Ok(self.parcels.get(deposit_address).map(|entry| entry.0.clone()))
    }

    async fn unfinished(&self) -> ZeroResult<Vec<LoanProgress>> {
        Ok(self
            .parcels
            .iter()
            .filter(|entry| !entry.0.state().is_terminal())
            .map(|entry| entry.0.clone())
            .collect())
    }

    async fn list(&self, limit: usize) -> ZeroResult<Vec<LoanProgress>> {
        let mut all: Vec<(LoanProgress, DateTime<Utc>)> =
            self.parcels.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(all.into_iter().take(limit).map(|(progress, _)| progress).collect())
    }

    async fn stats(&self) -> ZeroResult<ParcelStats> {
        let mut stats = ParcelStats::default();
        for entry in self.parcels.iter() {
            stats.count(entry.0.state());
            stats.last_update = stats.last_update.max(Some(entry.1));
        }
        Ok(stats)
    }

    async fn health_check(&self) -> ZeroResult<()> {
        Ok(())
    }
}
