//! Main keeper loop: one task per parcel plus a periodic default sweep

use crate::config::KeeperConfig;
use crate::contracts::TxOverrides;
use crate::error::{ZeroError, ZeroResult};
use crate::lifecycle::{LoanProgress, LoanState, RetryPolicy, Zero};
use crate::request::{DepositedParcel, LiquidityRequestParcel};
use crate::state::ParcelStore;

use dashmap::DashSet;
use ethers::types::U256;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liquidity keeper
pub struct KeeperEngine {
    /// Client context with the keeper's signer
    zero: Arc<Zero>,
    /// Parcel persistence
    store: Arc<dyn ParcelStore>,
    /// Configuration
    config: KeeperConfig,
    policy: RetryPolicy,
    bond: U256,
    /// Deposit addresses with a running task
    active: DashSet<String>,
    shutdown: CancellationToken,
}

impl KeeperEngine {
    pub fn new(zero: Arc<Zero>, store: Arc<dyn ParcelStore>, config: KeeperConfig) -> ZeroResult<Self> {
        let bond = U256::from_dec_str(&config.bond)
            .map_err(|e| ZeroError::Config(format!("keeper.bond {:?}: {}", config.bond, e)))?;

        let mut policy = RetryPolicy::new(Duration::from_millis(config.poll_interval_ms));
        if let Some(max) = config.max_poll_attempts {
            policy = policy.with_max_attempts(max);
        }
        let shutdown = zero.shutdown_token().child_token();

        Ok(Self {
            zero,
            store,
            config,
            policy,
            bond,
            active: DashSet::new(),
            shutdown,
        })
    }

    /// Main keeper loop
    pub async fn run(self: Arc<Self>) -> ZeroResult<()> {
        let mut requests = self.zero.listen_for_liquidity_requests();

        self.resume().await?;

        let mut sweep_interval = interval(Duration::from_secs(self.config.default_sweep_interval_secs));

        info!("Keeper {} started", self.config.instance_id);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                // Incoming liquidity requests
                parcel = requests.next_item() => match parcel {
                    Some(parcel) => {
                        if let Err(e) = self.accept(parcel).await {
                            error!("Error accepting parcel: {}", e);
                        }
                    }
                    None => break,
                },

                // Periodic default sweep
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep_defaults().await {
                        error!("Error sweeping expired loans: {}", e);
                    }
                }
            }
        }

        requests.unsubscribe().await;
        info!("Keeper {} stopped", self.config.instance_id);
        Ok(())
    }

    /// Restart tasks for every unfinished parcel in the store
    pub async fn resume(self: &Arc<Self>) -> ZeroResult<usize> {
        let unfinished = self.store.unfinished().await?;
        let count = unfinished.len();

        for progress in unfinished {
            if progress.state() == LoanState::Borrowed && progress.signature.is_some() {
                // Nothing left but the sweep
                continue;
            }
            self.spawn(progress);
        }

        if count > 0 {
            info!("Resumed {} unfinished parcels", count);
        }
        Ok(count)
    }

    /// Track a newly received parcel; repeats of a known parcel are ignored
    pub async fn accept(self: &Arc<Self>, parcel: LiquidityRequestParcel) -> ZeroResult<()> {
        let key = parcel.deposit_address().to_string();

        if self.active.contains(&key) || self.store.load(&key).await?.is_some() {
            debug!("Parcel {} already tracked", key);
            return Ok(());
        }

        info!(
            "New liquidity request from {:?} for {} of {:?}, deposit to {}",
            parcel.request.borrower, parcel.request.amount, parcel.request.token, key
        );

        let progress = LoanProgress::new(parcel);
        self.store.save(&progress).await?;
        self.spawn(progress);
        Ok(())
    }

    fn spawn(self: &Arc<Self>, progress: LoanProgress) {
        let key = progress.key().to_string();
        if !self.active.insert(key.clone()) {
            return;
        }
        crate::metrics::record_tracked("active", self.active.len());

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.drive(progress).await {
                Ok(state) => debug!("Parcel {} reached {}", key, state),
                Err(ZeroError::Cancelled { .. }) => debug!("Parcel {} paused for shutdown", key),
                Err(e) => warn!("Parcel {} stopped: {}", key, e),
            }
            engine.active.remove(&key);
            crate::metrics::record_tracked("active", engine.active.len());
        });
    }

    /// Advance one parcel as far as the keeper can take it
    ///
    /// Each step is skipped when its fact is already recorded, so a resumed parcel
    /// picks up where it left off.
    async fn drive(&self, mut progress: LoanProgress) -> ZeroResult<LoanState> {
        let started = Instant::now();
        let cancel = &self.shutdown;

        if progress.utxo.is_none() {
            let deposited = self
                .zero
                .wait_for_deposit(&progress.parcel, &self.policy, cancel)
                .await?;
            progress.record_deposit(deposited.utxo)?;
            self.store.save(&progress).await?;
            crate::metrics::record_deposit_confirmed();
        }

        let deposited = progress
            .deposited()
            .ok_or_else(|| ZeroError::Internal("deposit recorded without UTXO".into()))?;

        if progress.attestation_id.is_none() {
            let id = self.zero.submit_to_attestation_network(&deposited).await?;
            progress.record_submission(id)?;
            self.store.save(&progress).await?;
            crate::metrics::record_attestation_submitted();
        }

        let lend_early = self.config.lend_before_attestation && !progress.parcel.request.forbid_loan;
        if lend_early && progress.proxy_address.is_none() {
            self.borrow(&mut progress, &deposited, started).await?;
        }

        if progress.signature.is_none() {
            let signature = self
                .zero
                .wait_for_signature(&deposited, &self.policy, cancel)
                .await?;
            progress.record_signature(signature)?;
            self.store.save(&progress).await?;
        }

        if progress.proxy_address.is_none() {
            self.borrow(&mut progress, &deposited, started).await?;
        }

        Ok(progress.state())
    }

    async fn borrow(&self, progress: &mut LoanProgress, deposited: &DepositedParcel, started: Instant) -> ZeroResult<()> {
        let settlement = self.zero.settlement();
        let latest = settlement.latest_block().await?;
        crate::metrics::record_block_height(latest);
        let expiry = latest + self.config.loan_timeout_blocks;

        match self
            .zero
            .execute_borrow(deposited, self.bond, U256::from(expiry), &TxOverrides::default())
            .await
        {
            Ok(hash) => {
                info!("Borrow for {} executed in {:?}", progress.key(), hash);
                progress.record_borrow(progress.parcel.proxy_address(), expiry)?;
                crate::metrics::record_borrow_executed(started.elapsed().as_secs_f64());
            }
            Err(ZeroError::Rpc { code: 3, message }) => {
                // Reverted; the proxy may already exist from an earlier attempt or another keeper
                let existing = self.zero.find_borrow_proxy(&progress.parcel).await?;
                let Some(proxy) = existing else {
                    return Err(ZeroError::Rpc { code: 3, message });
                };
                warn!(
                    "Proxy {:?} for {} already exists, lent by {:?}",
                    proxy.address(),
                    progress.key(),
                    proxy.record().keeper
                );
                progress.record_borrow(proxy.address(), proxy.expiry_block())?;
            }
            Err(e) => return Err(e),
        }

        self.store.save(progress).await
    }

    /// Default every expired loan that no task is still working on
    pub async fn sweep_defaults(&self) -> ZeroResult<usize> {
        let block = self.zero.settlement().latest_block().await?;
        crate::metrics::record_block_height(block);
        let mut defaulted = 0;

        for mut progress in self.store.unfinished().await? {
            if !progress.is_defaultable(block) || self.active.contains(progress.key()) {
                continue;
            }

            let Some(proxy) = self.zero.find_borrow_proxy(&progress.parcel).await? else {
                warn!("No borrow proxy found on chain for {}", progress.key());
                continue;
            };

            match proxy.default_loan(&TxOverrides::default()).await {
                Ok(_) => {
                    progress.record_defaulted()?;
                    self.store.save(&progress).await?;
                    defaulted += 1;
                }
                Err(ZeroError::DefaultRejected { reason, .. }) => match proxy.is_repaid().await {
                    Ok(true) => {
                        info!("Default of {} rejected, loan was repaid", progress.key());
                        if progress.record_repaid().is_ok() {
                            self.store.save(&progress).await?;
                        }
                    }
                    Ok(false) => warn!("Default of {} rejected ({}), retrying next sweep", progress.key(), reason),
                    Err(e) => warn!("Cannot check repayment of {}: {}", progress.key(), e),
                },
                Err(e) => warn!("Failed to default {}: {}", progress.key(), e),
            }
        }

        if defaulted > 0 {
            info!("Defaulted {} expired loans at block {}", defaulted, block);
        }

        for (state, count) in self.store.stats().await?.by_state() {
            crate::metrics::record_tracked(state, count as usize);
        }
        Ok(defaulted)
    }

    /// Parcels with a running task
    pub fn tracked(&self) -> usize {
        self.active.len()
    }

    pub fn store(&self) -> &Arc<dyn ParcelStore> {
        &self.store
    }

    /// Stop the keeper and every wait it started
    pub fn stop(&self) {
        self.shutdown.cancel();
        info!("Keeper shutdown initiated");
    }
}
