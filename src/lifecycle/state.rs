//! Persisted progress of one parcel through the loan lifecycle
//!
//! Progress is recorded as facts (deposit seen, request submitted, signature
//! received, proxy created, outcome). The lifecycle state is derived from those
//! facts, so resuming from a stored record never depends on an in-memory flag.

use crate::error::{ZeroError, ZeroResult};
use crate::request::{DepositedParcel, LiquidityRequestParcel, Utxo};

use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a parcel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanState {
    Created,
    Parceled,
    Deposited,
    AttestationPending,
    Attested,
    Borrowed,
    Repaid,
    Defaulted,
}

impl LoanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoanState::Repaid | LoanState::Defaulted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoanState::Created => "created",
            LoanState::Parceled => "parceled",
            LoanState::Deposited => "deposited",
            LoanState::AttestationPending => "attestation_pending",
            LoanState::Attested => "attested",
            LoanState::Borrowed => "borrowed",
            LoanState::Repaid => "repaid",
            LoanState::Defaulted => "defaulted",
        }
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a borrowed loan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanOutcome {
    Repaid,
    Defaulted,
}

/// Everything known about one parcel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanProgress {
    pub parcel: LiquidityRequestParcel,
    pub utxo: Option<Utxo>,
    pub attestation_id: Option<String>,
    pub signature: Option<Bytes>,
    pub proxy_address: Option<Address>,
    /// Block after which the loan may be defaulted
    pub timeout_expiry: Option<u64>,
    pub outcome: Option<LoanOutcome>,
}

impl LoanProgress {
    pub fn new(parcel: LiquidityRequestParcel) -> Self {
        Self {
            parcel,
            utxo: None,
            attestation_id: None,
            signature: None,
            proxy_address: None,
            timeout_expiry: None,
            outcome: None,
        }
    }

    /// Parcels are keyed by their deposit address
    pub fn key(&self) -> &str {
        self.parcel.deposit_address()
    }

    pub fn state(&self) -> LoanState {
        match self.outcome {
            Some(LoanOutcome::Repaid) => return LoanState::Repaid,
            Some(LoanOutcome::Defaulted) => return LoanState::Defaulted,
            None => {}
        }

        if self.proxy_address.is_some() {
            LoanState::Borrowed
        } else if self.signature.is_some() {
            LoanState::Attested
        } else if self.attestation_id.is_some() {
            LoanState::AttestationPending
        } else if self.utxo.is_some() {
            LoanState::Deposited
        } else if self.parcel.signature().is_some() {
            LoanState::Parceled
        } else {
            LoanState::Created
        }
    }

    pub fn deposited(&self) -> Option<DepositedParcel> {
        self.utxo.map(|utxo| DepositedParcel {
            parcel: self.parcel.clone(),
            utxo,
        })
    }

    fn guard_open(&self, to: LoanState) -> ZeroResult<()> {
        let from = self.state();
        if from.is_terminal() {
            return Err(ZeroError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    pub fn record_deposit(&mut self, utxo: Utxo) -> ZeroResult<()> {
        self.guard_open(LoanState::Deposited)?;
        self.utxo = Some(utxo);
        Ok(())
    }

    pub fn record_submission(&mut self, attestation_id: String) -> ZeroResult<()> {
        self.guard_open(LoanState::AttestationPending)?;
        if self.utxo.is_none() {
            return Err(ZeroError::InvalidStateTransition {
                from: self.state().to_string(),
                to: LoanState::AttestationPending.to_string(),
            });
        }
        self.attestation_id = Some(attestation_id);
        Ok(())
    }

    pub fn record_signature(&mut self, signature: Bytes) -> ZeroResult<()> {
        self.guard_open(LoanState::Attested)?;
        self.signature = Some(signature);
        Ok(())
    }

    pub fn record_borrow(&mut self, proxy: Address, timeout_expiry: u64) -> ZeroResult<()> {
        self.guard_open(LoanState::Borrowed)?;
        if self.utxo.is_none() {
            return Err(ZeroError::InvalidStateTransition {
                from: self.state().to_string(),
                to: LoanState::Borrowed.to_string(),
            });
        }
        self.proxy_address = Some(proxy);
        self.timeout_expiry = Some(timeout_expiry);
        Ok(())
    }

    pub fn record_repaid(&mut self) -> ZeroResult<()> {
        self.guard_open(LoanState::Repaid)?;
        if self.proxy_address.is_none() || self.signature.is_none() {
            return Err(ZeroError::InvalidStateTransition {
                from: self.state().to_string(),
                to: LoanState::Repaid.to_string(),
            });
        }
        self.outcome = Some(LoanOutcome::Repaid);
        Ok(())
    }

    pub fn record_defaulted(&mut self) -> ZeroResult<()> {
        self.guard_open(LoanState::Defaulted)?;
        if self.proxy_address.is_none() {
            return Err(ZeroError::InvalidStateTransition {
                from: self.state().to_string(),
                to: LoanState::Defaulted.to_string(),
            });
        }
        self.outcome = Some(LoanOutcome::Defaulted);
        Ok(())
    }

    /// Borrowed, unsettled, and past its expiry at `block`
    pub fn is_defaultable(&self, block: u64) -> bool {
        self.state() == LoanState::Borrowed && self.timeout_expiry.is_some_and(|expiry| block > expiry)
    }
}
