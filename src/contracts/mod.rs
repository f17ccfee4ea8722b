//! On-chain settlement system bindings

pub mod record;
pub mod shifter_pool;

pub use record::{ProxyRecord, TriggerParcel};
pub use shifter_pool::{BorrowProxyMade, SettlementContract, ShifterPool, TransferEvent, TxOverrides};
