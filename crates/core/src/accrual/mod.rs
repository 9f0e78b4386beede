//! Yield accrual engine.
//!
//! ```plain
//!   RateOracle ──(rate pinned on deposit)──► AccrualService ◄── AccrualScheduler
//!                                                │                 (hourly sweep)
//!                                                ▼
//!                                   calculator  +  LedgerStore
//! ```
//!
//! - [`calculator`]: pure yield and fee arithmetic.
//! - [`ledger`]: the deposit record, its transition rules and the in-memory store.
//! - [`rates`]: rate feed with timeout and fallback.
//! - [`service`]: deposit, withdraw, status and per-owner summaries.
//! - [`scheduler`]: the periodic recompute sweep.

pub mod calculator;
pub mod error;
pub mod ledger;
pub mod rates;
#[cfg(feature = "redb")]
pub mod redb_store;
pub mod scheduler;
pub mod service;

pub use calculator::{Amount, BasisPoints, FeeRate, FeeSplit};
pub use error::{AccrualError, AccrualResult};
pub use ledger::{Deposit, DepositId, InMemoryLedger, LedgerError, LedgerStore};
pub use rates::{RateOracle, RateOrigin, RateQuote, RateSource};
#[cfg(feature = "redb")]
pub use redb_store::RedbLedger;
pub use scheduler::{AccrualScheduler, SchedulerHandle, SweepReport};
pub use service::{AccrualService, DepositReceipt, DepositStatus, UserSummary, WithdrawalReceipt};
