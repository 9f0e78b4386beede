//! ToteFlow yield accrual service.
//!
//! Marketplace sale proceeds are deposited into a yield venue; this crate keeps
//! the ledger of those deposits, accrues time-proportional yield on an hourly
//! sweep and splits the yield between the seller and the platform on withdrawal.

pub mod accrual;
pub mod api;
pub mod config;
pub mod util;
