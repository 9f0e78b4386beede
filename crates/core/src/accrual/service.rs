//! Deposit, withdrawal and read operations over the ledger.
//!
//! The annual rate is pinned when a deposit is opened: the rate oracle is asked
//! once, in [`AccrualService::deposit`], and every later recomputation uses the
//! stored `annual_rate`. Yield is always recomputed from the deposit's start
//! time, so sweeps, withdrawals and status reads agree on the same value for the
//! same instant.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::calculator::{Amount, FeeRate, BPS_DENOMINATOR};
use super::error::{invalid_input, AccrualError, AccrualResult};
use super::ledger::{Deposit, DepositId, LedgerError, LedgerStore, NewDeposit, TransitionViolation};
use super::rates::{RateOracle, RateQuote};
use crate::config::TokenConfig;
use crate::util::time_source::TimeSource;

/// Attempts a withdrawal makes before giving up on a hot record.
const MAX_WITHDRAW_ATTEMPTS: usize = 3;

// =============================================================================
// Results
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DepositReceipt {
    pub deposit: Deposit,
    pub rate: RateQuote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WithdrawalReceipt {
    pub id: DepositId,
    pub owner: String,
    pub token: String,
    pub principal: Amount,
    /// Gross yield frozen at withdrawal.
    pub yield_earned: Amount,
    pub platform_fee: Amount,
    pub payee_yield: Amount,
    /// `principal + payee_yield`.
    pub total_amount: Amount,
    pub withdrawn_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DepositStatus {
    pub deposit: Deposit,
    /// What a recompute at the time of the read would persist. Equals the stored
    /// yield once withdrawn.
    pub accrued_now: Amount,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub token: String,
    pub total_deposited: Amount,
    /// Gross yield of withdrawn deposits.
    pub realized_yield: Amount,
    /// Live yield of active deposits.
    pub pending_yield: Amount,
    /// `(realized + pending) / total_deposited`, floored.
    pub roi_bps: u128,
    pub deposit_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub owner: String,
    /// One entry per token the owner has deposited, sorted by symbol.
    pub tokens: Vec<TokenSummary>,
    pub active_deposits: Vec<DepositStatus>,
}

/// Result of recomputing one ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    /// A higher yield was persisted.
    Updated { accumulated_yield: Amount },
    /// The stored yield is already current.
    Unchanged,
    /// The entry was withdrawn or rewritten since it was read; nothing was written.
    Stale,
}

// =============================================================================
// AccrualService
// =============================================================================

pub struct AccrualService {
    store: Arc<dyn LedgerStore>,
    rates: Arc<RateOracle>,
    clock: Arc<dyn TimeSource>,
    fee: FeeRate,
    tokens: HashMap<String, TokenConfig>,
}

impl AccrualService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        rates: Arc<RateOracle>,
        clock: Arc<dyn TimeSource>,
        fee: FeeRate,
        tokens: Vec<TokenConfig>,
    ) -> Self {
        Self {
            store,
            rates,
            clock,
            fee,
            tokens: tokens
                .into_iter()
                .map(|t| (t.symbol.clone(), t))
                .collect(),
        }
    }

    pub fn fee_rate(&self) -> FeeRate {
        self.fee
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn token(&self, symbol: &str) -> AccrualResult<&TokenConfig> {
        self.tokens
            .get(symbol)
            .ok_or_else(|| invalid_input(format!("unknown token {symbol:?}")))
    }

    /// Opens a deposit of `principal` base units, pinning the best current rate
    /// and the venue quoting it. A fallback rate keeps the token's configured
    /// strategy label.
    pub async fn deposit(
        &self,
        owner: &str,
        token: &str,
        principal: Amount,
    ) -> AccrualResult<DepositReceipt> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(invalid_input("owner address is empty"));
        }
        if principal == 0 {
            return Err(invalid_input("deposit amount must be positive"));
        }
        let default_strategy = &self.token(token)?.strategy;

        let quote = self.rates.current_rate(token).await;
        let strategy = quote
            .venue
            .clone()
            .unwrap_or_else(|| default_strategy.clone());
        let deposit = self.store.create(NewDeposit {
            owner: owner.to_string(),
            token: token.to_string(),
            principal,
            strategy,
            annual_rate: quote.rate,
            start_time: self.clock.now(),
        })?;

        tracing::info!(
            deposit_id = %deposit.id,
            owner = %deposit.owner,
            token = %deposit.token,
            principal = %deposit.principal,
            strategy = %deposit.strategy,
            rate_bps = quote.rate.get(),
            origin = ?quote.origin,
            "Accrual: deposit opened"
        );
        Ok(DepositReceipt {
            deposit,
            rate: quote,
        })
    }

    /// Freezes the deposit's yield on behalf of `owner` and reports the payout.
    ///
    /// Retries when a concurrent recompute bumps the version between read and
    /// write. A caller other than the owner gets [`AccrualError::Unauthorized`];
    /// a second withdrawal fails with [`AccrualError::AlreadyWithdrawn`]. Neither
    /// changes anything.
    pub async fn withdraw(&self, id: DepositId, owner: &str) -> AccrualResult<WithdrawalReceipt> {
        let owner = owner.trim();
        for attempt in 1..=MAX_WITHDRAW_ATTEMPTS {
            let current = self
                .store
                .find_by_id(&id)?
                .ok_or(AccrualError::NotFound(id))?;
            if current.owner != owner {
                tracing::warn!(deposit_id = %id, caller = owner, "Accrual: withdrawal by non-owner rejected");
                return Err(AccrualError::Unauthorized(id));
            }
            if current.withdrawn {
                return Err(AccrualError::AlreadyWithdrawn(id));
            }

            let now = self.clock.now();
            let accrued = current.accrued_at(now)?.max(current.accumulated_yield);

            match self.store.update(&current.finalized(accrued, now)) {
                Ok(stored) => return self.receipt(stored, now),
                Err(LedgerError::VersionConflict { .. }) => {
                    tracing::debug!(deposit_id = %id, attempt, "Accrual: withdrawal lost a race, retrying");
                }
                Err(LedgerError::InvalidStateTransition {
                    violation: TransitionViolation::Terminal,
                    ..
                }) => return Err(AccrualError::AlreadyWithdrawn(id)),
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(deposit_id = %id, attempts = MAX_WITHDRAW_ATTEMPTS, "Accrual: withdrawal contended");
        Err(AccrualError::Contended(id))
    }

    fn receipt(&self, stored: Deposit, at: DateTime<Utc>) -> AccrualResult<WithdrawalReceipt> {
        let split = self.fee.split(stored.accumulated_yield);
        let total_amount = stored
            .principal
            .checked_add(split.payee_amount)
            .ok_or(AccrualError::Overflow)?;

        tracing::info!(
            deposit_id = %stored.id,
            owner = %stored.owner,
            principal = %stored.principal,
            yield_earned = %stored.accumulated_yield,
            platform_fee = %split.platform_fee,
            "Accrual: deposit withdrawn"
        );
        Ok(WithdrawalReceipt {
            id: stored.id,
            owner: stored.owner,
            token: stored.token,
            principal: stored.principal,
            yield_earned: stored.accumulated_yield,
            platform_fee: split.platform_fee,
            payee_yield: split.payee_amount,
            total_amount,
            withdrawn_at: at,
        })
    }

    pub fn status(&self, id: DepositId) -> AccrualResult<DepositStatus> {
        let deposit = self
            .store
            .find_by_id(&id)?
            .ok_or(AccrualError::NotFound(id))?;
        self.live_status(deposit, self.clock.now())
    }

    fn live_status(&self, deposit: Deposit, now: DateTime<Utc>) -> AccrualResult<DepositStatus> {
        let accrued_now = if deposit.withdrawn {
            deposit.accumulated_yield
        } else {
            deposit.accrued_at(now)?.max(deposit.accumulated_yield)
        };
        Ok(DepositStatus {
            deposit,
            accrued_now,
        })
    }

    /// Per-token totals and the active deposits of `owner`.
    pub fn summary(&self, owner: &str) -> AccrualResult<UserSummary> {
        let now = self.clock.now();
        let mut per_token: HashMap<String, TokenSummary> = HashMap::new();
        let mut active_deposits = Vec::new();

        for deposit in self.store.find_by_owner(owner.trim())? {
            let status = self.live_status(deposit, now)?;
            let entry = per_token
                .entry(status.deposit.token.clone())
                .or_insert_with(|| TokenSummary {
                    token: status.deposit.token.clone(),
                    ..Default::default()
                });

            entry.deposit_count += 1;
            entry.total_deposited = checked_sum(entry.total_deposited, status.deposit.principal)?;
            if status.deposit.withdrawn {
                entry.realized_yield = checked_sum(entry.realized_yield, status.accrued_now)?;
            } else {
                entry.pending_yield = checked_sum(entry.pending_yield, status.accrued_now)?;
                active_deposits.push(status);
            }
        }

        let mut tokens: Vec<TokenSummary> = per_token.into_values().collect();
        for t in &mut tokens {
            let earned = checked_sum(t.realized_yield, t.pending_yield)?;
            t.roi_bps = match t.total_deposited {
                0 => 0,
                total => {
                    earned
                        .checked_mul(u128::from(BPS_DENOMINATOR))
                        .ok_or(AccrualError::Overflow)?
                        / total
                }
            };
        }
        tokens.sort_by(|a, b| a.token.cmp(&b.token));

        Ok(UserSummary {
            owner: owner.trim().to_string(),
            tokens,
            active_deposits,
        })
    }

    /// All deposits still accruing, oldest first.
    pub fn active_deposits(&self) -> AccrualResult<Vec<Deposit>> {
        Ok(self.store.find_active()?)
    }

    /// Recomputes `deposit` (as read by the caller) at `now` and persists the
    /// result if it increased.
    ///
    /// A lost compare-and-swap or an entry withdrawn in the meantime is reported
    /// as [`EntryOutcome::Stale`], never as an error.
    pub fn recompute(&self, deposit: &Deposit, now: DateTime<Utc>) -> AccrualResult<EntryOutcome> {
        if deposit.withdrawn {
            return Ok(EntryOutcome::Stale);
        }
        let accrued = deposit.accrued_at(now)?;
        if accrued <= deposit.accumulated_yield {
            return Ok(EntryOutcome::Unchanged);
        }

        match self.store.update(&deposit.with_accrued(accrued)) {
            Ok(stored) => Ok(EntryOutcome::Updated {
                accumulated_yield: stored.accumulated_yield,
            }),
            Err(LedgerError::VersionConflict { .. })
            | Err(LedgerError::InvalidStateTransition {
                violation: TransitionViolation::Terminal,
                ..
            }) => Ok(EntryOutcome::Stale),
            Err(e) => Err(e.into()),
        }
    }
}

fn checked_sum(a: Amount, b: Amount) -> AccrualResult<Amount> {
    a.checked_add(b).ok_or(AccrualError::Overflow)
}
