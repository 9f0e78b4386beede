//! Accrual ledger: one record per deposited sale-proceeds amount.
//!
//! ```plain
//!   create ──► Active ──(recompute: accumulated_yield ↑)──► Active
//!                │
//!                └──(withdraw: freeze accumulated_yield)──► Withdrawn (terminal)
//! ```
//!
//! Records are never deleted. Every accepted write bumps `version`; a writer must
//! present the version it read (compare-and-swap), so a recompute racing a
//! withdrawal loses instead of overwriting the frozen yield.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::calculator::{compute_yield, elapsed_seconds, Amount, BasisPoints};
use super::error::{invalid_input, AccrualError, AccrualResult};

// =============================================================================
// Entity
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepositId(Ulid);

impl DepositId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DepositId {
    type Err = AccrualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim())
            .map(Self)
            .map_err(|e| invalid_input(format!("malformed deposit id {s:?}: {e}")))
    }
}

/// Input for [`LedgerStore::create`].
#[derive(Clone, Debug)]
pub struct NewDeposit {
    pub owner: String,
    pub token: String,
    pub principal: Amount,
    pub strategy: String,
    pub annual_rate: BasisPoints,
    pub start_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    /// Wallet address of the seller whose proceeds were deposited.
    pub owner: String,
    pub token: String,
    pub principal: Amount,
    /// Venue currently holding the principal. Informational only.
    pub strategy: String,
    /// Annual rate pinned when the deposit was opened.
    pub annual_rate: BasisPoints,
    pub start_time: DateTime<Utc>,
    pub accumulated_yield: Amount,
    pub withdrawn: bool,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Deposit {
    pub(crate) fn open(id: DepositId, new: NewDeposit) -> Self {
        Self {
            id,
            owner: new.owner,
            token: new.token,
            principal: new.principal,
            strategy: new.strategy,
            annual_rate: new.annual_rate,
            start_time: new.start_time,
            accumulated_yield: 0,
            withdrawn: false,
            withdrawn_at: None,
            created_at: new.start_time,
            version: 0,
        }
    }

    /// Yield accrued from `start_time` up to `now`.
    ///
    /// Always derived from the start of the window, never from the previously
    /// stored `accumulated_yield`, so repeated recomputation cannot drift.
    pub fn accrued_at(&self, now: DateTime<Utc>) -> AccrualResult<Amount> {
        compute_yield(
            self.principal,
            self.annual_rate,
            elapsed_seconds(self.start_time, now),
        )
    }

    /// Copy carrying a recomputed yield, to be written back with [`LedgerStore::update`].
    pub fn with_accrued(&self, accumulated_yield: Amount) -> Self {
        Self {
            accumulated_yield,
            ..self.clone()
        }
    }

    /// Copy in the terminal withdrawn state.
    pub fn finalized(&self, accumulated_yield: Amount, at: DateTime<Utc>) -> Self {
        Self {
            accumulated_yield,
            withdrawn: true,
            withdrawn_at: Some(at),
            ..self.clone()
        }
    }
}

// =============================================================================
// Errors and transition rules
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionViolation {
    /// The stored record is already withdrawn.
    Terminal,
    /// A field fixed at creation was changed.
    ImmutableField(&'static str),
    /// `accumulated_yield` would go down.
    YieldDecreased,
    /// `withdrawn` was cleared or `withdrawn_at` set without withdrawing.
    InconsistentWithdrawal,
}

impl fmt::Display for TransitionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionViolation::Terminal => write!(f, "entry is withdrawn and immutable"),
            TransitionViolation::ImmutableField(field) => write!(f, "field `{field}` is immutable"),
            TransitionViolation::YieldDecreased => write!(f, "accumulated yield cannot decrease"),
            TransitionViolation::InconsistentWithdrawal => {
                write!(f, "withdrawal fields are inconsistent")
            }
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("deposit {0} not found")]
    NotFound(DepositId),
    #[error("version conflict on deposit {id}: writer read {expected}, store has {found}")]
    VersionConflict {
        id: DepositId,
        expected: u64,
        found: u64,
    },
    #[error("invalid state transition for deposit {id}: {violation}")]
    InvalidStateTransition {
        id: DepositId,
        violation: TransitionViolation,
    },
    #[error("ledger storage failure: {0}")]
    Persistence(String),
}

/// Checks that `next` is an allowed successor of the stored `current` record.
///
/// Shared by every store so the rules cannot diverge between backends.
pub fn validate_transition(current: &Deposit, next: &Deposit) -> Result<(), LedgerError> {
    let reject = |violation| LedgerError::InvalidStateTransition {
        id: current.id,
        violation,
    };

    if current.withdrawn {
        return Err(reject(TransitionViolation::Terminal));
    }
    if next.version != current.version {
        return Err(LedgerError::VersionConflict {
            id: current.id,
            expected: next.version,
            found: current.version,
        });
    }

    let immutable = [
        ("principal", current.principal == next.principal),
        ("start_time", current.start_time == next.start_time),
        ("annual_rate", current.annual_rate == next.annual_rate),
        ("owner", current.owner == next.owner),
        ("token", current.token == next.token),
        ("strategy", current.strategy == next.strategy),
        ("created_at", current.created_at == next.created_at),
    ];
    if let Some(&(field, _)) = immutable.iter().find(|(_, unchanged)| !*unchanged) {
        return Err(reject(TransitionViolation::ImmutableField(field)));
    }

    if next.accumulated_yield < current.accumulated_yield {
        return Err(reject(TransitionViolation::YieldDecreased));
    }
    if next.withdrawn != next.withdrawn_at.is_some() {
        return Err(reject(TransitionViolation::InconsistentWithdrawal));
    }

    Ok(())
}

// =============================================================================
// Trait: LedgerStore
// =============================================================================

/// Persistence for ledger entries.
///
/// Implementations must apply [`validate_transition`] and the version bump
/// atomically with the write.
pub trait LedgerStore: Send + Sync + 'static {
    fn create(&self, deposit: NewDeposit) -> Result<Deposit, LedgerError>;

    fn find_by_id(&self, id: &DepositId) -> Result<Option<Deposit>, LedgerError>;

    /// All entries with `withdrawn == false`, oldest first.
    fn find_active(&self) -> Result<Vec<Deposit>, LedgerError>;

    /// All entries belonging to `owner`, oldest first.
    fn find_by_owner(&self, owner: &str) -> Result<Vec<Deposit>, LedgerError>;

    /// Replaces the stored entry with `next` if `next.version` matches the stored
    /// version. Returns the stored record with its new version.
    fn update(&self, next: &Deposit) -> Result<Deposit, LedgerError>;
}

// =============================================================================
// InMemoryLedger
// =============================================================================

/// Process-local store, used when no database path is configured and in tests.
#[derive(Default)]
pub struct InMemoryLedger {
    deposits: DashMap<DepositId, Deposit>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted(&self, filter: impl Fn(&Deposit) -> bool) -> Vec<Deposit> {
        let mut out: Vec<Deposit> = self
            .deposits
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        // ULIDs sort by creation time.
        out.sort_by_key(|d| d.id);
        out
    }
}

impl LedgerStore for InMemoryLedger {
    fn create(&self, deposit: NewDeposit) -> Result<Deposit, LedgerError> {
        let record = Deposit::open(DepositId::generate(), deposit);
        self.deposits.insert(record.id, record.clone());
        Ok(record)
    }

    fn find_by_id(&self, id: &DepositId) -> Result<Option<Deposit>, LedgerError> {
        Ok(self.deposits.get(id).map(|entry| entry.value().clone()))
    }

    fn find_active(&self) -> Result<Vec<Deposit>, LedgerError> {
        Ok(self.collect_sorted(|d| !d.withdrawn))
    }

    fn find_by_owner(&self, owner: &str) -> Result<Vec<Deposit>, LedgerError> {
        Ok(self.collect_sorted(|d| d.owner == owner))
    }

    fn update(&self, next: &Deposit) -> Result<Deposit, LedgerError> {
        // The shard write lock is held until `entry` drops, making check-and-set atomic.
        let mut entry = self
            .deposits
            .get_mut(&next.id)
            .ok_or(LedgerError::NotFound(next.id))?;
        validate_transition(entry.value(), next)?;

        let mut stored = next.clone();
        stored.version = entry.version + 1;
        *entry = stored.clone();
        Ok(stored)
    }
}
