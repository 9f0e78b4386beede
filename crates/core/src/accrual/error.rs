use super::ledger::{DepositId, LedgerError, TransitionViolation};

pub type AccrualResult<T> = Result<T, AccrualError>;

/// Errors surfaced by the accrual engine.
///
/// Rate-feed failures never appear here: the rate oracle absorbs them and
/// falls back to the configured default rate.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AccrualError {
    /// Rejected before any computation (negative or malformed amounts,
    /// out-of-range basis points, unknown tokens).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("deposit {0} not found")]
    NotFound(DepositId),
    /// The caller is not the deposit's owner.
    #[error("deposit {0} does not belong to the caller")]
    Unauthorized(DepositId),
    #[error("deposit {0} has already been withdrawn")]
    AlreadyWithdrawn(DepositId),
    /// A recompute lost against a newer write or a withdrawal.
    #[error("stale recompute for deposit {0}")]
    StaleRecompute(DepositId),
    #[error("invalid state transition for deposit {id}: {violation}")]
    InvalidStateTransition {
        id: DepositId,
        violation: TransitionViolation,
    },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("yield computation overflowed")]
    Overflow,
    #[error("an accrual sweep is already running")]
    SweepInProgress,
    /// Withdrawal kept losing its compare-and-swap to concurrent writers.
    #[error("deposit {0} is being updated concurrently, try again")]
    Contended(DepositId),
}

impl From<LedgerError> for AccrualError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::NotFound(id) => AccrualError::NotFound(id),
            LedgerError::VersionConflict { id, .. } => AccrualError::StaleRecompute(id),
            LedgerError::InvalidStateTransition { id, violation } => {
                AccrualError::InvalidStateTransition { id, violation }
            }
            LedgerError::Persistence(reason) => AccrualError::Persistence(reason),
        }
    }
}

pub(crate) fn invalid_input<S: AsRef<str>>(s: S) -> AccrualError {
    AccrualError::InvalidInput(s.as_ref().to_string())
}
