//! Typed error kinds surfaced at public operation boundaries.
//!
//! Internal glue keeps using `anyhow::Result`; anything callers branch on
//! (intake rejections, transition refusals, ledger retry classification)
//! comes through here.

use thiserror::Error;

use crate::models::RaceStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A wager (or reservation) with this transaction signature already exists.
    #[error("duplicate signature: {0}")]
    DuplicateSignature(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: RaceStatus, to: RaceStatus },

    /// The global single-active invariant (or the phase guard) refused a LOCK.
    #[error("lock blocked: {0}")]
    LockBlocked(String),

    #[error("race not found: {0}")]
    RaceNotFound(String),

    #[error("blocked by maintenance: {0}")]
    MaintenanceBlocked(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Retryable ledger failure (blockhash expiry, rate limit, network).
    #[error("ledger transient: {0}")]
    LedgerTransient(String),

    #[error("ledger fatal: {0}")]
    LedgerFatal(String),

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether a bounded retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::LedgerTransient(_))
    }

    pub fn store<E: std::fmt::Display>(e: E) -> Self {
        EngineError::Store(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
