//! The module contains the errors the engine can throw.
//!
//! Ledger-layer errors ([`Validation`], [`InsufficientBalance`]) are terminal
//! for the calling request. [`ExternalSyncFailure`] is only surfaced where the
//! caller asked for the remote operation directly; grants that mirror to the
//! loyalty service never fail because of it.
//!
//!  [`Validation`]: EngineError::Validation
//!  [`InsufficientBalance`]: EngineError::InsufficientBalance
//!  [`ExternalSyncFailure`]: EngineError::ExternalSyncFailure
use sea_orm::DbErr;
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error("External sync failed: {0}")]
    ExternalSyncFailure(String),
    #[error("Conflicting identity: {0}")]
    ConflictingIdentity(String),
    #[error("Merge already processed: {0}")]
    MergeAlreadyProcessed(String),
    #[error("Balance temporarily unavailable: {0}")]
    BalanceUnavailable(String),
    #[error("Restoration unavailable: {0}")]
    RestorationUnavailable(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Validation(a), Self::Validation(b)) => a == b,
            (Self::InsufficientBalance(a), Self::InsufficientBalance(b)) => a == b,
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::ExternalSyncFailure(a), Self::ExternalSyncFailure(b)) => a == b,
            (Self::ConflictingIdentity(a), Self::ConflictingIdentity(b)) => a == b,
            (Self::MergeAlreadyProcessed(a), Self::MergeAlreadyProcessed(b)) => a == b,
            (Self::BalanceUnavailable(a), Self::BalanceUnavailable(b)) => a == b,
            (Self::RestorationUnavailable(a), Self::RestorationUnavailable(b)) => a == b,
            (Self::InvalidCursor(a), Self::InvalidCursor(b)) => a == b,
            (Self::InvalidId(a), Self::InvalidId(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
