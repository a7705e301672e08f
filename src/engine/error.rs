//! Error types for money movement.

use thiserror::Error;
use tracing::error;

use crate::Amount;
use crate::model::{AccountId, TransactionKind, TransactionStatus, TxId};
use crate::store::StoreError;

/// Top-level error returned by [`TransferEngine`](super::TransferEngine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("concurrent update conflict, retries exhausted")]
    Conflict,

    #[error("system error: {0}")]
    System(String),
}

/// Bad input from the caller. Shown inline, never logged as an incident.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("amount must be positive, got {0}")]
    AmountNotPositive(Amount),

    #[error("{kind} amount {amount} is outside {min}..={max}")]
    AmountOutOfRange {
        kind: TransactionKind,
        amount: Amount,
        min: Amount,
        max: Amount,
    },

    #[error("a destination account number is required")]
    MissingDestination,

    #[error("destination account {0} is inactive")]
    DestinationInactive(String),

    #[error("cannot transfer to the source account")]
    SelfTransfer,

    #[error("transaction PIN is not set, set one before moving money")]
    PinNotSet,

    #[error("transaction PIN is required")]
    PinRequired,

    #[error("incorrect transaction PIN")]
    PinMismatch,

    #[error("transaction PIN must be at least {0} characters")]
    PinTooShort(usize),

    #[error("PIN confirmation does not match")]
    PinConfirmationMismatch,

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Amount, requested: Amount },

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("transaction {0} is {1}, expected Pending")]
    NotPending(TxId, TransactionStatus),

    #[error("transaction {0} is not a check deposit")]
    NotACheckDeposit(TxId),

    #[error("invalid statement period: {0}")]
    InvalidPeriod(String),
}

impl EngineError {
    /// Message safe to show to the end user. System faults carry no detail.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Validation(e) => e.to_string(),
            EngineError::Authorization(_) => {
                "You are not authorized to perform this operation.".to_string()
            }
            EngineError::NotFound(what) => format!("The requested {what} was not found."),
            EngineError::Conflict => {
                "The account is busy with another operation. Please try again.".to_string()
            }
            EngineError::System(_) => {
                "Something went wrong on our side. Please try again later.".to_string()
            }
        }
    }

    /// Only infrastructure faults are incidents.
    pub fn is_incident(&self) -> bool {
        matches!(self, EngineError::System(_))
    }

    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(ValidationError::InsufficientFunds { .. })
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => EngineError::NotFound(format!("account {id}")),
            StoreError::TransactionNotFound(id) => {
                EngineError::NotFound(format!("transaction {id}"))
            }
            StoreError::AccountInactive(id) => ValidationError::AccountInactive(id).into(),
            StoreError::InsufficientFunds {
                available,
                requested,
                ..
            } => ValidationError::InsufficientFunds {
                available,
                requested,
            }
            .into(),
            StoreError::NotPending(id, status) => ValidationError::NotPending(id, status).into(),
            StoreError::Busy => EngineError::Conflict,
            other @ (StoreError::DuplicateAccountNumber(_)
            | StoreError::DuplicateReference(_)
            | StoreError::ConstraintViolation(_)
            | StoreError::Database(_)) => {
                error!(reason = %other, "ledger store fault");
                EngineError::System(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_errors_hide_detail() {
        let err = EngineError::from(StoreError::Database("disk I/O error at page 7".into()));
        assert!(err.is_incident());
        assert!(!err.user_message().contains("page 7"));
    }

    #[test]
    fn insufficient_funds_is_a_validation_error() {
        let err = EngineError::from(StoreError::InsufficientFunds {
            account: 1,
            available: Amount::from_units(10),
            requested: Amount::from_units(20),
        });
        assert!(err.is_insufficient_funds());
        assert!(!err.is_incident());
        assert!(err.user_message().contains("insufficient funds"));
    }

    #[test]
    fn busy_store_is_a_conflict() {
        assert!(matches!(
            EngineError::from(StoreError::Busy),
            EngineError::Conflict
        ));
    }
}
