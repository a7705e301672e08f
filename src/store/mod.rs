//! Ledger storage port.
//!
//! The [`LedgerStore`] trait is the only way account balances and the
//! transaction history are read or written. Every balance mutation goes
//! through [`LedgerStore::post`] or [`LedgerStore::settle`], each of which is
//! one atomic unit: the balance checks, the balance changes and the
//! transaction row either all land or none do.
//!
//! Two implementations are provided:
//! - [`MemoryLedger`]: in-process tables with one lock per account row,
//!   acquired in ascending id order.
//! - [`SqliteLedger`]: durable rusqlite tables, one `BEGIN IMMEDIATE`
//!   transaction per atomic unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Amount;
use crate::model::{
    Account, AccountId, NewAccount, NewTransaction, TransactionKind, TransactionRecord,
    TransactionStatus, TxId,
};

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("insufficient funds in account {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },

    #[error("transaction {0} not found")]
    TransactionNotFound(TxId),

    #[error("transaction {0} is {1}, expected Pending")]
    NotPending(TxId, TransactionStatus),

    #[error("duplicate account number {0}")]
    DuplicateAccountNumber(String),

    #[error("duplicate reference number {0}")]
    DuplicateReference(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Another writer holds the lock; the operation may be retried.
    #[error("storage busy")]
    Busy,

    #[error("database error: {0}")]
    Database(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Inputs
// =============================================================================

/// One atomic balance mutation plus the transaction row that records it.
///
/// The amount moved is `record.amount`. `debit` is decremented and `credit`
/// is incremented; either may be absent (a deposit has no debit side, a
/// transfer to an external bank has no credit side). A posting that moves
/// money must record a `Completed` transaction.
#[derive(Debug, Clone)]
pub struct Posting {
    pub debit: Option<AccountId>,
    pub credit: Option<AccountId>,
    pub record: NewTransaction,
}

impl Posting {
    pub fn moves_money(&self) -> bool {
        self.debit.is_some() || self.credit.is_some()
    }

    /// Shared preconditions every backend enforces before touching rows.
    fn check_shape(&self) -> StoreResult<()> {
        if !self.record.amount.is_positive() {
            return Err(StoreError::ConstraintViolation(format!(
                "transaction amount must be positive, got {}",
                self.record.amount
            )));
        }
        if self.debit.is_some() && self.debit == self.credit {
            return Err(StoreError::ConstraintViolation(
                "debit and credit accounts must differ".to_string(),
            ));
        }
        if self.moves_money() && self.record.status != TransactionStatus::Completed {
            return Err(StoreError::ConstraintViolation(format!(
                "a posting that moves money must be Completed, got {}",
                self.record.status
            )));
        }
        Ok(())
    }
}

/// Outcome applied to a Pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Credit the destination account and mark the transaction Completed.
    Clear,
    /// Mark the transaction Failed; no balance changes.
    Reject,
}

/// Filter options for transaction queries.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Matches either side of the transaction.
    pub account: Option<AccountId>,
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl TransactionFilter {
    pub fn for_account(account: AccountId) -> Self {
        Self {
            account: Some(account),
            ..Self::default()
        }
    }

    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        self.account.is_none_or(|account| tx.involves(account))
            && self.kind.is_none_or(|kind| tx.kind == kind)
            && self.status.is_none_or(|status| tx.status == status)
            && self.from.is_none_or(|from| tx.created_at >= from)
            && self.until.is_none_or(|until| tx.created_at < until)
    }
}

// =============================================================================
// Port
// =============================================================================

/// Durable table of accounts and transactions.
///
/// There is no caching layer: every read goes to the backing tables.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new account with a zero balance and no PIN.
    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account>;

    /// Get an account by id, only if it belongs to `owner`.
    async fn get_account(&self, id: AccountId, owner: &str) -> StoreResult<Option<Account>>;

    /// Get an account by id regardless of owner.
    async fn find_account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Get an account by its human-readable number.
    async fn get_account_by_number(&self, number: &str) -> StoreResult<Option<Account>>;

    /// List an owner's accounts, ordered by id.
    async fn list_accounts_for_owner(&self, owner: &str) -> StoreResult<Vec<Account>>;

    /// List every account, ordered by id.
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Flip the active flag. Accounts are never deleted.
    async fn set_account_active(&self, id: AccountId, active: bool) -> StoreResult<Account>;

    /// Store a PIN hash on every active account of `owner`; returns how many were updated.
    async fn set_pin_hash(&self, owner: &str, pin_hash: &str) -> StoreResult<usize>;

    /// Apply a posting as one atomic unit.
    ///
    /// Re-reads the involved rows inside the unit and fails without any
    /// effect if an account is missing or inactive, or if the debit side
    /// would go negative.
    async fn post(&self, posting: Posting) -> StoreResult<TransactionRecord>;

    /// Settle a Pending transaction as one atomic unit.
    async fn settle(&self, id: TxId, settlement: Settlement) -> StoreResult<TransactionRecord>;

    async fn get_transaction(&self, id: TxId) -> StoreResult<Option<TransactionRecord>>;

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<TransactionRecord>>;
}

#[cfg(test)]
pub(crate) mod tests {
    //! Behaviour every backend must share. Each backend's test module calls
    //! these against a fresh store.

    use super::*;
    use chrono::Duration;

    use crate::model::AccountKind;

    pub(crate) async fn open(store: &dyn LedgerStore, owner: &str, number: &str) -> Account {
        store
            .insert_account(NewAccount {
                number: number.to_string(),
                owner: owner.to_string(),
                kind: AccountKind::Savings,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    pub(crate) fn record(
        from: AccountId,
        to: Option<AccountId>,
        amount: i64,
        kind: TransactionKind,
        status: TransactionStatus,
        reference: &str,
    ) -> NewTransaction {
        NewTransaction {
            from_account: from,
            to_account: to,
            to_account_number: "EXT-1".to_string(),
            amount: Amount::from_cents(amount),
            kind,
            status,
            description: String::new(),
            reference: reference.to_string(),
            created_at: Utc::now(),
        }
    }

    pub(crate) async fn deposit(store: &dyn LedgerStore, account: AccountId, cents: i64, reference: &str) {
        store
            .post(Posting {
                debit: None,
                credit: Some(account),
                record: record(
                    account,
                    Some(account),
                    cents,
                    TransactionKind::CashDeposit,
                    TransactionStatus::Completed,
                    reference,
                ),
            })
            .await
            .unwrap();
    }

    async fn balance(store: &dyn LedgerStore, id: AccountId) -> Amount {
        store.find_account(id).await.unwrap().unwrap().balance
    }

    pub(crate) async fn accounts_round_trip(store: &dyn LedgerStore) {
        let a = open(store, "alice", "SAV-1").await;
        assert_eq!(a.balance, Amount::ZERO);
        assert!(a.active);
        assert!(a.pin_hash.is_none());

        assert_eq!(store.get_account(a.id, "alice").await.unwrap(), Some(a.clone()));
        assert_eq!(store.get_account(a.id, "mallory").await.unwrap(), None);
        assert_eq!(
            store.get_account_by_number("SAV-1").await.unwrap().map(|acc| acc.id),
            Some(a.id)
        );
        assert_eq!(store.get_account_by_number("nope").await.unwrap(), None);

        let dup = store
            .insert_account(NewAccount {
                number: "SAV-1".to_string(),
                owner: "bob".to_string(),
                kind: AccountKind::Checking,
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(dup, Err(StoreError::DuplicateAccountNumber(_))));

        open(store, "alice", "CHK-1").await;
        let owned = store.list_accounts_for_owner("alice").await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.windows(2).all(|w| w[0].id < w[1].id));
    }

    pub(crate) async fn transfer_moves_balance_and_records(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let b = open(store, "bob", "B").await;
        deposit(store, a.id, 10_000, "DEP-1").await;
        deposit(store, b.id, 1_000, "DEP-2").await;

        let tx = store
            .post(Posting {
                debit: Some(a.id),
                credit: Some(b.id),
                record: record(
                    a.id,
                    Some(b.id),
                    4_000,
                    TransactionKind::FundTransfer,
                    TransactionStatus::Completed,
                    "TXN-1",
                ),
            })
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(balance(store, a.id).await, Amount::from_cents(6_000));
        assert_eq!(balance(store, b.id).await, Amount::from_cents(5_000));
        assert_eq!(store.get_transaction(tx.id).await.unwrap(), Some(tx));
    }

    pub(crate) async fn overdraft_is_rejected_without_effect(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let b = open(store, "bob", "B").await;
        deposit(store, a.id, 1_000, "DEP-1").await;

        let result = store
            .post(Posting {
                debit: Some(a.id),
                credit: Some(b.id),
                record: record(
                    a.id,
                    Some(b.id),
                    1_001,
                    TransactionKind::FundTransfer,
                    TransactionStatus::Completed,
                    "TXN-1",
                ),
            })
            .await;

        assert!(matches!(result, Err(StoreError::InsufficientFunds { .. })));
        assert_eq!(balance(store, a.id).await, Amount::from_cents(1_000));
        assert_eq!(balance(store, b.id).await, Amount::ZERO);
        let all = store
            .list_transactions(&TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    pub(crate) async fn inactive_accounts_cannot_post(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        store.set_account_active(a.id, false).await.unwrap();

        let result = store
            .post(Posting {
                debit: None,
                credit: Some(a.id),
                record: record(
                    a.id,
                    Some(a.id),
                    100,
                    TransactionKind::CashDeposit,
                    TransactionStatus::Completed,
                    "DEP-1",
                ),
            })
            .await;
        assert!(matches!(result, Err(StoreError::AccountInactive(id)) if id == a.id));
        assert_eq!(balance(store, a.id).await, Amount::ZERO);
    }

    pub(crate) async fn duplicate_reference_is_rejected(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        deposit(store, a.id, 100, "DEP-1").await;

        let result = store
            .post(Posting {
                debit: None,
                credit: Some(a.id),
                record: record(
                    a.id,
                    Some(a.id),
                    100,
                    TransactionKind::CashDeposit,
                    TransactionStatus::Completed,
                    "DEP-1",
                ),
            })
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateReference(_))));
        assert_eq!(balance(store, a.id).await, Amount::from_cents(100));
    }

    pub(crate) async fn pending_posting_cannot_move_money(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let result = store
            .post(Posting {
                debit: None,
                credit: Some(a.id),
                record: record(
                    a.id,
                    Some(a.id),
                    100,
                    TransactionKind::CheckDeposit,
                    TransactionStatus::Pending,
                    "DEP-1",
                ),
            })
            .await;
        assert!(matches!(result, Err(StoreError::ConstraintViolation(_))));
    }

    pub(crate) async fn settle_clear_and_reject(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let pending = |reference: &str| Posting {
            debit: None,
            credit: None,
            record: record(
                a.id,
                Some(a.id),
                2_500,
                TransactionKind::CheckDeposit,
                TransactionStatus::Pending,
                reference,
            ),
        };

        let first = store.post(pending("DEP-1")).await.unwrap();
        assert_eq!(balance(store, a.id).await, Amount::ZERO);

        let cleared = store.settle(first.id, Settlement::Clear).await.unwrap();
        assert_eq!(cleared.status, TransactionStatus::Completed);
        assert_eq!(balance(store, a.id).await, Amount::from_cents(2_500));

        let again = store.settle(first.id, Settlement::Clear).await;
        assert!(matches!(
            again,
            Err(StoreError::NotPending(_, TransactionStatus::Completed))
        ));
        assert_eq!(balance(store, a.id).await, Amount::from_cents(2_500));

        let second = store.post(pending("DEP-2")).await.unwrap();
        let rejected = store.settle(second.id, Settlement::Reject).await.unwrap();
        assert_eq!(rejected.status, TransactionStatus::Failed);
        assert_eq!(balance(store, a.id).await, Amount::from_cents(2_500));

        assert!(matches!(
            store.settle(999, Settlement::Clear).await,
            Err(StoreError::TransactionNotFound(999))
        ));
    }

    pub(crate) async fn pin_hash_applies_to_active_accounts(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let b = open(store, "alice", "B").await;
        let c = open(store, "bob", "C").await;
        store.set_account_active(b.id, false).await.unwrap();

        let updated = store.set_pin_hash("alice", "hash").await.unwrap();
        assert_eq!(updated, 1);
        let pin = |id| async move { store.find_account(id).await.unwrap().unwrap().pin_hash };
        assert_eq!(pin(a.id).await.as_deref(), Some("hash"));
        assert_eq!(pin(b.id).await, None);
        assert_eq!(pin(c.id).await, None);
    }

    pub(crate) async fn filters_transactions(store: &dyn LedgerStore) {
        let a = open(store, "alice", "A").await;
        let b = open(store, "bob", "B").await;
        deposit(store, a.id, 500, "DEP-1").await;
        deposit(store, b.id, 700, "DEP-2").await;
        store
            .post(Posting {
                debit: Some(a.id),
                credit: Some(b.id),
                record: record(
                    a.id,
                    Some(b.id),
                    200,
                    TransactionKind::FundTransfer,
                    TransactionStatus::Completed,
                    "TXN-1",
                ),
            })
            .await
            .unwrap();

        let for_b = store
            .list_transactions(&TransactionFilter::for_account(b.id))
            .await
            .unwrap();
        assert_eq!(
            for_b.iter().map(|t| t.reference.as_str()).collect::<Vec<_>>(),
            vec!["DEP-2", "TXN-1"]
        );

        let newest = store
            .list_transactions(&TransactionFilter {
                newest_first: true,
                limit: Some(1),
                ..TransactionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].reference, "TXN-1");

        let transfers = store
            .list_transactions(&TransactionFilter {
                kind: Some(TransactionKind::FundTransfer),
                ..TransactionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(transfers.len(), 1);

        let future = store
            .list_transactions(&TransactionFilter {
                from: Some(Utc::now() + Duration::days(1)),
                ..TransactionFilter::default()
            })
            .await
            .unwrap();
        assert!(future.is_empty());
    }
}
