//! In-process ledger with row-level locking.
//!
//! Every account row sits behind its own mutex. An atomic unit locks the
//! rows it touches in ascending id order (so two transfers between the same
//! pair of accounts can never deadlock), then the journal, validates against
//! the locked state and only then mutates. Nothing is awaited between the
//! first mutation and the release of the locks, so a dropped future cannot
//! leave a half-applied posting behind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::{LedgerStore, Posting, Settlement, StoreError, StoreResult, TransactionFilter};
use crate::model::{
    Account, AccountId, NewAccount, TransactionRecord, TransactionStatus, TxId,
};

type Row = Arc<Mutex<Account>>;

#[derive(Default)]
struct AccountTable {
    rows: HashMap<AccountId, Row>,
    by_number: HashMap<String, AccountId>,
    next_id: AccountId,
}

#[derive(Default)]
struct Journal {
    entries: Vec<TransactionRecord>,
    references: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryLedger {
    accounts: RwLock<AccountTable>,
    journal: Mutex<Journal>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row(&self, id: AccountId) -> Option<Row> {
        self.accounts.read().await.rows.get(&id).cloned()
    }

    /// Fetch the rows for `ids`, sorted ascending and deduplicated.
    async fn rows_in_lock_order(&self, ids: &[AccountId]) -> StoreResult<Vec<Row>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let table = self.accounts.read().await;
        ids.iter()
            .map(|id| {
                table
                    .rows
                    .get(id)
                    .cloned()
                    .ok_or(StoreError::AccountNotFound(*id))
            })
            .collect()
    }

    async fn snapshot(rows: impl IntoIterator<Item = Row>) -> Vec<Account> {
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row.lock().await.clone());
        }
        accounts.sort_by_key(|a| a.id);
        accounts
    }
}

fn locked<'a, 'g>(
    guards: &'a mut [MutexGuard<'g, Account>],
    id: AccountId,
) -> StoreResult<&'a mut Account> {
    guards
        .iter_mut()
        .find(|g| g.id == id)
        .map(|g| &mut **g)
        .ok_or(StoreError::AccountNotFound(id))
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account> {
        let mut table = self.accounts.write().await;
        if table.by_number.contains_key(&account.number) {
            return Err(StoreError::DuplicateAccountNumber(account.number));
        }

        table.next_id += 1;
        let row = Account {
            id: table.next_id,
            number: account.number,
            owner: account.owner,
            kind: account.kind,
            balance: Default::default(),
            active: true,
            pin_hash: None,
            created_at: account.created_at,
        };
        table.by_number.insert(row.number.clone(), row.id);
        table.rows.insert(row.id, Arc::new(Mutex::new(row.clone())));
        Ok(row)
    }

    async fn get_account(&self, id: AccountId, owner: &str) -> StoreResult<Option<Account>> {
        Ok(self.find_account(id).await?.filter(|a| a.owner == owner))
    }

    async fn find_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        match self.row(id).await {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn get_account_by_number(&self, number: &str) -> StoreResult<Option<Account>> {
        let id = self.accounts.read().await.by_number.get(number).copied();
        match id {
            Some(id) => self.find_account(id).await,
            None => Ok(None),
        }
    }

    async fn list_accounts_for_owner(&self, owner: &str) -> StoreResult<Vec<Account>> {
        let mut accounts = self.list_accounts().await?;
        accounts.retain(|a| a.owner == owner);
        Ok(accounts)
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows: Vec<Row> = self.accounts.read().await.rows.values().cloned().collect();
        Ok(Self::snapshot(rows).await)
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> StoreResult<Account> {
        let row = self.row(id).await.ok_or(StoreError::AccountNotFound(id))?;
        let mut account = row.lock().await;
        account.active = active;
        Ok(account.clone())
    }

    async fn set_pin_hash(&self, owner: &str, pin_hash: &str) -> StoreResult<usize> {
        let ids: Vec<AccountId> = self
            .list_accounts_for_owner(owner)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let rows = self.rows_in_lock_order(&ids).await?;

        let mut guards = Vec::with_capacity(rows.len());
        for row in &rows {
            guards.push(row.lock().await);
        }

        let mut updated = 0;
        for account in guards.iter_mut().filter(|a| a.active && a.owner == owner) {
            account.pin_hash = Some(pin_hash.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn post(&self, posting: Posting) -> StoreResult<TransactionRecord> {
        posting.check_shape()?;
        let amount = posting.record.amount;

        let ids: Vec<AccountId> = posting.debit.into_iter().chain(posting.credit).collect();
        let rows = self.rows_in_lock_order(&ids).await?;
        let mut guards = Vec::with_capacity(rows.len());
        for row in &rows {
            guards.push(row.lock().await);
        }
        let mut journal = self.journal.lock().await;

        // validate against the locked state
        for guard in &guards {
            if !guard.active {
                return Err(StoreError::AccountInactive(guard.id));
            }
        }
        if let Some(debit) = posting.debit {
            let account = locked(&mut guards, debit)?;
            if account.balance < amount {
                return Err(StoreError::InsufficientFunds {
                    account: debit,
                    available: account.balance,
                    requested: amount,
                });
            }
        }
        if let Some(credit) = posting.credit {
            let account = locked(&mut guards, credit)?;
            if account.balance.checked_add(amount).is_none() {
                return Err(StoreError::ConstraintViolation(format!(
                    "balance overflow on account {credit}"
                )));
            }
        }
        if journal.references.contains(&posting.record.reference) {
            return Err(StoreError::DuplicateReference(posting.record.reference));
        }

        // mutate: no fallible step and no await past this point
        if let Some(debit) = posting.debit {
            locked(&mut guards, debit)?.balance -= amount;
        }
        if let Some(credit) = posting.credit {
            locked(&mut guards, credit)?.balance += amount;
        }
        let record = posting.record.into_record(journal.entries.len() as TxId + 1);
        journal.references.insert(record.reference.clone());
        journal.entries.push(record.clone());

        Ok(record)
    }

    async fn settle(&self, id: TxId, settlement: Settlement) -> StoreResult<TransactionRecord> {
        // Peek at the destination without holding the journal, so the lock
        // order stays row -> journal.
        let destination = {
            let journal = self.journal.lock().await;
            let tx = journal
                .entries
                .iter()
                .find(|t| t.id == id)
                .ok_or(StoreError::TransactionNotFound(id))?;
            if tx.status != TransactionStatus::Pending {
                return Err(StoreError::NotPending(id, tx.status));
            }
            tx.to_account
        };

        let credit = match settlement {
            Settlement::Clear => Some(destination.ok_or_else(|| {
                StoreError::ConstraintViolation(format!(
                    "pending transaction {id} has no destination account"
                ))
            })?),
            Settlement::Reject => None,
        };

        let rows = self.rows_in_lock_order(&credit.into_iter().collect::<Vec<_>>()).await?;
        let mut guards = Vec::with_capacity(rows.len());
        for row in &rows {
            guards.push(row.lock().await);
        }
        let mut journal = self.journal.lock().await;

        // re-check now that everything is locked
        let index = journal
            .entries
            .iter()
            .position(|t| t.id == id)
            .ok_or(StoreError::TransactionNotFound(id))?;
        let status = journal.entries[index].status;
        if status != TransactionStatus::Pending {
            return Err(StoreError::NotPending(id, status));
        }
        let amount = journal.entries[index].amount;

        if let Some(credit) = credit {
            let account = locked(&mut guards, credit)?;
            if !account.active {
                return Err(StoreError::AccountInactive(credit));
            }
            account.balance = account.balance.checked_add(amount).ok_or_else(|| {
                StoreError::ConstraintViolation(format!("balance overflow on account {credit}"))
            })?;
        }

        let entry = &mut journal.entries[index];
        entry.status = match settlement {
            Settlement::Clear => TransactionStatus::Completed,
            Settlement::Reject => TransactionStatus::Failed,
        };
        Ok(entry.clone())
    }

    async fn get_transaction(&self, id: TxId) -> StoreResult<Option<TransactionRecord>> {
        let journal = self.journal.lock().await;
        Ok(journal.entries.iter().find(|t| t.id == id).cloned())
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let journal = self.journal.lock().await;
        let mut matched: Vec<TransactionRecord> = journal
            .entries
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        drop(journal);

        matched.sort_by_key(|t| (t.created_at, t.id));
        if filter.newest_first {
            matched.reverse();
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests as shared;

    #[tokio::test]
    async fn accounts_round_trip() {
        shared::accounts_round_trip(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn transfer_moves_balance_and_records() {
        shared::transfer_moves_balance_and_records(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_effect() {
        shared::overdraft_is_rejected_without_effect(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn inactive_accounts_cannot_post() {
        shared::inactive_accounts_cannot_post(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn duplicate_reference_is_rejected() {
        shared::duplicate_reference_is_rejected(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn pending_posting_cannot_move_money() {
        shared::pending_posting_cannot_move_money(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn settle_clear_and_reject() {
        shared::settle_clear_and_reject(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn pin_hash_applies_to_active_accounts() {
        shared::pin_hash_applies_to_active_accounts(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn filters_transactions() {
        shared::filters_transactions(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn unknown_account_in_posting_is_not_found() {
        let store = MemoryLedger::new();
        let a = shared::open(&store, "alice", "A").await;
        shared::deposit(&store, a.id, 100, "DEP-1").await;

        let result = store
            .post(Posting {
                debit: Some(a.id),
                credit: Some(42),
                record: shared::record(
                    a.id,
                    Some(42),
                    50,
                    crate::model::TransactionKind::FundTransfer,
                    TransactionStatus::Completed,
                    "TXN-1",
                ),
            })
            .await;
        assert!(matches!(result, Err(StoreError::AccountNotFound(42))));
    }
}
