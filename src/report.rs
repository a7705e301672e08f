//! Admin reporting: a fixed set of parameterized queries over the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::model::{Account, AccountId, Caller, TransactionKind, TransactionRecord, TransactionStatus};
use crate::store::{LedgerStore, StoreError, TransactionFilter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportQuery {
    AccountsForOwner(String),
    /// Transactions touching `account` in `[from, to)`, oldest first.
    AccountTransactions {
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    PendingCheckDeposits,
    /// Completed volume per kind in `[from, to)`.
    TotalsByKind {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindTotal {
    pub kind: TransactionKind,
    pub count: usize,
    pub total: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Accounts(Vec<Account>),
    Transactions(Vec<TransactionRecord>),
    Totals(Vec<KindTotal>),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reports are available to admins only")]
    NotAuthorized,

    #[error("report range is empty: {from} is not before {to}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("{0} total overflowed")]
    Overflow(TransactionKind),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Reporter {
    store: Arc<dyn LedgerStore>,
}

impl Reporter {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, caller: &Caller, query: ReportQuery) -> Result<Report, ReportError> {
        if !caller.is_admin() {
            return Err(ReportError::NotAuthorized);
        }
        let report = match &query {
            ReportQuery::AccountsForOwner(owner) => {
                Report::Accounts(self.store.list_accounts_for_owner(owner).await?)
            }
            ReportQuery::AccountTransactions { account, from, to } => {
                check_range(*from, *to)?;
                if self.store.find_account(*account).await?.is_none() {
                    return Err(ReportError::AccountNotFound(*account));
                }
                let filter = TransactionFilter {
                    from: Some(*from),
                    until: Some(*to),
                    ..TransactionFilter::for_account(*account)
                };
                Report::Transactions(self.store.list_transactions(&filter).await?)
            }
            ReportQuery::PendingCheckDeposits => {
                let filter = TransactionFilter {
                    kind: Some(TransactionKind::CheckDeposit),
                    status: Some(TransactionStatus::Pending),
                    ..TransactionFilter::default()
                };
                Report::Transactions(self.store.list_transactions(&filter).await?)
            }
            ReportQuery::TotalsByKind { from, to } => {
                check_range(*from, *to)?;
                let filter = TransactionFilter {
                    status: Some(TransactionStatus::Completed),
                    from: Some(*from),
                    until: Some(*to),
                    ..TransactionFilter::default()
                };
                let records = self.store.list_transactions(&filter).await?;
                Report::Totals(totals(&records)?)
            }
        };
        info!(caller = %caller.identity, query = ?query, "report applied");
        Ok(report)
    }
}

fn check_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), ReportError> {
    if from < to {
        Ok(())
    } else {
        Err(ReportError::InvalidRange { from, to })
    }
}

fn totals(records: &[TransactionRecord]) -> Result<Vec<KindTotal>, ReportError> {
    let mut by_kind: BTreeMap<TransactionKind, KindTotal> = BTreeMap::new();
    for record in records {
        let entry = by_kind.entry(record.kind).or_insert(KindTotal {
            kind: record.kind,
            count: 0,
            total: Amount::ZERO,
        });
        entry.count += 1;
        entry.total = entry
            .total
            .checked_add(record.amount)
            .ok_or(ReportError::Overflow(record.kind))?;
    }
    Ok(by_kind.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::model::Role;
    use crate::store::tests::{deposit, open, record};
    use crate::store::{MemoryLedger, Posting};

    fn admin() -> Caller {
        Caller::new("root", Role::Admin)
    }

    async fn seeded() -> (Arc<MemoryLedger>, Account, Account) {
        let store = Arc::new(MemoryLedger::new());
        let a = open(store.as_ref(), "alice", "SAV1").await;
        let b = open(store.as_ref(), "bob", "SAV2").await;
        deposit(store.as_ref(), a.id, 10_000, "DEP1").await;
        store
            .post(Posting {
                debit: Some(a.id),
                credit: Some(b.id),
                record: record(
                    a.id,
                    Some(b.id),
                    2_500,
                    TransactionKind::FundTransfer,
                    TransactionStatus::Completed,
                    "TXN1",
                ),
            })
            .await
            .unwrap();
        store
            .post(Posting {
                debit: None,
                credit: None,
                record: record(
                    b.id,
                    Some(b.id),
                    700,
                    TransactionKind::CheckDeposit,
                    TransactionStatus::Pending,
                    "DEP2",
                ),
            })
            .await
            .unwrap();
        (store, a, b)
    }

    #[tokio::test]
    async fn users_cannot_run_reports() {
        let (store, _, _) = seeded().await;
        let reporter = Reporter::new(store);
        let err = reporter
            .run(&Caller::new("alice", Role::User), ReportQuery::PendingCheckDeposits)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::NotAuthorized));
    }

    #[tokio::test]
    async fn pending_checks_and_owner_accounts() {
        let (store, a, b) = seeded().await;
        let reporter = Reporter::new(store);

        let Report::Transactions(pending) = reporter
            .run(&admin(), ReportQuery::PendingCheckDeposits)
            .await
            .unwrap()
        else {
            panic!("expected transactions");
        };
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].to_account, Some(b.id));

        let Report::Accounts(accounts) = reporter
            .run(&admin(), ReportQuery::AccountsForOwner("alice".into()))
            .await
            .unwrap()
        else {
            panic!("expected accounts");
        };
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, a.id);
        assert_eq!(accounts[0].balance, Amount::from_cents(7_500));
    }

    #[tokio::test]
    async fn totals_count_completed_only() {
        let (store, _, _) = seeded().await;
        let reporter = Reporter::new(store);
        let now = Utc::now();

        let Report::Totals(totals) = reporter
            .run(
                &admin(),
                ReportQuery::TotalsByKind {
                    from: now - Duration::days(30),
                    to: now + Duration::days(1),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected totals");
        };
        assert_eq!(
            totals,
            vec![
                KindTotal {
                    kind: TransactionKind::CashDeposit,
                    count: 1,
                    total: Amount::from_cents(10_000),
                },
                KindTotal {
                    kind: TransactionKind::FundTransfer,
                    count: 1,
                    total: Amount::from_cents(2_500),
                },
            ]
        );
    }

    #[tokio::test]
    async fn account_transactions_validate_inputs() {
        let (store, a, _) = seeded().await;
        let reporter = Reporter::new(store);
        let now = Utc::now();

        let err = reporter
            .run(
                &admin(),
                ReportQuery::AccountTransactions {
                    account: a.id,
                    from: now,
                    to: now,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::InvalidRange { .. }));

        let err = reporter
            .run(
                &admin(),
                ReportQuery::AccountTransactions {
                    account: 999,
                    from: now - Duration::days(1),
                    to: now + Duration::days(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::AccountNotFound(999)));

        let Report::Transactions(history) = reporter
            .run(
                &admin(),
                ReportQuery::AccountTransactions {
                    account: a.id,
                    from: now - Duration::days(1),
                    to: now + Duration::days(1),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected transactions");
        };
        assert_eq!(history.len(), 2);
    }
}
