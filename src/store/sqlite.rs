//! Durable ledger on SQLite.
//!
//! Each operation opens its own connection on the blocking pool and each
//! atomic unit runs inside one `BEGIN IMMEDIATE` transaction, so the write
//! lock is taken before any row is read. Contention surfaces as
//! [`StoreError::Busy`] once the busy timeout elapses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params,
    params_from_iter,
};
use tracing::debug;

use super::{LedgerStore, Posting, Settlement, StoreError, StoreResult, TransactionFilter};
use crate::Amount;
use crate::model::{
    Account, AccountId, AccountKind, NewAccount, NewTransaction, TransactionKind,
    TransactionRecord, TransactionStatus, TxId,
};

const ACCOUNT_COLUMNS: &str = "id, number, owner, kind, balance, active, pin_hash, created_at";
const TRANSACTION_COLUMNS: &str = "id, from_account, to_account, to_account_number, amount, \
     kind, status, description, reference, created_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        number      TEXT NOT NULL UNIQUE,
        owner       TEXT NOT NULL,
        kind        TEXT NOT NULL,
        balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        active      INTEGER NOT NULL DEFAULT 1,
        pin_hash    TEXT,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transactions (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        from_account        INTEGER NOT NULL REFERENCES accounts(id),
        to_account          INTEGER REFERENCES accounts(id),
        to_account_number   TEXT NOT NULL,
        amount              INTEGER NOT NULL CHECK (amount > 0),
        kind                TEXT NOT NULL,
        status              TEXT NOT NULL,
        description         TEXT NOT NULL DEFAULT '',
        reference           TEXT NOT NULL UNIQUE,
        created_at          TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
    CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_account);
    CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions(to_account);
    CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Busy
            }
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::ConstraintViolation(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Whether `err` is a UNIQUE violation on `column` (`table.column`).
fn unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.code == ErrorCode::ConstraintViolation
                && msg.contains("UNIQUE")
                && msg.contains(column)
        }
        _ => false,
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_id(id: u64) -> i64 {
    id as i64
}

fn column<T, E>(idx: usize, raw: &str, parse: impl FnOnce(&str) -> Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    parse(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(Account {
        id: row.get::<_, i64>(0)? as AccountId,
        number: row.get(1)?,
        owner: row.get(2)?,
        kind: column(3, &kind, |s| s.parse::<AccountKind>())?,
        balance: Amount::from_cents(row.get(4)?),
        active: row.get(5)?,
        pin_hash: row.get(6)?,
        created_at: column(7, &created_at, parse_time)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let kind: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    Ok(TransactionRecord {
        id: row.get::<_, i64>(0)? as TxId,
        from_account: row.get::<_, i64>(1)? as AccountId,
        to_account: row.get::<_, Option<i64>>(2)?.map(|id| id as AccountId),
        to_account_number: row.get(3)?,
        amount: Amount::from_cents(row.get(4)?),
        kind: column(5, &kind, |s| s.parse::<TransactionKind>())?,
        status: column(6, &status, |s| s.parse::<TransactionStatus>())?,
        description: row.get(7)?,
        reference: row.get(8)?,
        created_at: column(9, &created_at, parse_time)?,
    })
}

fn load_account(conn: &Connection, id: AccountId) -> StoreResult<Option<Account>> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![sql_id(id)], account_from_row)
        .optional()?)
}

fn load_transaction(conn: &Connection, id: TxId) -> StoreResult<Option<TransactionRecord>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![sql_id(id)], transaction_from_row)
        .optional()?)
}

fn insert_transaction(conn: &Connection, record: NewTransaction) -> StoreResult<TransactionRecord> {
    let inserted = conn.execute(
        "INSERT INTO transactions
         (from_account, to_account, to_account_number, amount, kind, status,
          description, reference, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            sql_id(record.from_account),
            record.to_account.map(sql_id),
            record.to_account_number,
            record.amount.cents(),
            record.kind.code(),
            record.status.as_str(),
            record.description,
            record.reference,
            timestamp(&record.created_at),
        ],
    );
    match inserted {
        Ok(_) => Ok(record.into_record(conn.last_insert_rowid() as TxId)),
        Err(e) if unique_violation(&e, "transactions.reference") => {
            Err(StoreError::DuplicateReference(record.reference))
        }
        Err(e) => Err(e.into()),
    }
}

fn connect(path: &Path, busy_timeout: Duration) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

pub struct SqliteLedger {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = connect(&path, busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), journal_mode = %mode, "ledger database ready");

        Ok(Self { path, busy_timeout })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path, busy_timeout)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (number, owner, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    account.number,
                    account.owner,
                    account.kind.as_str(),
                    timestamp(&account.created_at),
                ],
            );
            match inserted {
                Ok(_) => load_account(conn, conn.last_insert_rowid() as AccountId)?.ok_or_else(
                    || StoreError::Database("inserted account vanished".to_string()),
                ),
                Err(e) if unique_violation(&e, "accounts.number") => {
                    Err(StoreError::DuplicateAccountNumber(account.number))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_account(&self, id: AccountId, owner: &str) -> StoreResult<Option<Account>> {
        let owner = owner.to_string();
        self.with_conn(move |conn| Ok(load_account(conn, id)?.filter(|a| a.owner == owner)))
            .await
    }

    async fn find_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        self.with_conn(move |conn| load_account(conn, id)).await
    }

    async fn get_account_by_number(&self, number: &str) -> StoreResult<Option<Account>> {
        let number = number.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE number = ?1");
            Ok(conn
                .query_row(&sql, params![number], account_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_accounts_for_owner(&self, owner: &str) -> StoreResult<Vec<Account>> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let accounts = stmt
                .query_map(params![owner], account_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let accounts = stmt
                .query_map([], account_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> StoreResult<Account> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE accounts SET active = ?1 WHERE id = ?2",
                params![active, sql_id(id)],
            )?;
            if updated == 0 {
                return Err(StoreError::AccountNotFound(id));
            }
            let account = load_account(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;
            tx.commit()?;
            Ok(account)
        })
        .await
    }

    async fn set_pin_hash(&self, owner: &str, pin_hash: &str) -> StoreResult<usize> {
        let owner = owner.to_string();
        let pin_hash = pin_hash.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE accounts SET pin_hash = ?1 WHERE owner = ?2 AND active = 1",
                params![pin_hash, owner],
            )?)
        })
        .await
    }

    async fn post(&self, posting: Posting) -> StoreResult<TransactionRecord> {
        posting.check_shape()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let amount = posting.record.amount;

            if let Some(debit) = posting.debit {
                let account = load_account(&tx, debit)?.ok_or(StoreError::AccountNotFound(debit))?;
                if !account.active {
                    return Err(StoreError::AccountInactive(debit));
                }
                if account.balance < amount {
                    return Err(StoreError::InsufficientFunds {
                        account: debit,
                        available: account.balance,
                        requested: amount,
                    });
                }
                tx.execute(
                    "UPDATE accounts SET balance = balance - ?1 WHERE id = ?2",
                    params![amount.cents(), sql_id(debit)],
                )?;
            }
            if let Some(credit) = posting.credit {
                let account =
                    load_account(&tx, credit)?.ok_or(StoreError::AccountNotFound(credit))?;
                if !account.active {
                    return Err(StoreError::AccountInactive(credit));
                }
                if account.balance.checked_add(amount).is_none() {
                    return Err(StoreError::ConstraintViolation(format!(
                        "balance overflow on account {credit}"
                    )));
                }
                tx.execute(
                    "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2",
                    params![amount.cents(), sql_id(credit)],
                )?;
            }

            let record = insert_transaction(&tx, posting.record)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn settle(&self, id: TxId, settlement: Settlement) -> StoreResult<TransactionRecord> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = load_transaction(&tx, id)?.ok_or(StoreError::TransactionNotFound(id))?;
            if record.status != TransactionStatus::Pending {
                return Err(StoreError::NotPending(id, record.status));
            }

            record.status = match settlement {
                Settlement::Clear => {
                    let credit = record.to_account.ok_or_else(|| {
                        StoreError::ConstraintViolation(format!(
                            "pending transaction {id} has no destination account"
                        ))
                    })?;
                    let account =
                        load_account(&tx, credit)?.ok_or(StoreError::AccountNotFound(credit))?;
                    if !account.active {
                        return Err(StoreError::AccountInactive(credit));
                    }
                    if account.balance.checked_add(record.amount).is_none() {
                        return Err(StoreError::ConstraintViolation(format!(
                            "balance overflow on account {credit}"
                        )));
                    }
                    tx.execute(
                        "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2",
                        params![record.amount.cents(), sql_id(credit)],
                    )?;
                    TransactionStatus::Completed
                }
                Settlement::Reject => TransactionStatus::Failed,
            };

            tx.execute(
                "UPDATE transactions SET status = ?1 WHERE id = ?2",
                params![record.status.as_str(), sql_id(id)],
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn get_transaction(&self, id: TxId) -> StoreResult<Option<TransactionRecord>> {
        self.with_conn(move |conn| load_transaction(conn, id)).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(account) = filter.account {
            clauses.push("(from_account = ? OR to_account = ?)");
            values.push(Value::Integer(sql_id(account)));
            values.push(Value::Integer(sql_id(account)));
        }
        if let Some(kind) = filter.kind {
            clauses.push("kind = ?");
            values.push(Value::Text(kind.code().to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = &filter.from {
            clauses.push("created_at >= ?");
            values.push(Value::Text(timestamp(from)));
        }
        if let Some(until) = &filter.until {
            clauses.push("created_at < ?");
            values.push(Value::Text(timestamp(until)));
        }

        let mut sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(if filter.newest_first {
            " ORDER BY created_at DESC, id DESC"
        } else {
            " ORDER BY created_at ASC, id ASC"
        });
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(values.iter()), transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
