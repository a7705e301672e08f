//! Transfer engine.
//!
//! Validates and executes money movement (internal and external transfers,
//! cash and check deposits, incoming wires) as atomic postings against the
//! ledger store. Preconditions are checked in a fixed order and the first
//! failure wins; nothing touches storage until every precondition passes.
//! The balance check is repeated by the store inside the atomic unit, so a
//! concurrent debit between the two checks can never overdraw the account.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::clock::Clock;
use crate::config::{BankConfig, LimitsConfig};
use crate::credential::CredentialHasher;
use crate::model::{
    Account, AccountId, AccountKind, Caller, NewAccount, NewTransaction, Role, TransactionKind,
    TransactionRecord, TransactionStatus, TxId,
};
use crate::notify::{NewNotification, NotificationCategory, NotificationSink};
use crate::store::{LedgerStore, Posting, Settlement, StoreError, StoreResult, TransactionFilter};

mod error;
pub use error::{EngineError, ValidationError};

pub mod reference;

/// Optional details attached to a request; which ones are required depends on the kind.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub description: Option<String>,
    pub check_number: Option<String>,
    pub check_issuer: Option<String>,
    pub sender_name: Option<String>,
    pub sender_bank: Option<String>,
    pub wire_reference: Option<String>,
}

/// One money movement on behalf of the caller.
///
/// `source` is always an account owned by the caller: the account debited
/// for a transfer, or the account credited for a deposit or wire.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub kind: TransactionKind,
    pub source: AccountId,
    /// Destination account number, for transfers.
    pub destination: Option<String>,
    pub amount: Amount,
    pub pin: Option<String>,
    pub metadata: Metadata,
}

impl TransferRequest {
    pub fn fund_transfer(
        source: AccountId,
        destination: impl Into<String>,
        amount: Amount,
        pin: impl Into<String>,
    ) -> Self {
        Self {
            kind: TransactionKind::FundTransfer,
            source,
            destination: Some(destination.into()),
            amount,
            pin: Some(pin.into()),
            metadata: Metadata::default(),
        }
    }

    pub fn cash_deposit(account: AccountId, amount: Amount) -> Self {
        Self {
            kind: TransactionKind::CashDeposit,
            source: account,
            destination: None,
            amount,
            pin: None,
            metadata: Metadata::default(),
        }
    }

    pub fn check_deposit(
        account: AccountId,
        amount: Amount,
        check_number: impl Into<String>,
        issuer: Option<String>,
    ) -> Self {
        Self {
            kind: TransactionKind::CheckDeposit,
            source: account,
            destination: None,
            amount,
            pin: None,
            metadata: Metadata {
                check_number: Some(check_number.into()),
                check_issuer: issuer,
                ..Metadata::default()
            },
        }
    }

    pub fn wire_incoming(
        account: AccountId,
        amount: Amount,
        sender_name: impl Into<String>,
        sender_bank: impl Into<String>,
        pin: impl Into<String>,
    ) -> Self {
        Self {
            kind: TransactionKind::WireIncoming,
            source: account,
            destination: None,
            amount,
            pin: Some(pin.into()),
            metadata: Metadata {
                sender_name: Some(sender_name.into()),
                sender_bank: Some(sender_bank.into()),
                ..Metadata::default()
            },
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }
}

/// Where a transfer lands. `account` is `None` for a bank outside this ledger.
#[derive(Debug)]
struct Destination {
    account: Option<Account>,
    number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementPeriod {
    Monthly { year: i32, month: u32 },
    Annual { year: i32 },
}

impl StatementPeriod {
    /// Half-open `[from, until)` range covered by the period.
    pub fn bounds(self) -> Result<(DateTime<Utc>, DateTime<Utc>), ValidationError> {
        let start = |year: i32, month: u32| {
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| ValidationError::InvalidPeriod(format!("{year}-{month:02}")))
        };
        match self {
            StatementPeriod::Monthly { year, month } => {
                if !(1..=12).contains(&month) {
                    return Err(ValidationError::InvalidPeriod(format!("month {month}")));
                }
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                Ok((start(year, month)?, start(next_year, next_month)?))
            }
            StatementPeriod::Annual { year } => Ok((start(year, 1)?, start(year + 1, 1)?)),
        }
    }
}

/// Read-only transaction list for one account and period, oldest first.
#[derive(Debug, Clone)]
pub struct Statement {
    pub account: Account,
    pub period: StatementPeriod,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub transactions: Vec<TransactionRecord>,
    /// Sum of completed money into the account.
    pub credits: Amount,
    /// Sum of completed money out of the account.
    pub debits: Amount,
}

/// Result of a clearing sweep. Each item settles in its own atomic unit.
#[derive(Debug, Default)]
pub struct ClearingReport {
    pub cleared: Vec<TxId>,
    pub failed: Vec<(TxId, EngineError)>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    hasher: Arc<dyn CredentialHasher>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    limits: LimitsConfig,
    min_pin_length: usize,
    retry: RetryPolicy,
}

/// Public API
impl TransferEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        hasher: Arc<dyn CredentialHasher>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: &BankConfig,
    ) -> Self {
        Self {
            store,
            hasher,
            notifier,
            clock,
            limits: config.limits.clone(),
            min_pin_length: config.credentials.min_pin_length,
            retry: RetryPolicy {
                max_retries: config.store.max_conflict_retries,
                backoff: config.store.retry_backoff,
            },
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Validate and apply one money movement.
    pub async fn execute(
        &self,
        caller: &Caller,
        request: TransferRequest,
    ) -> Result<TransactionRecord, EngineError> {
        let (kind, source, amount) = (request.kind, request.source, request.amount);
        let result = self.apply(caller, request).await;
        Self::log_result(kind.code(), source, amount, &result);
        result
    }

    /// Clear a Pending check deposit: credit the account and mark it Completed.
    pub async fn clear_check(
        &self,
        caller: &Caller,
        id: TxId,
    ) -> Result<TransactionRecord, EngineError> {
        require_role(caller, Role::Admin, "clearing checks")?;
        self.settle_check(id, Settlement::Clear).await
    }

    /// Reject a Pending check deposit: mark it Failed, no balance change.
    pub async fn reject_check(
        &self,
        caller: &Caller,
        id: TxId,
    ) -> Result<TransactionRecord, EngineError> {
        require_role(caller, Role::Admin, "rejecting checks")?;
        self.settle_check(id, Settlement::Reject).await
    }

    /// Clear every Pending check deposit, one atomic unit per check.
    /// A failed item is reported and does not stop the sweep.
    pub async fn clear_pending_checks(
        &self,
        caller: &Caller,
    ) -> Result<ClearingReport, EngineError> {
        require_role(caller, Role::Admin, "clearing checks")?;
        let pending = self
            .store
            .list_transactions(&TransactionFilter {
                kind: Some(TransactionKind::CheckDeposit),
                status: Some(TransactionStatus::Pending),
                ..TransactionFilter::default()
            })
            .await?;

        let mut report = ClearingReport::default();
        for tx in pending {
            match self.settle_check(tx.id, Settlement::Clear).await {
                Ok(_) => report.cleared.push(tx.id),
                Err(e) => report.failed.push((tx.id, e)),
            }
        }
        info!(
            cleared = report.cleared.len(),
            failed = report.failed.len(),
            "check clearing sweep finished"
        );
        Ok(report)
    }

    /// Set (or reset) the caller's T-Pin on all of their active accounts.
    pub async fn set_pin(
        &self,
        caller: &Caller,
        new_pin: &str,
        confirm: &str,
    ) -> Result<usize, EngineError> {
        require_role(caller, Role::User, "setting a transaction PIN")?;
        self.check_new_pin(new_pin, confirm)?;
        self.store_pin(caller, new_pin).await
    }

    /// Change an existing T-Pin after verifying the current one.
    pub async fn change_pin(
        &self,
        caller: &Caller,
        current: &str,
        new_pin: &str,
        confirm: &str,
    ) -> Result<usize, EngineError> {
        require_role(caller, Role::User, "changing a transaction PIN")?;
        let stored = self
            .store
            .list_accounts_for_owner(&caller.identity)
            .await?
            .into_iter()
            .filter(|a| a.active)
            .find_map(|a| a.pin_hash)
            .ok_or(ValidationError::PinNotSet)?;
        if !self.verify_secret(current, stored).await? {
            info!(owner = %caller.identity, "pin change skipped: current PIN mismatch");
            return Err(ValidationError::PinMismatch.into());
        }
        self.check_new_pin(new_pin, confirm)?;
        self.store_pin(caller, new_pin).await
    }

    /// Open the Savings + Checking pair every new customer starts with.
    /// If the second insert fails, the first account is deactivated before
    /// the error is returned.
    pub async fn open_default_accounts(&self, owner: &str) -> Result<Vec<Account>, EngineError> {
        let mut opened: Vec<Account> = Vec::with_capacity(2);
        for kind in [AccountKind::Savings, AccountKind::Checking] {
            match self.insert_account(owner, kind).await {
                Ok(account) => opened.push(account),
                Err(e) => {
                    for account in &opened {
                        let id = account.id;
                        if let Err(undo) = self
                            .retry_busy(|| self.store.set_account_active(id, false))
                            .await
                        {
                            warn!(account = %id, "partially opened account left active: {undo}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    /// Admin: open an extra account for `owner`.
    pub async fn open_account(
        &self,
        caller: &Caller,
        owner: &str,
        kind: AccountKind,
    ) -> Result<Account, EngineError> {
        require_role(caller, Role::Admin, "opening accounts")?;
        self.insert_account(owner, kind).await
    }

    /// Admin: flip an account's active flag. Accounts are never deleted.
    pub async fn set_account_active(
        &self,
        caller: &Caller,
        id: AccountId,
        active: bool,
    ) -> Result<Account, EngineError> {
        require_role(caller, Role::Admin, "changing account status")?;
        let account = self
            .retry_busy(|| self.store.set_account_active(id, active))
            .await?;
        info!(account = %id, active, "account status changed");
        Ok(account)
    }

    /// An account the caller may see: their own, or any account for an admin.
    pub async fn account(&self, caller: &Caller, id: AccountId) -> Result<Account, EngineError> {
        let account = if caller.is_admin() {
            self.store.find_account(id).await?
        } else {
            self.store.get_account(id, &caller.identity).await?
        };
        account.ok_or_else(|| EngineError::NotFound(format!("account {id}")))
    }

    pub async fn account_by_number(
        &self,
        caller: &Caller,
        number: &str,
    ) -> Result<Account, EngineError> {
        self.store
            .get_account_by_number(number)
            .await?
            .filter(|a| caller.is_admin() || a.owner == caller.identity)
            .ok_or_else(|| EngineError::NotFound(format!("account {number}")))
    }

    /// The caller's accounts, ordered by id.
    pub async fn accounts(&self, caller: &Caller) -> Result<Vec<Account>, EngineError> {
        Ok(self
            .store
            .list_accounts_for_owner(&caller.identity)
            .await?)
    }

    pub async fn statement(
        &self,
        caller: &Caller,
        account: AccountId,
        period: StatementPeriod,
    ) -> Result<Statement, EngineError> {
        let account = self.account(caller, account).await?;
        let (from, until) = period.bounds()?;
        let transactions = self
            .store
            .list_transactions(&TransactionFilter {
                account: Some(account.id),
                from: Some(from),
                until: Some(until),
                ..TransactionFilter::default()
            })
            .await?;

        let (mut credits, mut debits) = (Amount::ZERO, Amount::ZERO);
        for tx in transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Completed)
        {
            if tx.kind.is_outgoing() && tx.from_account == account.id {
                debits += tx.amount;
            }
            if !tx.kind.is_outgoing() || tx.to_account == Some(account.id) {
                credits += tx.amount;
            }
        }

        Ok(Statement {
            account,
            period,
            from,
            until,
            transactions,
            credits,
            debits,
        })
    }

    /// Newest transactions across all of the caller's accounts.
    pub async fn recent_transactions(
        &self,
        caller: &Caller,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        let mut recent: Vec<TransactionRecord> = Vec::new();
        for account in self.accounts(caller).await? {
            let filter = TransactionFilter {
                newest_first: true,
                limit: Some(limit),
                ..TransactionFilter::for_account(account.id)
            };
            for tx in self.store.list_transactions(&filter).await? {
                if !recent.iter().any(|t| t.id == tx.id) {
                    recent.push(tx);
                }
            }
        }
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        recent.truncate(limit);
        Ok(recent)
    }
}

fn require_role(caller: &Caller, role: Role, action: &str) -> Result<(), EngineError> {
    if caller.role == role {
        Ok(())
    } else {
        Err(EngineError::Authorization(format!(
            "{action} requires the {role} role"
        )))
    }
}

/// Private API
impl TransferEngine {
    /// Small helper to log `execute` results
    fn log_result(
        op: &str,
        account: AccountId,
        amount: Amount,
        result: &Result<TransactionRecord, EngineError>,
    ) {
        match result {
            Ok(record) => {
                info!(
                    account = %account,
                    reference = %record.reference,
                    amount = %amount,
                    status = %record.status,
                    "{op} applied"
                );
            }
            Err(e) if e.is_incident() => {
                error!(
                    account = %account,
                    amount = %amount,
                    reason = %e,
                    "{op} failed"
                );
            }
            Err(e) => {
                info!(
                    account = %account,
                    amount = %amount,
                    reason = %e,
                    "{op} skipped"
                );
            }
        }
    }

    /// Preconditions in order, then one atomic posting:
    /// 1. source exists, belongs to the caller, is active
    /// 2. amount is positive and within the kind's bounds
    /// 3. transfers: destination resolves, is active, is not the source;
    ///    PIN-protected kinds: PIN is set and matches
    /// 4. transfers: source balance covers the amount
    async fn apply(
        &self,
        caller: &Caller,
        request: TransferRequest,
    ) -> Result<TransactionRecord, EngineError> {
        require_role(caller, Role::User, "moving money")?;
        let kind = request.kind;
        let amount = request.amount;

        let source = self
            .store
            .get_account(request.source, &caller.identity)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", request.source)))?;
        if !source.active {
            return Err(ValidationError::AccountInactive(source.id).into());
        }

        self.check_amount(kind, amount)?;
        check_metadata(kind, &request.metadata)?;

        let destination = if kind == TransactionKind::FundTransfer {
            Some(
                self.resolve_destination(&source, request.destination.as_deref())
                    .await?,
            )
        } else {
            None
        };
        if kind.requires_pin() {
            self.verify_pin(&source, request.pin.as_deref()).await?;
        }

        if kind.is_outgoing() && source.balance < amount {
            return Err(ValidationError::InsufficientFunds {
                available: source.balance,
                requested: amount,
            }
            .into());
        }

        let posting = self.build_posting(&source, destination.as_ref(), &request);
        let record = self.commit(posting).await?;
        self.notify_applied(&source, destination.as_ref(), &record)
            .await;
        Ok(record)
    }

    fn check_amount(&self, kind: TransactionKind, amount: Amount) -> Result<(), ValidationError> {
        if !amount.is_positive() {
            return Err(ValidationError::AmountNotPositive(amount));
        }
        let bounds = self.limits.bounds(kind);
        if amount < bounds.min || amount > bounds.max {
            return Err(ValidationError::AmountOutOfRange {
                kind,
                amount,
                min: bounds.min,
                max: bounds.max,
            });
        }
        Ok(())
    }

    async fn resolve_destination(
        &self,
        source: &Account,
        destination: Option<&str>,
    ) -> Result<Destination, EngineError> {
        let number = destination
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ValidationError::MissingDestination)?;
        if number == source.number {
            return Err(ValidationError::SelfTransfer.into());
        }

        match self.store.get_account_by_number(number).await? {
            Some(account) if account.id == source.id => Err(ValidationError::SelfTransfer.into()),
            Some(account) if !account.active => {
                Err(ValidationError::DestinationInactive(number.to_string()).into())
            }
            Some(account) => Ok(Destination {
                number: account.number.clone(),
                account: Some(account),
            }),
            None => {
                debug!(destination = number, "destination is outside the ledger");
                Ok(Destination {
                    account: None,
                    number: number.to_string(),
                })
            }
        }
    }

    async fn verify_pin(&self, account: &Account, pin: Option<&str>) -> Result<(), EngineError> {
        let stored = account
            .pin_hash
            .clone()
            .ok_or(ValidationError::PinNotSet)?;
        let pin = pin
            .filter(|p| !p.is_empty())
            .ok_or(ValidationError::PinRequired)?;
        if self.verify_secret(pin, stored).await? {
            Ok(())
        } else {
            Err(ValidationError::PinMismatch.into())
        }
    }

    fn build_posting(
        &self,
        source: &Account,
        destination: Option<&Destination>,
        request: &TransferRequest,
    ) -> Posting {
        let now = self.clock.now();
        let kind = request.kind;
        let meta = &request.metadata;
        let mut record = NewTransaction {
            from_account: source.id,
            to_account: Some(source.id),
            to_account_number: source.number.clone(),
            amount: request.amount,
            kind,
            status: TransactionStatus::Completed,
            description: String::new(),
            reference: reference::transaction_reference(kind, now),
            created_at: now,
        };

        let (debit, credit) = match (kind, destination) {
            (TransactionKind::FundTransfer, Some(dest)) => {
                let to = dest.account.as_ref().map(|a| a.id);
                record.to_account = to;
                record.to_account_number = dest.number.clone();
                record.description = meta
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Transfer to {}", dest.number));
                (Some(source.id), to)
            }
            (TransactionKind::CheckDeposit, _) => {
                record.status = TransactionStatus::Pending;
                record.description = format!(
                    "Check deposit of {} - Check #: {}",
                    request.amount,
                    meta.check_number.as_deref().unwrap_or_default()
                );
                if let Some(issuer) = &meta.check_issuer {
                    record.description.push_str(&format!(" ({issuer})"));
                }
                (None, None)
            }
            (TransactionKind::WireIncoming, _) => {
                record.description = format!(
                    "Wire from {} - {}",
                    meta.sender_name.as_deref().unwrap_or_default(),
                    meta.sender_bank.as_deref().unwrap_or_default()
                );
                if let Some(wire) = &meta.wire_reference {
                    record.description.push_str(&format!(" [{wire}]"));
                }
                (None, Some(source.id))
            }
            _ => {
                record.description = meta
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Cash deposit of {}", request.amount));
                (None, Some(source.id))
            }
        };

        Posting {
            debit,
            credit,
            record,
        }
    }

    /// Post with bounded retries on contention. A reference collision gets a fresh reference.
    async fn commit(&self, mut posting: Posting) -> Result<TransactionRecord, EngineError> {
        let mut attempt = 0;
        loop {
            match self.store.post(posting.clone()).await {
                Ok(record) => return Ok(record),
                Err(StoreError::Busy) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    debug!(attempt, "ledger busy, retrying posting");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(StoreError::DuplicateReference(reference))
                    if attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    debug!(%reference, "reference collision, regenerating");
                    posting.record.reference =
                        reference::transaction_reference(posting.record.kind, self.clock.now());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn retry_busy<T, F, Fut>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(StoreError::Busy) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    debug!(attempt, "ledger busy, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                result => return result.map_err(EngineError::from),
            }
        }
    }

    async fn settle_check(
        &self,
        id: TxId,
        settlement: Settlement,
    ) -> Result<TransactionRecord, EngineError> {
        let tx = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("transaction {id}")))?;
        if tx.kind != TransactionKind::CheckDeposit {
            return Err(ValidationError::NotACheckDeposit(id).into());
        }

        let result = self.retry_busy(|| self.store.settle(id, settlement)).await;
        match &result {
            Ok(record) => info!(
                tx = %id,
                reference = %record.reference,
                amount = %record.amount,
                status = %record.status,
                "check settled"
            ),
            Err(e) if e.is_incident() => error!(tx = %id, reason = %e, "check settlement failed"),
            Err(e) => info!(tx = %id, reason = %e, "check settlement skipped"),
        }
        let record = result?;

        if let Some(account) = self.store.find_account(record.from_account).await? {
            let (title, message) = match record.status {
                TransactionStatus::Completed => (
                    "Check Deposit Cleared",
                    format!(
                        "Your check deposit of {} ({}) has cleared and is now available.",
                        record.amount, record.reference
                    ),
                ),
                _ => (
                    "Check Deposit Rejected",
                    format!(
                        "Your check deposit of {} ({}) was rejected.",
                        record.amount, record.reference
                    ),
                ),
            };
            self.notify(&account.owner, title, message, record.id).await;
        }
        Ok(record)
    }

    fn check_new_pin(&self, new_pin: &str, confirm: &str) -> Result<(), ValidationError> {
        if new_pin.chars().count() < self.min_pin_length {
            return Err(ValidationError::PinTooShort(self.min_pin_length));
        }
        if new_pin != confirm {
            return Err(ValidationError::PinConfirmationMismatch);
        }
        Ok(())
    }

    async fn store_pin(&self, caller: &Caller, pin: &str) -> Result<usize, EngineError> {
        let hash = self.hash_secret(pin).await?;
        let updated = self
            .retry_busy(|| self.store.set_pin_hash(&caller.identity, &hash))
            .await?;
        if updated == 0 {
            return Err(EngineError::NotFound("active account".to_string()));
        }
        info!(owner = %caller.identity, accounts = updated, "transaction PIN updated");
        Ok(updated)
    }

    async fn hash_secret(&self, secret: &str) -> Result<String, EngineError> {
        let hasher = Arc::clone(&self.hasher);
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| EngineError::System(format!("hashing task failed: {e}")))
    }

    async fn verify_secret(&self, secret: &str, stored: String) -> Result<bool, EngineError> {
        let hasher = Arc::clone(&self.hasher);
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&secret, &stored))
            .await
            .map_err(|e| EngineError::System(format!("verification task failed: {e}")))
    }

    async fn insert_account(&self, owner: &str, kind: AccountKind) -> Result<Account, EngineError> {
        let mut attempt = 0;
        loop {
            let now = self.clock.now();
            let new = NewAccount {
                number: reference::account_number(kind, now),
                owner: owner.to_string(),
                kind,
                created_at: now,
            };
            match self.store.insert_account(new).await {
                Ok(account) => {
                    info!(
                        account = %account.id,
                        number = %account.number,
                        owner,
                        kind = %kind,
                        "account opened"
                    );
                    return Ok(account);
                }
                Err(StoreError::DuplicateAccountNumber(number))
                    if attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    debug!(%number, "account number collision, regenerating");
                }
                Err(StoreError::Busy) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn notify_applied(
        &self,
        source: &Account,
        destination: Option<&Destination>,
        record: &TransactionRecord,
    ) {
        match record.kind {
            TransactionKind::FundTransfer => {
                self.notify(
                    &source.owner,
                    "Transfer Completed",
                    format!(
                        "{} was sent to {} ({}).",
                        record.amount, record.to_account_number, record.reference
                    ),
                    record.id,
                )
                .await;
                if let Some(recipient) = destination
                    .and_then(|d| d.account.as_ref())
                    .filter(|a| a.owner != source.owner)
                {
                    self.notify(
                        &recipient.owner,
                        "Funds Received",
                        format!(
                            "{} was credited to {} ({}).",
                            record.amount, recipient.number, record.reference
                        ),
                        record.id,
                    )
                    .await;
                }
            }
            TransactionKind::CheckDeposit => {
                self.notify(
                    &source.owner,
                    "Check Deposit Pending",
                    format!(
                        "Your check deposit of {} ({}) is pending clearance.",
                        record.amount, record.reference
                    ),
                    record.id,
                )
                .await;
            }
            TransactionKind::CashDeposit | TransactionKind::WireIncoming => {
                self.notify(
                    &source.owner,
                    "Deposit Received",
                    format!(
                        "{} was credited to {} ({}).",
                        record.amount, source.number, record.reference
                    ),
                    record.id,
                )
                .await;
            }
        }
    }

    /// Fire and forget: a failed notification never undoes the money movement.
    async fn notify(&self, recipient: &str, title: &str, message: String, related: TxId) {
        let notification = NewNotification {
            recipient: recipient.to_string(),
            title: title.to_string(),
            message,
            category: NotificationCategory::Transaction,
            related_id: Some(related),
        };
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(recipient, reason = %e, "notification failed");
        }
    }
}

fn check_metadata(kind: TransactionKind, meta: &Metadata) -> Result<(), ValidationError> {
    let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.trim().is_empty());
    match kind {
        TransactionKind::CheckDeposit if !present(&meta.check_number) => {
            Err(ValidationError::MissingField("check number"))
        }
        TransactionKind::WireIncoming if !present(&meta.sender_name) => {
            Err(ValidationError::MissingField("sender name"))
        }
        TransactionKind::WireIncoming if !present(&meta.sender_bank) => {
            Err(ValidationError::MissingField("sender bank"))
        }
        _ => Ok(()),
    }
}
