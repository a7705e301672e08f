//! Core domain types for the ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Amount;

/// Account identifier, assigned by the store.
pub type AccountId = u64;

/// Transaction identifier, assigned by the store.
pub type TxId = u64;

/// Opaque identity identifier (owner of accounts, holder of a role).
pub type IdentityId = String;

/// Returned when a stored enum value cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// The role held by an identity. Exactly one per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Admin => "Admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownVariant::new("role", s)),
        }
    }
}

/// The authenticated party on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: IdentityId,
    pub role: Role,
}

impl Caller {
    pub fn new(identity: impl Into<IdentityId>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountKind {
    Savings,
    Checking,
}

impl AccountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Savings => "Savings",
            AccountKind::Checking => "Checking",
        }
    }

    /// Prefix used when generating account numbers.
    pub fn number_prefix(self) -> &'static str {
        match self {
            AccountKind::Savings => "SAV",
            AccountKind::Checking => "CHK",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "savings" | "sav" => Ok(AccountKind::Savings),
            "checking" | "chk" => Ok(AccountKind::Checking),
            _ => Err(UnknownVariant::new("account kind", s)),
        }
    }
}

/// A customer account. Balance is only mutated by the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub number: String,
    pub owner: IdentityId,
    pub kind: AccountKind,
    pub balance: Amount,
    pub active: bool,
    /// Hash of the transaction PIN; `None` until the owner sets one.
    pub pin_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An account about to be inserted (balance starts at zero, PIN unset).
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub number: String,
    pub owner: IdentityId,
    pub kind: AccountKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionKind {
    CashDeposit,
    CheckDeposit,
    WireIncoming,
    FundTransfer,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 4] = [
        TransactionKind::CashDeposit,
        TransactionKind::CheckDeposit,
        TransactionKind::WireIncoming,
        TransactionKind::FundTransfer,
    ];

    /// Storage code.
    pub fn code(self) -> &'static str {
        match self {
            TransactionKind::CashDeposit => "cash_deposit",
            TransactionKind::CheckDeposit => "check_deposit",
            TransactionKind::WireIncoming => "wire_incoming",
            TransactionKind::FundTransfer => "fund_transfer",
        }
    }

    /// Human label shown on statements.
    pub fn label(self) -> &'static str {
        match self {
            TransactionKind::CashDeposit => "Cash Deposit",
            TransactionKind::CheckDeposit => "Check Deposit",
            TransactionKind::WireIncoming => "Wire Transfer (Incoming)",
            TransactionKind::FundTransfer => "Fund Transfer",
        }
    }

    /// Outgoing kinds debit the source account.
    pub fn is_outgoing(self) -> bool {
        matches!(self, TransactionKind::FundTransfer)
    }

    pub fn requires_pin(self) -> bool {
        matches!(
            self,
            TransactionKind::FundTransfer | TransactionKind::WireIncoming
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|kind| kind.code() == s)
            .ok_or_else(|| UnknownVariant::new("transaction kind", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Completed => "Completed",
            TransactionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TransactionStatus::Pending),
            "Completed" => Ok(TransactionStatus::Completed),
            "Failed" => Ok(TransactionStatus::Failed),
            _ => Err(UnknownVariant::new("transaction status", s)),
        }
    }
}

/// An entry in the transaction history. Immutable except for `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: TxId,
    pub from_account: AccountId,
    /// `None` when the counterparty is outside the bank.
    pub to_account: Option<AccountId>,
    pub to_account_number: String,
    /// Always positive; direction follows from `kind`.
    pub amount: Amount,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub description: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Whether the record touches the given account on either side.
    pub fn involves(&self, account: AccountId) -> bool {
        self.from_account == account || self.to_account == Some(account)
    }
}

/// A transaction about to be inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from_account: AccountId,
    pub to_account: Option<AccountId>,
    pub to_account_number: String,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub description: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl NewTransaction {
    pub fn into_record(self, id: TxId) -> TransactionRecord {
        TransactionRecord {
            id,
            from_account: self.from_account,
            to_account: self.to_account,
            to_account_number: self.to_account_number,
            amount: self.amount,
            kind: self.kind,
            status: self.status,
            description: self.description,
            reference: self.reference,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kind_codes_round_trip() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.code().parse::<TransactionKind>(), Ok(kind));
        }
        assert!("wire".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn only_fund_transfer_is_outgoing() {
        assert!(TransactionKind::FundTransfer.is_outgoing());
        assert!(!TransactionKind::CashDeposit.is_outgoing());
        assert!(!TransactionKind::CheckDeposit.is_outgoing());
        assert!(!TransactionKind::WireIncoming.is_outgoing());
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!("User".parse::<Role>(), Ok(Role::User));
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn account_kind_accepts_prefix() {
        assert_eq!("SAV".parse::<AccountKind>(), Ok(AccountKind::Savings));
        assert_eq!("checking".parse::<AccountKind>(), Ok(AccountKind::Checking));
    }

    #[test]
    fn record_involves_both_sides() {
        let record = NewTransaction {
            from_account: 1,
            to_account: Some(2),
            to_account_number: "CHK1".into(),
            amount: Amount::from_units(5),
            kind: TransactionKind::FundTransfer,
            status: TransactionStatus::Completed,
            description: String::new(),
            reference: "TXN1".into(),
            created_at: Utc::now(),
        }
        .into_record(7);

        assert_eq!(record.id, 7);
        assert!(record.involves(1));
        assert!(record.involves(2));
        assert!(!record.involves(3));
    }
}
