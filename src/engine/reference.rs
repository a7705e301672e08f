//! Human-readable identifiers: transaction references and account numbers.
//!
//! Both are a prefix, a timestamp and a four digit random suffix. They are
//! only practically unique; the store's UNIQUE constraints catch collisions
//! and the caller generates a fresh value.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::model::{AccountKind, TransactionKind};

fn suffix() -> u16 {
    rand::thread_rng().gen_range(1000..10_000)
}

/// `TXN` for transfers, `DEP` for everything credited to the caller, then
/// `yyyyMMddHHmmss` and the suffix.
pub fn transaction_reference(kind: TransactionKind, at: DateTime<Utc>) -> String {
    let prefix = if kind.is_outgoing() { "TXN" } else { "DEP" };
    format!("{prefix}{}{}", at.format("%Y%m%d%H%M%S"), suffix())
}

/// `SAV`/`CHK`, then `yyyymmdd` and the suffix.
pub fn account_number(kind: AccountKind, at: DateTime<Utc>) -> String {
    format!("{}{}{}", kind.number_prefix(), at.format("%Y%m%d"), suffix())
}
