//! Runtime configuration: defaults overridden by `BANK_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::Amount;
use crate::model::TransactionKind;

#[derive(Debug, Clone, Default)]
pub struct BankConfig {
    pub limits: LimitsConfig,
    pub throttle: ThrottleConfig,
    pub credentials: CredentialConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Inclusive amount bounds for one kind of money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBounds {
    pub min: Amount,
    pub max: Amount,
}

impl AmountBounds {
    pub const fn new(min: Amount, max: Amount) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub fund_transfer: AmountBounds,
    /// `max` is the cash deposit ceiling.
    pub cash_deposit: AmountBounds,
    pub check_deposit: AmountBounds,
    pub wire_incoming: AmountBounds,
}

impl LimitsConfig {
    pub fn bounds(&self, kind: TransactionKind) -> AmountBounds {
        match kind {
            TransactionKind::FundTransfer => self.fund_transfer,
            TransactionKind::CashDeposit => self.cash_deposit,
            TransactionKind::CheckDeposit => self.check_deposit,
            TransactionKind::WireIncoming => self.wire_incoming,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            fund_transfer: AmountBounds::new(Amount::from_cents(1), Amount::from_units(1_000_000)),
            cash_deposit: AmountBounds::new(Amount::from_units(1), Amount::from_units(50_000)),
            check_deposit: AmountBounds::new(Amount::from_units(1), Amount::from_units(100_000)),
            wire_incoming: AmountBounds::new(Amount::from_units(1), Amount::from_units(1_000_000)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Failed attempts that trigger a lock.
    pub max_failed_attempts: u32,
    pub lockout: chrono::Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            lockout: chrono::Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub pbkdf2_rounds: u32,
    pub min_pin_length: usize,
    pub min_password_length: usize,
    /// Seeded once at cold start when no admin exists.
    pub default_admin_username: String,
    pub default_admin_password: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            pbkdf2_rounds: 100_000,
            min_pin_length: 4,
            min_password_length: 8,
            default_admin_username: "admin".to_string(),
            default_admin_password: "Admin@123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => bail!("unknown store backend '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
    pub busy_timeout: Duration,
    /// Retries after a storage conflict before reporting it to the caller.
    pub max_conflict_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("ledger.db"),
            busy_timeout: Duration::from_millis(250),
            max_conflict_retries: 3,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default `tracing` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl BankConfig {
    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(max) = parse_var::<Amount>("BANK_CASH_DEPOSIT_CEILING")? {
            config.limits.cash_deposit.max = max;
        }
        if let Some(max) = parse_var::<Amount>("BANK_CHECK_DEPOSIT_CEILING")? {
            config.limits.check_deposit.max = max;
        }
        if let Some(max) = parse_var::<Amount>("BANK_WIRE_CEILING")? {
            config.limits.wire_incoming.max = max;
        }
        if let Some(max) = parse_var::<Amount>("BANK_TRANSFER_CEILING")? {
            config.limits.fund_transfer.max = max;
        }

        if let Some(attempts) = parse_var("BANK_MAX_FAILED_LOGINS")? {
            config.throttle.max_failed_attempts = attempts;
        }
        if let Some(minutes) = parse_var::<i64>("BANK_LOCKOUT_MINUTES")? {
            config.throttle.lockout = chrono::Duration::minutes(minutes);
        }

        if let Some(rounds) = parse_var("BANK_PBKDF2_ROUNDS")? {
            config.credentials.pbkdf2_rounds = rounds;
        }
        if let Ok(username) = env::var("BANK_ADMIN_USERNAME") {
            config.credentials.default_admin_username = username;
        }
        if let Ok(password) = env::var("BANK_ADMIN_PASSWORD") {
            config.credentials.default_admin_password = password;
        }

        if let Some(backend) = parse_var("BANK_STORE")? {
            config.store.backend = backend;
        }
        if let Ok(path) = env::var("BANK_SQLITE_PATH") {
            config.store.sqlite_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64>("BANK_BUSY_TIMEOUT_MS")? {
            config.store.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var("BANK_MAX_CONFLICT_RETRIES")? {
            config.store.max_conflict_retries = retries;
        }

        if let Ok(level) = env::var("BANK_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for kind in TransactionKind::ALL {
            let bounds = self.limits.bounds(kind);
            if !bounds.min.is_positive() {
                bail!("{kind} minimum must be positive, got {}", bounds.min);
            }
            if bounds.max < bounds.min {
                bail!(
                    "{kind} ceiling {} is below its minimum {}",
                    bounds.max,
                    bounds.min
                );
            }
        }
        if self.throttle.max_failed_attempts == 0 {
            bail!("max failed login attempts must be at least 1");
        }
        if self.throttle.lockout <= chrono::Duration::zero() {
            bail!("lockout duration must be positive");
        }
        if self.credentials.pbkdf2_rounds == 0 {
            bail!("pbkdf2 rounds must be at least 1");
        }
        if self.credentials.default_admin_password.len() < self.credentials.min_password_length {
            bail!("default admin password is shorter than the password minimum");
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {name} value '{raw}'")),
        Err(_) => Ok(None),
    }
}
