//! Identities, their role binding and their login-throttle state.
//!
//! [`IdentityProvider`] is what the login throttle and the session guard
//! depend on. [`Directory`] is the in-memory implementation, which also
//! owns registration, role changes, the default-admin bootstrap and the admin
//! credential change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CredentialConfig, ThrottleConfig};
use crate::credential::CredentialHasher;
use crate::model::{IdentityId, Role};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity {0} not found")]
    NotFound(String),

    #[error("username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("username must be {USERNAME_MIN} to {USERNAME_MAX} characters")]
    InvalidUsername,

    #[error("password must be at least {0} characters")]
    PasswordTooShort(usize),

    #[error("password must contain {0}")]
    WeakPassword(&'static str),

    #[error("password confirmation does not match")]
    PasswordConfirmationMismatch,

    #[error("current username or password is incorrect")]
    InvalidCredentials,

    #[error("only an admin can change admin credentials")]
    NotAdmin,

    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Failed-login bookkeeping attached to an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleState {
    pub failed_attempts: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

impl ThrottleState {
    /// Locked with an unexpired lock at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.locked_until.is_some_and(|until| until > now)
    }
}

/// What [`IdentityProvider::record_failure`] did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRecord {
    /// Counted; `attempts` failures so far, still below the limit.
    Counted { attempts: u32 },
    /// This failure reached the limit and locked the identity.
    Locked,
    /// A concurrent attempt locked the identity first; nothing was counted.
    AlreadyLocked,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: IdentityId,
    pub username: String,
    pub password_hash: String,
    /// `None` when the role binding was removed.
    pub role: Option<Role>,
    pub throttle: ThrottleState,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Case-insensitive username lookup.
    async fn find_by_name(&self, username: &str) -> Result<Option<Identity>, IdentityError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError>;

    async fn verify_password(
        &self,
        identity: &Identity,
        plaintext: &str,
    ) -> Result<bool, IdentityError>;

    /// Current role, read fresh on every call. `Ok(None)` if the identity
    /// exists without a role; `Err(NotFound)` if it does not exist.
    async fn role_of(&self, id: &str) -> Result<Option<Role>, IdentityError>;

    /// Count one failed login. The read, the increment and the lock
    /// decision happen as one step, so concurrent failures are all counted.
    /// An expired lock is cleared before counting.
    async fn record_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        limits: &ThrottleConfig,
    ) -> Result<FailureRecord, IdentityError>;

    /// Clear the failure count after a good password. Returns `false`, and
    /// changes nothing, if the identity holds an unexpired lock at `now`.
    async fn reset_throttle(&self, id: &str, now: DateTime<Utc>) -> Result<bool, IdentityError>;
}

/// Input for [`Directory::change_admin_credentials`].
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub current_username: String,
    pub current_password: String,
    pub new_username: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<IdentityId, Identity>,
    by_name: HashMap<String, IdentityId>,
}

impl Entries {
    fn get_mut(&mut self, id: &str) -> Result<&mut Identity, IdentityError> {
        self.by_id
            .get_mut(id)
            .ok_or_else(|| IdentityError::NotFound(id.to_string()))
    }
}

fn name_key(username: &str) -> String {
    username.trim().to_lowercase()
}

/// In-memory identity store.
pub struct Directory {
    entries: RwLock<Entries>,
    hasher: Arc<dyn CredentialHasher>,
    clock: Arc<dyn Clock>,
    min_password_length: usize,
}

impl Directory {
    pub fn new(
        hasher: Arc<dyn CredentialHasher>,
        clock: Arc<dyn Clock>,
        config: &CredentialConfig,
    ) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            hasher,
            clock,
            min_password_length: config.min_password_length,
        }
    }

    /// Register a new identity. The password must satisfy the registration policy.
    pub async fn create(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<Identity, IdentityError> {
        let username = username.trim();
        check_username(username)?;
        check_password_policy(password, self.min_password_length)?;
        if self.entries.read().await.by_name.contains_key(&name_key(username)) {
            return Err(IdentityError::UsernameTaken(username.to_string()));
        }

        let password_hash = self.hash(password).await?;
        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash,
            role: Some(role),
            throttle: ThrottleState::default(),
            created_at: self.clock.now(),
        };

        // re-check under the write lock, hashing happened without it
        let mut entries = self.entries.write().await;
        let key = name_key(username);
        if entries.by_name.contains_key(&key) {
            return Err(IdentityError::UsernameTaken(username.to_string()));
        }
        entries.by_name.insert(key, identity.id.clone());
        entries.by_id.insert(identity.id.clone(), identity.clone());
        info!(identity = %identity.id, username, role = %role, "identity created");
        Ok(identity)
    }

    /// Replace (or remove, with `None`) an identity's role. Sessions issued
    /// under the old role are rejected by the guard on their next request.
    pub async fn set_role(&self, id: &str, role: Option<Role>) -> Result<(), IdentityError> {
        let mut entries = self.entries.write().await;
        let identity = entries.get_mut(id)?;
        identity.role = role;
        info!(identity = %id, role = ?role, "role changed");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<Identity, IdentityError> {
        let mut entries = self.entries.write().await;
        let identity = entries
            .by_id
            .remove(id)
            .ok_or_else(|| IdentityError::NotFound(id.to_string()))?;
        entries.by_name.remove(&name_key(&identity.username));
        info!(identity = %id, "identity deleted");
        Ok(identity)
    }

    pub async fn has_role(&self, role: Role) -> bool {
        self.entries
            .read()
            .await
            .by_id
            .values()
            .any(|i| i.role == Some(role))
    }

    pub async fn list(&self) -> Vec<Identity> {
        let mut all: Vec<Identity> = self.entries.read().await.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    /// Seed the default admin once. A no-op when any admin already exists;
    /// an existing admin's password is never reset.
    pub async fn bootstrap_default_admin(
        &self,
        config: &CredentialConfig,
    ) -> Result<Option<Identity>, IdentityError> {
        if self.has_role(Role::Admin).await {
            info!("admin present, bootstrap skipped");
            return Ok(None);
        }
        let admin = self
            .create(
                &config.default_admin_username,
                &config.default_admin_password,
                Role::Admin,
            )
            .await?;
        info!(username = %admin.username, "default admin created");
        Ok(Some(admin))
    }

    /// Change the calling admin's username and password.
    pub async fn change_admin_credentials(
        &self,
        admin: &str,
        change: CredentialChange,
    ) -> Result<Identity, IdentityError> {
        let identity = self
            .find_by_id(admin)
            .await?
            .ok_or_else(|| IdentityError::NotFound(admin.to_string()))?;
        if identity.role != Some(Role::Admin) {
            return Err(IdentityError::NotAdmin);
        }
        if name_key(&change.current_username) != name_key(&identity.username)
            || !self
                .verify_password(&identity, &change.current_password)
                .await?
        {
            return Err(IdentityError::InvalidCredentials);
        }

        let new_username = change.new_username.trim();
        check_username(new_username)?;
        if change.new_password.chars().count() < self.min_password_length {
            return Err(IdentityError::PasswordTooShort(self.min_password_length));
        }
        if change.new_password != change.confirm_password {
            return Err(IdentityError::PasswordConfirmationMismatch);
        }
        let password_hash = self.hash(&change.new_password).await?;

        let mut entries = self.entries.write().await;
        let new_key = name_key(new_username);
        if entries
            .by_name
            .get(&new_key)
            .is_some_and(|owner| owner != &identity.id)
        {
            return Err(IdentityError::UsernameTaken(new_username.to_string()));
        }
        let old_key = name_key(&identity.username);
        let updated = {
            let stored = entries.get_mut(&identity.id)?;
            stored.username = new_username.to_string();
            stored.password_hash = password_hash;
            stored.clone()
        };
        entries.by_name.remove(&old_key);
        entries.by_name.insert(new_key, updated.id.clone());
        info!(identity = %updated.id, username = %updated.username, "admin credentials changed");
        Ok(updated)
    }

    async fn hash(&self, plaintext: &str) -> Result<String, IdentityError> {
        let hasher = Arc::clone(&self.hasher);
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for Directory {
    async fn find_by_name(&self, username: &str) -> Result<Option<Identity>, IdentityError> {
        let entries = self.entries.read().await;
        Ok(entries
            .by_name
            .get(&name_key(username))
            .and_then(|id| entries.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.entries.read().await.by_id.get(id).cloned())
    }

    async fn verify_password(
        &self,
        identity: &Identity,
        plaintext: &str,
    ) -> Result<bool, IdentityError> {
        let hasher = Arc::clone(&self.hasher);
        let plaintext = plaintext.to_string();
        let stored = identity.password_hash.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &stored))
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))
    }

    async fn role_of(&self, id: &str) -> Result<Option<Role>, IdentityError> {
        self.entries
            .read()
            .await
            .by_id
            .get(id)
            .map(|i| i.role)
            .ok_or_else(|| IdentityError::NotFound(id.to_string()))
    }

    async fn record_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        limits: &ThrottleConfig,
    ) -> Result<FailureRecord, IdentityError> {
        let mut entries = self.entries.write().await;
        let identity = entries.get_mut(id)?;
        let state = &mut identity.throttle;
        if state.is_locked_at(now) {
            return Ok(FailureRecord::AlreadyLocked);
        }
        if state.locked {
            *state = ThrottleState::default();
            info!(identity = %id, "lock expired, cleared");
        }

        state.failed_attempts += 1;
        state.last_failure = Some(now);
        if state.failed_attempts >= limits.max_failed_attempts {
            state.locked = true;
            state.locked_until = Some(now + limits.lockout);
            warn!(
                identity = %id,
                attempts = state.failed_attempts,
                "identity locked after failed logins"
            );
            return Ok(FailureRecord::Locked);
        }
        Ok(FailureRecord::Counted {
            attempts: state.failed_attempts,
        })
    }

    async fn reset_throttle(&self, id: &str, now: DateTime<Utc>) -> Result<bool, IdentityError> {
        let mut entries = self.entries.write().await;
        let state = &mut entries.get_mut(id)?.throttle;
        if state.is_locked_at(now) {
            return Ok(false);
        }
        *state = ThrottleState::default();
        Ok(true)
    }
}

fn check_username(username: &str) -> Result<(), IdentityError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(IdentityError::InvalidUsername);
    }
    Ok(())
}

/// Registration policy: minimum length, and at least one digit, one
/// lowercase, one uppercase and one non-alphanumeric character.
pub fn check_password_policy(password: &str, min_length: usize) -> Result<(), IdentityError> {
    if password.chars().count() < min_length {
        return Err(IdentityError::PasswordTooShort(min_length));
    }
    let rules: [(fn(char) -> bool, &'static str); 4] = [
        (|c| c.is_ascii_digit(), "a digit"),
        (char::is_lowercase, "a lowercase letter"),
        (char::is_uppercase, "an uppercase letter"),
        (|c| !c.is_alphanumeric(), "a non-alphanumeric character"),
    ];
    for (rule, what) in rules {
        if !password.chars().any(rule) {
            return Err(IdentityError::WeakPassword(what));
        }
    }
    Ok(())
}
