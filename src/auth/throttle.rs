//! Login throttle: failed-attempt counting with a self-expiring lock.
//!
//! The lock is lifted lazily by the next login attempt after it expires;
//! there is no background timer.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::Session;
use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::identity::{FailureRecord, IdentityError, IdentityProvider};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error(
        "invalid login attempt{}",
        .remaining
            .map(|n| format!(", {n} attempts remaining before account lock"))
            .unwrap_or_default()
    )]
    InvalidCredentials { remaining: Option<u32> },

    /// This attempt tripped the lock.
    #[error("account has been locked due to multiple failed login attempts")]
    LockedOut,

    /// Locked by earlier attempts; credentials were not evaluated.
    #[error("account is locked due to multiple failed login attempts, try again later")]
    Locked,

    #[error("account has no role assigned")]
    NoRole,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

pub struct LoginThrottle {
    identities: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
}

impl LoginThrottle {
    pub fn new(
        identities: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            identities,
            clock,
            config,
        }
    }

    /// Authenticate `username` and issue a session capturing its current role.
    ///
    /// Counting and the lock decision are delegated to the identity provider
    /// so concurrent attempts against one identity cannot lose updates.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, LoginError> {
        let Some(identity) = self.identities.find_by_name(username).await? else {
            info!(username, "login skipped: unknown identity");
            return Err(LoginError::InvalidCredentials { remaining: None });
        };
        let now = self.clock.now();

        if identity.throttle.is_locked_at(now) {
            info!(identity = %identity.id, "login skipped: locked");
            return Err(LoginError::Locked);
        }

        if self.identities.verify_password(&identity, password).await? {
            // a concurrent failure may have locked the identity meanwhile
            if !self.identities.reset_throttle(&identity.id, now).await? {
                info!(identity = %identity.id, "login skipped: locked");
                return Err(LoginError::Locked);
            }
            let role = identity.role.ok_or(LoginError::NoRole)?;
            info!(identity = %identity.id, role = %role, "login applied");
            return Ok(Session {
                identity: identity.id,
                username: identity.username,
                role,
                issued_at: now,
            });
        }

        match self
            .identities
            .record_failure(&identity.id, now, &self.config)
            .await?
        {
            FailureRecord::Counted { attempts } => {
                info!(identity = %identity.id, attempts, "login skipped: bad password");
                Err(LoginError::InvalidCredentials {
                    remaining: Some(self.config.max_failed_attempts - attempts),
                })
            }
            FailureRecord::Locked => Err(LoginError::LockedOut),
            FailureRecord::AlreadyLocked => {
                info!(identity = %identity.id, "login skipped: locked");
                Err(LoginError::Locked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::clock::ManualClock;
    use crate::config::CredentialConfig;
    use crate::credential::Pbkdf2Hasher;
    use crate::identity::Directory;
    use crate::model::Role;

    struct Fixture {
        clock: Arc<ManualClock>,
        directory: Arc<Directory>,
        throttle: LoginThrottle,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory = Arc::new(Directory::new(
            Arc::new(Pbkdf2Hasher::new(1_000)),
            clock.clone(),
            &CredentialConfig::default(),
        ));
        directory
            .create("alice", "Passw0rd!", Role::User)
            .await
            .unwrap();
        let throttle = LoginThrottle::new(directory.clone(), clock.clone(), ThrottleConfig::default());
        Fixture {
            clock,
            directory,
            throttle,
        }
    }

    async fn failures(fx: &Fixture) -> u32 {
        fx.directory
            .find_by_name("alice")
            .await
            .unwrap()
            .unwrap()
            .throttle
            .failed_attempts
    }

    #[tokio::test]
    async fn successful_login_captures_role() {
        let fx = fixture().await;
        let session = fx.throttle.login("alice", "Passw0rd!").await.unwrap();
        assert_eq!(session.role, Role::User);
        assert_eq!(session.username, "alice");
    }

    #[tokio::test]
    async fn unknown_user_is_generic_failure() {
        let fx = fixture().await;
        assert_eq!(
            fx.throttle.login("nobody", "x").await.unwrap_err(),
            LoginError::InvalidCredentials { remaining: None }
        );
    }

    #[tokio::test]
    async fn failures_count_down_then_lock() {
        let fx = fixture().await;
        assert_eq!(
            fx.throttle.login("alice", "wrong").await.unwrap_err(),
            LoginError::InvalidCredentials { remaining: Some(2) }
        );
        assert_eq!(
            fx.throttle.login("alice", "wrong").await.unwrap_err(),
            LoginError::InvalidCredentials { remaining: Some(1) }
        );
        assert_eq!(
            fx.throttle.login("alice", "wrong").await.unwrap_err(),
            LoginError::LockedOut
        );

        // correct password is still rejected while locked
        fx.clock.advance(Duration::minutes(29));
        assert_eq!(
            fx.throttle.login("alice", "Passw0rd!").await.unwrap_err(),
            LoginError::Locked
        );

        fx.clock.advance(Duration::minutes(1));
        fx.throttle.login("alice", "Passw0rd!").await.unwrap();
        assert_eq!(failures(&fx).await, 0);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let fx = fixture().await;
        fx.throttle.login("alice", "wrong").await.unwrap_err();
        fx.throttle.login("alice", "wrong").await.unwrap_err();
        assert_eq!(failures(&fx).await, 2);

        fx.throttle.login("alice", "Passw0rd!").await.unwrap();
        assert_eq!(failures(&fx).await, 0);

        // a fresh run of failures starts from zero
        assert_eq!(
            fx.throttle.login("alice", "wrong").await.unwrap_err(),
            LoginError::InvalidCredentials { remaining: Some(2) }
        );
    }

    #[tokio::test]
    async fn wrong_password_after_expiry_starts_a_new_count() {
        let fx = fixture().await;
        for _ in 0..3 {
            fx.throttle.login("alice", "wrong").await.unwrap_err();
        }
        fx.clock.advance(Duration::minutes(31));

        assert_eq!(
            fx.throttle.login("alice", "wrong").await.unwrap_err(),
            LoginError::InvalidCredentials { remaining: Some(2) }
        );
    }

    #[tokio::test]
    async fn identity_without_role_cannot_log_in() {
        let fx = fixture().await;
        let alice = fx.directory.find_by_name("alice").await.unwrap().unwrap();
        fx.directory.set_role(&alice.id, None).await.unwrap();

        assert_eq!(
            fx.throttle.login("alice", "Passw0rd!").await.unwrap_err(),
            LoginError::NoRole
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bad_logins_all_count_toward_the_lock() {
        let fx = fixture().await;
        let throttle = Arc::new(fx.throttle);
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move { throttle.login("alice", "wrong").await })
            })
            .collect();

        let mut tripped = 0;
        for task in tasks {
            match task.await.unwrap().unwrap_err() {
                LoginError::LockedOut => tripped += 1,
                LoginError::Locked | LoginError::InvalidCredentials { remaining: Some(_) } => {}
                other => panic!("unexpected login error: {other:?}"),
            }
        }
        assert_eq!(tripped, 1);

        let alice = fx.directory.find_by_name("alice").await.unwrap().unwrap();
        assert!(alice.throttle.locked);
        assert_eq!(alice.throttle.failed_attempts, 3);
        assert_eq!(
            throttle.login("alice", "Passw0rd!").await.unwrap_err(),
            LoginError::Locked
        );
    }

    #[tokio::test]
    async fn good_password_does_not_undo_a_lock_set_meanwhile() {
        let fx = fixture().await;
        let alice = fx.directory.find_by_name("alice").await.unwrap().unwrap();
        let now = fx.clock.now();
        let limits = ThrottleConfig::default();
        for _ in 0..3 {
            fx.directory
                .record_failure(&alice.id, now, &limits)
                .await
                .unwrap();
        }

        // a login that read the state before the lock still may not reset it
        assert!(!fx.directory.reset_throttle(&alice.id, now).await.unwrap());
        assert!(
            fx.directory
                .find_by_id(&alice.id)
                .await
                .unwrap()
                .unwrap()
                .throttle
                .locked
        );
    }
}
