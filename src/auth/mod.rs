//! Authentication and per-request session integrity.
//!
//! [`LoginThrottle`] turns credentials into a [`Session`] (or a lockout);
//! [`SessionRoleGuard`] re-validates that session on every request.

use chrono::{DateTime, Utc};

use crate::model::{Caller, IdentityId, Role};

pub mod guard;
pub mod throttle;

pub use guard::{
    EntryPoint, GuardDecision, InvalidationReason, Redirect, RequestContext, RouteClass,
    SessionRoleGuard,
};
pub use throttle::{LoginError, LoginThrottle};

/// An authenticated session. `role` is a snapshot taken at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: IdentityId,
    pub username: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
}

impl Session {
    pub fn caller(&self) -> Caller {
        Caller::new(self.identity.clone(), self.role)
    }
}
