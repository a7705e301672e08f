//! Session-role guard.
//!
//! Runs before every handler. It re-reads the identity's current role and
//! compares it with the role captured in the session. Any drift, a missing
//! identity, a missing role or a cross-role route invalidates the session:
//! the context loses its session and the caller is redirected to the entry
//! point for the identity's current role with a `session_expired` signal.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Session;
use crate::identity::{IdentityError, IdentityProvider};
use crate::model::{Caller, Role};

/// Signal carried on every invalidation redirect.
pub const SESSION_EXPIRED: &str = "session_expired";

/// Which side of the application a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Login, registration, landing pages.
    Public,
    /// Dashboard, transactions, deposits, service requests, profile, statements.
    UserSpace,
    /// Administration.
    AdminSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// Customer login page.
    Login,
    /// Administration landing page.
    AdminLogin,
}

impl EntryPoint {
    fn for_role(role: Option<Role>) -> Self {
        match role {
            Some(Role::Admin) => EntryPoint::AdminLogin,
            _ => EntryPoint::Login,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub to: EntryPoint,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    IdentityMissing,
    NoRole,
    RoleChanged { was: Role, now: Role },
    CrossRole { role: Role, route: RouteClass },
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::IdentityMissing => f.write_str("identity no longer exists"),
            InvalidationReason::NoRole => f.write_str("identity has no role"),
            InvalidationReason::RoleChanged { was, now } => {
                write!(f, "role changed from {was} to {now}")
            }
            InvalidationReason::CrossRole { role, route } => {
                write!(f, "{role} session used on {route:?} route")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// No session on a public route.
    Anonymous,
    /// No session on a protected route.
    LoginRequired,
    /// Session is valid; run the handler as this caller.
    Proceed(Caller),
    /// Session was discarded.
    Invalidated {
        redirect: Redirect,
        reason: InvalidationReason,
    },
}

/// Explicit per-request state handed to the guard and then to the handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session: Option<Session>,
    pub route: RouteClass,
}

impl RequestContext {
    pub fn new(session: Option<Session>, route: RouteClass) -> Self {
        Self { session, route }
    }
}

pub struct SessionRoleGuard {
    identities: Arc<dyn IdentityProvider>,
}

impl SessionRoleGuard {
    pub fn new(identities: Arc<dyn IdentityProvider>) -> Self {
        Self { identities }
    }

    /// Decide whether the request may proceed. Clears `ctx.session` on invalidation.
    pub async fn check(&self, ctx: &mut RequestContext) -> Result<GuardDecision, IdentityError> {
        let Some(session) = &ctx.session else {
            return Ok(match ctx.route {
                RouteClass::Public => GuardDecision::Anonymous,
                _ => GuardDecision::LoginRequired,
            });
        };

        let current = match self.identities.role_of(&session.identity).await {
            Ok(role) => role,
            Err(IdentityError::NotFound(_)) => {
                return Ok(Self::invalidate(ctx, None, InvalidationReason::IdentityMissing));
            }
            Err(e) => return Err(e),
        };

        let reason = match current {
            None => Some(InvalidationReason::NoRole),
            Some(now) if now != session.role => Some(InvalidationReason::RoleChanged {
                was: session.role,
                now,
            }),
            Some(role @ Role::User) if ctx.route == RouteClass::AdminSpace => {
                Some(InvalidationReason::CrossRole {
                    role,
                    route: ctx.route,
                })
            }
            Some(role @ Role::Admin) if ctx.route == RouteClass::UserSpace => {
                Some(InvalidationReason::CrossRole {
                    role,
                    route: ctx.route,
                })
            }
            Some(_) => None,
        };

        match reason {
            Some(reason) => Ok(Self::invalidate(ctx, current, reason)),
            None => {
                debug!(identity = %session.identity, route = ?ctx.route, "session valid");
                Ok(GuardDecision::Proceed(session.caller()))
            }
        }
    }

    fn invalidate(
        ctx: &mut RequestContext,
        current: Option<Role>,
        reason: InvalidationReason,
    ) -> GuardDecision {
        if let Some(session) = ctx.session.take() {
            warn!(
                identity = %session.identity,
                route = ?ctx.route,
                reason = %reason,
                "session invalidated"
            );
        }
        GuardDecision::Invalidated {
            redirect: Redirect {
                to: EntryPoint::for_role(current),
                message: SESSION_EXPIRED,
            },
            reason,
        }
    }
}
