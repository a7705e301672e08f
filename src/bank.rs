//! The bank: one handle over identities, sessions, money movement,
//! notifications, service requests and reports.
//!
//! Every [`Command`] runs behind the session-role guard. [`Bank::run`]
//! replays a scripted session from an async stream of [`Step`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::Amount;
use crate::auth::{
    GuardDecision, InvalidationReason, LoginError, LoginThrottle, Redirect, RequestContext,
    RouteClass, Session, SessionRoleGuard,
};
use crate::clock::{Clock, SystemClock};
use crate::config::BankConfig;
use crate::credential::Pbkdf2Hasher;
use crate::engine::{
    ClearingReport, EngineError, Statement, StatementPeriod, TransferEngine, TransferRequest,
};
use crate::identity::{CredentialChange, Directory, IdentityError, IdentityProvider};
use crate::model::{
    Account, AccountId, AccountKind, Caller, IdentityId, Role, TransactionRecord, TxId,
};
use crate::notify::{Inbox, Notification, NotificationId, NotifyError};
use crate::report::{Report, ReportError, ReportQuery, Reporter};
use crate::service::{CardAction, RequestId, ServiceDesk, ServiceError, ServiceRequest};
use crate::store::LedgerStore;

#[derive(Debug, Error)]
pub enum BankError {
    #[error("login required")]
    LoginRequired,

    #[error("session expired: {reason}")]
    SessionExpired {
        redirect: Redirect,
        reason: InvalidationReason,
    },

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("'{username}' has no {kind} account")]
    UnknownAccount { username: String, kind: AccountKind },

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// A request made on behalf of a logged-in session.
#[derive(Debug, Clone)]
pub enum Command {
    // customer side
    Execute(TransferRequest),
    SetPin {
        pin: String,
        confirm: String,
    },
    ChangePin {
        current: String,
        pin: String,
        confirm: String,
    },
    Accounts,
    Statement {
        account: AccountId,
        period: StatementPeriod,
    },
    RecentTransactions {
        limit: usize,
    },
    Notifications {
        include_read: bool,
    },
    MarkNotificationRead(NotificationId),
    MarkAllNotificationsRead,
    SubmitServiceRequest {
        request_type: String,
        description: String,
    },
    MyServiceRequests,

    // administration
    ClearCheck(TxId),
    RejectCheck(TxId),
    ClearPendingChecks,
    OpenAccount {
        owner: String,
        kind: AccountKind,
    },
    SetAccountActive {
        account: AccountId,
        active: bool,
    },
    SetRole {
        username: String,
        role: Option<Role>,
    },
    ChangeAdminCredentials(CredentialChange),
    AllServiceRequests,
    RespondServiceRequest {
        id: RequestId,
        response: String,
        action: Option<CardAction>,
    },
    MarkCardReady(RequestId),
    Report(ReportQuery),
}

impl Command {
    pub fn route(&self) -> RouteClass {
        match self {
            Command::Execute(_)
            | Command::SetPin { .. }
            | Command::ChangePin { .. }
            | Command::Accounts
            | Command::Statement { .. }
            | Command::RecentTransactions { .. }
            | Command::Notifications { .. }
            | Command::MarkNotificationRead(_)
            | Command::MarkAllNotificationsRead
            | Command::SubmitServiceRequest { .. }
            | Command::MyServiceRequests => RouteClass::UserSpace,
            _ => RouteClass::AdminSpace,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Transaction(TransactionRecord),
    Transactions(Vec<TransactionRecord>),
    Clearing(ClearingReport),
    PinUpdated { accounts: usize },
    Account(Account),
    Accounts(Vec<Account>),
    Statement(Statement),
    Notifications(Vec<Notification>),
    MarkedRead(usize),
    ServiceRequest(ServiceRequest),
    ServiceRequests(Vec<ServiceRequest>),
    Report(Report),
    Renamed { username: String },
    Done,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub identity: IdentityId,
    pub username: String,
    pub accounts: Vec<Account>,
}

/// One row of the final balance listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub owner: String,
    pub number: String,
    pub kind: AccountKind,
    pub balance: Amount,
    pub active: bool,
}

/// Names an account in a batch script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    /// The `kind` account of a registered user.
    Alias { username: String, kind: AccountKind },
    /// A raw account number, possibly at another bank.
    Number(String),
}

/// One scripted operation, performed as `user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub user: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Register {
        password: String,
    },
    Login {
        password: String,
    },
    Logout,
    SetPin {
        pin: String,
    },
    CashDeposit {
        account: AccountKind,
        amount: Amount,
    },
    CheckDeposit {
        account: AccountKind,
        amount: Amount,
        check_number: String,
    },
    Wire {
        account: AccountKind,
        amount: Amount,
        sender: String,
        bank: String,
        pin: String,
    },
    Transfer {
        account: AccountKind,
        to: AccountRef,
        amount: Amount,
        pin: String,
    },
    ClearChecks,
    SetRole {
        target: String,
        role: Option<Role>,
    },
    OpenAccount {
        owner: String,
        kind: AccountKind,
    },
    Deactivate {
        account: AccountRef,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Register { .. } => "register",
            Action::Login { .. } => "login",
            Action::Logout => "logout",
            Action::SetPin { .. } => "set_pin",
            Action::CashDeposit { .. } => "cash_deposit",
            Action::CheckDeposit { .. } => "check_deposit",
            Action::Wire { .. } => "wire",
            Action::Transfer { .. } => "transfer",
            Action::ClearChecks => "clear_checks",
            Action::SetRole { .. } => "set_role",
            Action::OpenAccount { .. } => "open_account",
            Action::Deactivate { .. } => "deactivate",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: usize,
    pub rejected: usize,
}

pub struct Bank {
    config: BankConfig,
    directory: Arc<Directory>,
    throttle: LoginThrottle,
    guard: SessionRoleGuard,
    engine: TransferEngine,
    inbox: Arc<Inbox>,
    desk: ServiceDesk,
    reporter: Reporter,
}

/// Public API
impl Bank {
    pub fn new(config: BankConfig, store: Arc<dyn LedgerStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: BankConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hasher = Arc::new(Pbkdf2Hasher::new(config.credentials.pbkdf2_rounds));
        let directory = Arc::new(Directory::new(
            hasher.clone(),
            clock.clone(),
            &config.credentials,
        ));
        let inbox = Arc::new(Inbox::new());
        Self {
            throttle: LoginThrottle::new(
                directory.clone(),
                clock.clone(),
                config.throttle.clone(),
            ),
            guard: SessionRoleGuard::new(directory.clone()),
            engine: TransferEngine::new(
                store.clone(),
                hasher,
                inbox.clone(),
                clock.clone(),
                &config,
            ),
            desk: ServiceDesk::new(inbox.clone(), clock),
            reporter: Reporter::new(store),
            directory,
            inbox,
            config,
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Seed the default admin if no admin exists yet.
    pub async fn bootstrap(&self) -> Result<(), BankError> {
        self.directory
            .bootstrap_default_admin(&self.config.credentials)
            .await?;
        Ok(())
    }

    /// Create a customer identity with a paired Savings and Checking account.
    pub async fn register(&self, username: &str, password: &str) -> Result<Registration, BankError> {
        let identity = self.directory.create(username, password, Role::User).await?;
        match self.engine.open_default_accounts(&identity.id).await {
            Ok(accounts) => {
                info!(identity = %identity.id, username = %identity.username, "register applied");
                Ok(Registration {
                    identity: identity.id,
                    username: identity.username,
                    accounts,
                })
            }
            Err(e) => {
                // no accounts means no usable customer
                self.directory.delete(&identity.id).await?;
                Err(e.into())
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, BankError> {
        Ok(self.throttle.login(username, password).await?)
    }

    pub fn logout(&self, ctx: &mut RequestContext) {
        if let Some(session) = ctx.session.take() {
            info!(identity = %session.identity, "logout applied");
        }
    }

    /// Run `command` for the session in `ctx`. The guard runs first and may
    /// drop the session.
    pub async fn handle(
        &self,
        ctx: &mut RequestContext,
        command: Command,
    ) -> Result<Outcome, BankError> {
        ctx.route = command.route();
        let caller = match self.guard.check(ctx).await? {
            GuardDecision::Proceed(caller) => caller,
            GuardDecision::Anonymous | GuardDecision::LoginRequired => {
                return Err(BankError::LoginRequired);
            }
            GuardDecision::Invalidated { redirect, reason } => {
                return Err(BankError::SessionExpired { redirect, reason });
            }
        };
        debug!(identity = %caller.identity, route = ?ctx.route, "dispatching command");
        self.dispatch(&caller, command).await
    }

    /// Mark approved cards whose ETA has passed as ready.
    pub async fn sweep_ready_cards(&self) -> Vec<RequestId> {
        self.desk.sweep_ready_cards().await
    }

    /// Run the ready-card sweep every `every` until the handle is aborted.
    pub fn spawn_card_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.sweep_ready_cards().await;
            }
        })
    }

    /// Replay a scripted session. Rejected steps are logged and skipped.
    pub async fn run(&self, mut steps: impl Stream<Item = Step> + Unpin) -> RunSummary {
        let mut sessions: HashMap<String, Session> = HashMap::new();
        let mut summary = RunSummary::default();
        while let Some(step) = steps.next().await {
            let op = step.action.name();
            match self.apply_step(&mut sessions, &step).await {
                Ok(()) => summary.applied += 1,
                Err(e) => {
                    summary.rejected += 1;
                    warn!(line = step.line, user = %step.user, op, "step rejected: {e}");
                }
            }
        }
        summary
    }

    /// Every account with its owner's username, sorted by owner then kind.
    pub async fn account_summaries(&self) -> Result<Vec<AccountSummary>, BankError> {
        let names: HashMap<IdentityId, String> = self
            .directory
            .list()
            .await
            .into_iter()
            .map(|identity| (identity.id, identity.username))
            .collect();
        let mut rows: Vec<AccountSummary> = self
            .engine
            .store()
            .list_accounts()
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .map(|account| AccountSummary {
                owner: names
                    .get(&account.owner)
                    .cloned()
                    .unwrap_or_else(|| account.owner.clone()),
                number: account.number,
                kind: account.kind,
                balance: account.balance,
                active: account.active,
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.owner, a.kind, &a.number).cmp(&(&b.owner, b.kind, &b.number))
        });
        Ok(rows)
    }
}

/// Private API
impl Bank {
    async fn dispatch(&self, caller: &Caller, command: Command) -> Result<Outcome, BankError> {
        let me = caller.identity.as_str();
        Ok(match command {
            Command::Execute(request) => {
                Outcome::Transaction(self.engine.execute(caller, request).await?)
            }
            Command::SetPin { pin, confirm } => Outcome::PinUpdated {
                accounts: self.engine.set_pin(caller, &pin, &confirm).await?,
            },
            Command::ChangePin {
                current,
                pin,
                confirm,
            } => Outcome::PinUpdated {
                accounts: self
                    .engine
                    .change_pin(caller, &current, &pin, &confirm)
                    .await?,
            },
            Command::Accounts => Outcome::Accounts(self.engine.accounts(caller).await?),
            Command::Statement { account, period } => {
                Outcome::Statement(self.engine.statement(caller, account, period).await?)
            }
            Command::RecentTransactions { limit } => {
                Outcome::Transactions(self.engine.recent_transactions(caller, limit).await?)
            }
            Command::Notifications { include_read } => {
                Outcome::Notifications(self.inbox.list(me, include_read).await)
            }
            Command::MarkNotificationRead(id) => {
                self.inbox.mark_read(me, id).await?;
                Outcome::MarkedRead(1)
            }
            Command::MarkAllNotificationsRead => {
                Outcome::MarkedRead(self.inbox.mark_all_read(me).await)
            }
            Command::SubmitServiceRequest {
                request_type,
                description,
            } => Outcome::ServiceRequest(
                self.desk
                    .submit(caller, &request_type, &description)
                    .await?,
            ),
            Command::MyServiceRequests => {
                Outcome::ServiceRequests(self.desk.list_own(caller).await)
            }

            Command::ClearCheck(id) => {
                Outcome::Transaction(self.engine.clear_check(caller, id).await?)
            }
            Command::RejectCheck(id) => {
                Outcome::Transaction(self.engine.reject_check(caller, id).await?)
            }
            Command::ClearPendingChecks => {
                Outcome::Clearing(self.engine.clear_pending_checks(caller).await?)
            }
            Command::OpenAccount { owner, kind } => {
                let owner = self.identity_named(&owner).await?;
                Outcome::Account(self.engine.open_account(caller, &owner, kind).await?)
            }
            Command::SetAccountActive { account, active } => {
                Outcome::Account(self.engine.set_account_active(caller, account, active).await?)
            }
            Command::SetRole { username, role } => {
                let target = self.identity_named(&username).await?;
                self.directory.set_role(&target, role).await?;
                info!(identity = %target, role = ?role, by = %caller.identity, "set_role applied");
                Outcome::Done
            }
            Command::ChangeAdminCredentials(change) => {
                let updated = self
                    .directory
                    .change_admin_credentials(me, change)
                    .await?;
                Outcome::Renamed {
                    username: updated.username,
                }
            }
            Command::AllServiceRequests => {
                Outcome::ServiceRequests(self.desk.list_all(caller).await?)
            }
            Command::RespondServiceRequest {
                id,
                response,
                action,
            } => Outcome::ServiceRequest(self.desk.respond(caller, id, &response, action).await?),
            Command::MarkCardReady(id) => {
                Outcome::ServiceRequest(self.desk.mark_card_ready(caller, id).await?)
            }
            Command::Report(query) => Outcome::Report(self.reporter.run(caller, query).await?),
        })
    }

    async fn apply_step(
        &self,
        sessions: &mut HashMap<String, Session>,
        step: &Step,
    ) -> Result<(), BankError> {
        let key = step.user.trim().to_lowercase();
        let command = match &step.action {
            Action::Register { password } => {
                self.register(&step.user, password).await?;
                return Ok(());
            }
            Action::Login { password } => {
                let session = self.login(&step.user, password).await?;
                sessions.insert(key, session);
                return Ok(());
            }
            Action::Logout => {
                let mut ctx = RequestContext::new(sessions.remove(&key), RouteClass::Public);
                self.logout(&mut ctx);
                return Ok(());
            }
            Action::SetPin { pin } => Command::SetPin {
                pin: pin.clone(),
                confirm: pin.clone(),
            },
            Action::CashDeposit { account, amount } => {
                let account = self.own_account(&step.user, *account).await?;
                Command::Execute(TransferRequest::cash_deposit(account.id, *amount))
            }
            Action::CheckDeposit {
                account,
                amount,
                check_number,
            } => {
                let account = self.own_account(&step.user, *account).await?;
                Command::Execute(TransferRequest::check_deposit(
                    account.id,
                    *amount,
                    check_number.clone(),
                    None,
                ))
            }
            Action::Wire {
                account,
                amount,
                sender,
                bank,
                pin,
            } => {
                let account = self.own_account(&step.user, *account).await?;
                Command::Execute(TransferRequest::wire_incoming(
                    account.id,
                    *amount,
                    sender.clone(),
                    bank.clone(),
                    pin.clone(),
                ))
            }
            Action::Transfer {
                account,
                to,
                amount,
                pin,
            } => {
                let source = self.own_account(&step.user, *account).await?;
                let destination = match to {
                    AccountRef::Alias { username, kind } => {
                        self.own_account(username, *kind).await?.number
                    }
                    AccountRef::Number(number) => number.clone(),
                };
                Command::Execute(TransferRequest::fund_transfer(
                    source.id,
                    destination,
                    *amount,
                    pin.clone(),
                ))
            }
            Action::ClearChecks => Command::ClearPendingChecks,
            Action::SetRole { target, role } => Command::SetRole {
                username: target.clone(),
                role: *role,
            },
            Action::OpenAccount { owner, kind } => Command::OpenAccount {
                owner: owner.clone(),
                kind: *kind,
            },
            Action::Deactivate { account } => {
                let id = match account {
                    AccountRef::Alias { username, kind } => {
                        self.own_account(username, *kind).await?.id
                    }
                    AccountRef::Number(number) => {
                        self.engine
                            .store()
                            .get_account_by_number(number)
                            .await
                            .map_err(EngineError::from)?
                            .ok_or_else(|| {
                                EngineError::NotFound(format!("account {number}"))
                            })?
                            .id
                    }
                };
                Command::SetAccountActive {
                    account: id,
                    active: false,
                }
            }
        };

        let mut ctx = RequestContext::new(sessions.remove(&key), command.route());
        let result = self.handle(&mut ctx, command).await;
        if let Some(session) = ctx.session {
            sessions.insert(key, session);
        }
        result.map(|_| ())
    }

    async fn identity_named(&self, username: &str) -> Result<IdentityId, BankError> {
        self.directory
            .find_by_name(username)
            .await?
            .map(|identity| identity.id)
            .ok_or_else(|| BankError::UnknownUser(username.to_string()))
    }

    /// First account of `kind` owned by `username`, by opening order.
    async fn own_account(&self, username: &str, kind: AccountKind) -> Result<Account, BankError> {
        let owner = self.identity_named(username).await?;
        self.engine
            .store()
            .list_accounts_for_owner(&owner)
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .find(|account| account.kind == kind)
            .ok_or_else(|| BankError::UnknownAccount {
                username: username.to_string(),
                kind,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tokio_stream::iter;

    use crate::auth::EntryPoint;
    use crate::clock::ManualClock;
    use crate::engine::ValidationError;
    use crate::store::MemoryLedger;

    fn config() -> BankConfig {
        let mut config = BankConfig::default();
        config.credentials.pbkdf2_rounds = 1_000;
        config
    }

    fn bank() -> Bank {
        Bank::new(config(), Arc::new(MemoryLedger::new()))
    }

    async fn logged_in(bank: &Bank, username: &str) -> RequestContext {
        bank.register(username, "Passw0rd!").await.unwrap();
        let session = bank.login(username, "Passw0rd!").await.unwrap();
        RequestContext::new(Some(session), RouteClass::UserSpace)
    }

    async fn admin(bank: &Bank) -> RequestContext {
        bank.bootstrap().await.unwrap();
        let session = bank.login("admin", "Admin@123").await.unwrap();
        RequestContext::new(Some(session), RouteClass::AdminSpace)
    }

    fn step(line: usize, user: &str, action: Action) -> Step {
        Step {
            line,
            user: user.to_string(),
            action,
        }
    }

    #[tokio::test]
    async fn register_opens_paired_accounts() {
        let bank = bank();
        let registration = bank.register("alice", "Passw0rd!").await.unwrap();
        let kinds: Vec<AccountKind> = registration.accounts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AccountKind::Savings, AccountKind::Checking]);
        assert!(registration.accounts[0].number.starts_with("SAV"));
        assert!(registration.accounts[1].number.starts_with("CHK"));
        assert!(
            registration
                .accounts
                .iter()
                .all(|a| a.balance == Amount::ZERO && a.pin_hash.is_none())
        );
    }

    #[tokio::test]
    async fn commands_need_a_session() {
        let bank = bank();
        let mut ctx = RequestContext::new(None, RouteClass::Public);
        let err = bank.handle(&mut ctx, Command::Accounts).await.unwrap_err();
        assert!(matches!(err, BankError::LoginRequired));
    }

    #[tokio::test]
    async fn deposit_and_pin_flow() {
        let bank = bank();
        let mut alice = logged_in(&bank, "alice").await;
        let Outcome::Accounts(accounts) = bank.handle(&mut alice, Command::Accounts).await.unwrap()
        else {
            panic!("expected accounts");
        };
        let savings = accounts[0].id;

        bank.handle(
            &mut alice,
            Command::Execute(TransferRequest::cash_deposit(
                savings,
                Amount::from_units(100),
            )),
        )
        .await
        .unwrap();

        let err = bank
            .handle(
                &mut alice,
                Command::Execute(TransferRequest::fund_transfer(
                    savings,
                    accounts[1].number.clone(),
                    Amount::from_units(10),
                    "1234",
                )),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BankError::Engine(EngineError::Validation(ValidationError::PinNotSet))
        ));

        bank.handle(
            &mut alice,
            Command::SetPin {
                pin: "1234".into(),
                confirm: "1234".into(),
            },
        )
        .await
        .unwrap();
        bank.handle(
            &mut alice,
            Command::Execute(TransferRequest::fund_transfer(
                savings,
                accounts[1].number.clone(),
                Amount::from_units(10),
                "1234",
            )),
        )
        .await
        .unwrap();

        let Outcome::Notifications(notes) = bank
            .handle(&mut alice, Command::Notifications { include_read: false })
            .await
            .unwrap()
        else {
            panic!("expected notifications");
        };
        assert!(!notes.is_empty());
    }

    #[tokio::test]
    async fn demotion_invalidates_the_next_request() {
        let bank = bank();
        let mut root = admin(&bank).await;
        bank.register("bob", "Passw0rd!").await.unwrap();
        bank.handle(
            &mut root,
            Command::SetRole {
                username: "bob".into(),
                role: Some(Role::Admin),
            },
        )
        .await
        .unwrap();

        let session = bank.login("bob", "Passw0rd!").await.unwrap();
        assert_eq!(session.role, Role::Admin);
        let mut bob = RequestContext::new(Some(session), RouteClass::AdminSpace);
        bank.handle(&mut bob, Command::AllServiceRequests)
            .await
            .unwrap();

        bank.handle(
            &mut root,
            Command::SetRole {
                username: "bob".into(),
                role: Some(Role::User),
            },
        )
        .await
        .unwrap();
        let err = bank
            .handle(&mut bob, Command::AllServiceRequests)
            .await
            .unwrap_err();
        match err {
            BankError::SessionExpired { redirect, .. } => {
                assert_eq!(redirect.to, EntryPoint::Login);
                assert_eq!(redirect.message, crate::auth::guard::SESSION_EXPIRED);
            }
            other => panic!("expected session expiry, got {other:?}"),
        }
        assert!(bob.session.is_none());
    }

    #[tokio::test]
    async fn admin_cannot_use_customer_routes() {
        let bank = bank();
        let mut root = admin(&bank).await;
        let err = bank.handle(&mut root, Command::Accounts).await.unwrap_err();
        assert!(matches!(err, BankError::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn bootstrap_twice_keeps_the_changed_password() {
        let bank = bank();
        let mut root = admin(&bank).await;
        bank.handle(
            &mut root,
            Command::ChangeAdminCredentials(CredentialChange {
                current_username: "admin".into(),
                current_password: "Admin@123".into(),
                new_username: "chief".into(),
                new_password: "N3w-Secret".into(),
                confirm_password: "N3w-Secret".into(),
            }),
        )
        .await
        .unwrap();

        bank.bootstrap().await.unwrap();
        assert!(bank.login("chief", "N3w-Secret").await.is_ok());
        assert!(bank.login("admin", "Admin@123").await.is_err());
    }

    #[tokio::test]
    async fn card_request_round_trip() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bank = Bank::with_clock(config(), Arc::new(MemoryLedger::new()), clock.clone());
        let mut alice = logged_in(&bank, "alice").await;
        let mut root = admin(&bank).await;

        let Outcome::ServiceRequest(request) = bank
            .handle(
                &mut alice,
                Command::SubmitServiceRequest {
                    request_type: crate::service::DEBIT_CARD_REQUEST.into(),
                    description: "please issue a debit card".into(),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a request");
        };
        bank.handle(
            &mut root,
            Command::RespondServiceRequest {
                id: request.id,
                response: "Approved".into(),
                action: Some(CardAction::Approve),
            },
        )
        .await
        .unwrap();

        clock.advance(ChronoDuration::days(14));
        assert_eq!(bank.sweep_ready_cards().await, vec![request.id]);
    }

    #[tokio::test]
    async fn run_skips_rejected_steps() {
        let bank = bank();
        let steps = vec![
            step(2, "alice", Action::Register { password: "Passw0rd!".into() }),
            step(3, "alice", Action::Login { password: "Passw0rd!".into() }),
            step(
                4,
                "alice",
                Action::CashDeposit {
                    account: AccountKind::Savings,
                    amount: Amount::from_units(100),
                },
            ),
            // no PIN yet
            step(
                5,
                "alice",
                Action::Transfer {
                    account: AccountKind::Savings,
                    to: AccountRef::Number("EXT-999".into()),
                    amount: Amount::from_units(10),
                    pin: "1234".into(),
                },
            ),
            step(6, "alice", Action::SetPin { pin: "1234".into() }),
            step(
                7,
                "alice",
                Action::Transfer {
                    account: AccountKind::Savings,
                    to: AccountRef::Alias {
                        username: "alice".into(),
                        kind: AccountKind::Checking,
                    },
                    amount: Amount::from_units(40),
                    pin: "1234".into(),
                },
            ),
            step(8, "alice", Action::Logout),
            step(
                9,
                "alice",
                Action::CashDeposit {
                    account: AccountKind::Savings,
                    amount: Amount::from_units(1),
                },
            ),
        ];

        let summary = bank.run(iter(steps)).await;
        assert_eq!(
            summary,
            RunSummary {
                applied: 6,
                rejected: 2
            }
        );

        let rows = bank.account_summaries().await.unwrap();
        let balances: Vec<(AccountKind, Amount)> =
            rows.iter().map(|r| (r.kind, r.balance)).collect();
        assert_eq!(
            balances,
            vec![
                (AccountKind::Savings, Amount::from_units(60)),
                (AccountKind::Checking, Amount::from_units(40)),
            ]
        );
        assert!(rows.iter().all(|r| r.owner == "alice"));
    }
}
