//! Service-request desk.
//!
//! Customers file requests (cheque books, statements, debit cards, ...) and
//! admins respond. Debit card requests carry a card lifecycle:
//! pending -> approved (with an ETA) -> ready, or pending -> rejected.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::model::{Caller, IdentityId, Role};
use crate::notify::{NewNotification, NotificationCategory, NotificationSink};

pub type RequestId = u64;

pub const DEBIT_CARD_REQUEST: &str = "Debit Card Request";

const MAX_PENDING_PER_OWNER: usize = 5;
const MIN_DESCRIPTION: usize = 10;
const MAX_DESCRIPTION: usize = 500;
const MAX_TYPE: usize = 50;
const MAX_RESPONSE: usize = 200;
const CARD_ETA_BUSINESS_DAYS: u32 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),

    #[error("request type is required (at most {MAX_TYPE} characters)")]
    InvalidType,

    #[error("description must be {MIN_DESCRIPTION} to {MAX_DESCRIPTION} characters")]
    InvalidDescription,

    #[error("response must be at most {MAX_RESPONSE} characters")]
    ResponseTooLong,

    #[error("at most {MAX_PENDING_PER_OWNER} requests may be pending at once")]
    TooManyPending,

    #[error("service request {0} not found")]
    NotFound(RequestId),

    #[error("service request {0} was already responded to")]
    AlreadyResponded(RequestId),

    #[error("service request {0} is not an approved card request")]
    NotApprovedCard(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Responded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Pending,
    Approved,
    Rejected,
    Ready,
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CardStatus::Pending => "pending",
            CardStatus::Approved => "approved",
            CardStatus::Rejected => "rejected",
            CardStatus::Ready => "ready",
        })
    }
}

/// Admin decision on a debit card request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub owner: IdentityId,
    pub request_type: String,
    pub description: String,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    /// Only set on debit card requests.
    pub card_status: Option<CardStatus>,
    pub card_eta: Option<DateTime<Utc>>,
}

impl ServiceRequest {
    pub fn is_card_request(&self) -> bool {
        self.request_type == DEBIT_CARD_REQUEST
    }
}

#[derive(Default)]
struct Requests {
    next_id: RequestId,
    rows: Vec<ServiceRequest>,
}

impl Requests {
    fn get_mut(&mut self, id: RequestId) -> Result<&mut ServiceRequest, ServiceError> {
        self.rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(ServiceError::NotFound(id))
    }
}

pub struct ServiceDesk {
    requests: Mutex<Requests>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl ServiceDesk {
    pub fn new(notifier: Arc<dyn NotificationSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: Mutex::new(Requests::default()),
            notifier,
            clock,
        }
    }

    pub async fn submit(
        &self,
        caller: &Caller,
        request_type: &str,
        description: &str,
    ) -> Result<ServiceRequest, ServiceError> {
        if caller.role != Role::User {
            return Err(ServiceError::NotAuthorized("only customers file service requests"));
        }
        let request_type = request_type.trim();
        if request_type.is_empty() || request_type.chars().count() > MAX_TYPE {
            return Err(ServiceError::InvalidType);
        }
        let description = description.trim();
        let len = description.chars().count();
        if !(MIN_DESCRIPTION..=MAX_DESCRIPTION).contains(&len) {
            return Err(ServiceError::InvalidDescription);
        }

        let mut requests = self.requests.lock().await;
        let pending = requests
            .rows
            .iter()
            .filter(|r| r.owner == caller.identity && r.status == RequestStatus::Pending)
            .count();
        if pending >= MAX_PENDING_PER_OWNER {
            return Err(ServiceError::TooManyPending);
        }

        requests.next_id += 1;
        let request = ServiceRequest {
            id: requests.next_id,
            owner: caller.identity.clone(),
            request_type: request_type.to_string(),
            description: description.to_string(),
            status: RequestStatus::Pending,
            submitted_at: self.clock.now(),
            response: None,
            responded_at: None,
            card_status: (request_type == DEBIT_CARD_REQUEST).then_some(CardStatus::Pending),
            card_eta: None,
        };
        requests.rows.push(request.clone());
        info!(request = request.id, owner = %request.owner, kind = %request.request_type, "service request submitted");
        Ok(request)
    }

    /// The caller's requests, newest first.
    pub async fn list_own(&self, caller: &Caller) -> Vec<ServiceRequest> {
        self.sorted(|r| r.owner == caller.identity).await
    }

    /// Admin: every request, newest first.
    pub async fn list_all(&self, caller: &Caller) -> Result<Vec<ServiceRequest>, ServiceError> {
        require_admin(caller)?;
        Ok(self.sorted(|_| true).await)
    }

    /// Admin: answer a pending request. `action` decides a debit card request.
    pub async fn respond(
        &self,
        caller: &Caller,
        id: RequestId,
        response: &str,
        action: Option<CardAction>,
    ) -> Result<ServiceRequest, ServiceError> {
        require_admin(caller)?;
        let response = response.trim();
        if response.chars().count() > MAX_RESPONSE {
            return Err(ServiceError::ResponseTooLong);
        }
        let now = self.clock.now();

        let updated = {
            let mut requests = self.requests.lock().await;
            let request = requests.get_mut(id)?;
            if request.status != RequestStatus::Pending {
                return Err(ServiceError::AlreadyResponded(id));
            }
            request.status = RequestStatus::Responded;
            request.response = Some(response.to_string());
            request.responded_at = Some(now);
            if request.is_card_request() {
                match action {
                    Some(CardAction::Approve) => {
                        request.card_status = Some(CardStatus::Approved);
                        request.card_eta = Some(add_business_days(now, CARD_ETA_BUSINESS_DAYS));
                    }
                    Some(CardAction::Reject) => request.card_status = Some(CardStatus::Rejected),
                    None => {}
                }
            }
            request.clone()
        };
        info!(request = id, card = ?updated.card_status, "service request responded");

        let notification = match (updated.is_card_request(), updated.card_status) {
            (true, Some(CardStatus::Approved)) => NewNotification {
                recipient: updated.owner.clone(),
                title: "Debit Card Request Approved".to_string(),
                message: format!(
                    "Your debit card request was approved. Expected arrival: {}.",
                    updated
                        .card_eta
                        .map(|eta| eta.format("%Y-%m-%d").to_string())
                        .unwrap_or_default()
                ),
                category: NotificationCategory::CardRequest,
                related_id: Some(id),
            },
            (true, Some(CardStatus::Rejected)) => NewNotification {
                recipient: updated.owner.clone(),
                title: "Debit Card Request Rejected".to_string(),
                message: format!("Your debit card request was rejected: {response}"),
                category: NotificationCategory::CardRequest,
                related_id: Some(id),
            },
            _ => NewNotification {
                recipient: updated.owner.clone(),
                title: format!("Response to {}", updated.request_type),
                message: format!(
                    "Your {} request has been responded to: {response}",
                    updated.request_type
                ),
                category: NotificationCategory::ServiceRequest,
                related_id: Some(id),
            },
        };
        self.notify(notification).await;
        Ok(updated)
    }

    /// Admin: mark an approved card as ready for pickup.
    pub async fn mark_card_ready(
        &self,
        caller: &Caller,
        id: RequestId,
    ) -> Result<ServiceRequest, ServiceError> {
        require_admin(caller)?;
        let updated = {
            let mut requests = self.requests.lock().await;
            let request = requests.get_mut(id)?;
            if !request.is_card_request() || request.card_status != Some(CardStatus::Approved) {
                return Err(ServiceError::NotApprovedCard(id));
            }
            request.card_status = Some(CardStatus::Ready);
            request.clone()
        };
        info!(request = id, "card marked ready");
        self.notify(card_ready(&updated)).await;
        Ok(updated)
    }

    /// Mark every approved card whose ETA has passed as ready and notify its
    /// owner. Each card is handled on its own; returns the ids marked.
    pub async fn sweep_ready_cards(&self) -> Vec<RequestId> {
        let now = self.clock.now();
        let due: Vec<RequestId> = {
            let requests = self.requests.lock().await;
            requests
                .rows
                .iter()
                .filter(|r| {
                    r.card_status == Some(CardStatus::Approved)
                        && r.card_eta.is_some_and(|eta| eta <= now)
                })
                .map(|r| r.id)
                .collect()
        };

        let mut marked = Vec::new();
        for id in due {
            let updated = {
                let mut requests = self.requests.lock().await;
                match requests.get_mut(id) {
                    Ok(r) if r.card_status == Some(CardStatus::Approved) => {
                        r.card_status = Some(CardStatus::Ready);
                        r.clone()
                    }
                    // changed since the scan
                    _ => continue,
                }
            };
            self.notify(card_ready(&updated)).await;
            marked.push(id);
        }
        if !marked.is_empty() {
            info!(cards = marked.len(), "ready card sweep finished");
        }
        marked
    }

    async fn sorted(&self, keep: impl Fn(&ServiceRequest) -> bool) -> Vec<ServiceRequest> {
        let requests = self.requests.lock().await;
        let mut list: Vec<ServiceRequest> =
            requests.rows.iter().filter(|r| keep(r)).cloned().collect();
        list.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        list
    }

    async fn notify(&self, notification: NewNotification) {
        let recipient = notification.recipient.clone();
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(%recipient, reason = %e, "notification failed");
        }
    }
}

fn require_admin(caller: &Caller) -> Result<(), ServiceError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::NotAuthorized("admin only"))
    }
}

fn card_ready(request: &ServiceRequest) -> NewNotification {
    NewNotification {
        recipient: request.owner.clone(),
        title: "Debit Card Ready".to_string(),
        message: "Your debit card is ready for pickup at your branch.".to_string(),
        category: NotificationCategory::CardRequest,
        related_id: Some(request.id),
    }
}

/// `start` plus `days` weekdays; Saturdays and Sundays are skipped.
pub fn add_business_days(start: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let mut at = start;
    let mut left = days;
    while left > 0 {
        at += Duration::days(1);
        if !matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            left -= 1;
        }
    }
    at
}
