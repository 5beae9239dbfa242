//! Notification module: customer messages, deduplicated by key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{FaultOutcome, FaultPlan, apply_delay};
use crate::lock::{read, write};

/// Errors returned by the notification module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("Notification has no recipient")]
    MissingRecipient,

    #[error("Notification rejected: {0}")]
    Rejected(String),

    #[error("Notification provider unavailable: {0}")]
    Unavailable(String),
}

impl NotificationError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, NotificationError::Unavailable(_))
    }
}

/// A message to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub template: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub recipient: String,
    pub template: String,
    pub data: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Trait for sending notifications.
///
/// Sent messages cannot be recalled, so there is no undo operation.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Sends a message once per `dedup_key`; later calls return the first result.
    async fn send(
        &self,
        dedup_key: &str,
        request: NotificationRequest,
    ) -> Result<Notification, NotificationError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: HashMap<String, Notification>,
    next_id: u32,
    send_calls: usize,
    send_faults: FaultPlan,
}

/// In-memory notification service that keeps every sent message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the provider to reject messages.
    pub fn set_fail_on_send(&self, fail: bool) {
        write(&self.state).send_faults.set_reject(fail);
    }

    /// Makes the next `times` send calls fail with a transient error.
    pub fn set_unavailable_on_send(&self, times: u32) {
        write(&self.state).send_faults.set_unavailable(times);
    }

    /// Delays every send call.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        write(&self.state).send_faults.set_delay(delay);
    }

    /// Returns the number of distinct messages sent.
    pub fn sent_count(&self) -> usize {
        read(&self.state).sent.len()
    }

    /// Returns the messages sent to a recipient.
    pub fn sent_to(&self, recipient: &str) -> Vec<Notification> {
        read(&self.state)
            .sent
            .values()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }

    /// Number of send calls received, including failed and deduplicated ones.
    pub fn send_calls(&self) -> usize {
        read(&self.state).send_calls
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send(
        &self,
        dedup_key: &str,
        request: NotificationRequest,
    ) -> Result<Notification, NotificationError> {
        let (outcome, delay) = {
            let mut state = write(&self.state);
            state.send_calls += 1;
            (state.send_faults.next_outcome(), state.send_faults.delay())
        };
        apply_delay(delay).await;

        match outcome {
            FaultOutcome::Reject => {
                return Err(NotificationError::Rejected(format!(
                    "template '{}' is disabled",
                    request.template
                )));
            }
            FaultOutcome::Unavailable => {
                return Err(NotificationError::Unavailable(
                    "provider returned 503".to_string(),
                ));
            }
            FaultOutcome::Proceed => {}
        }

        if request.recipient.trim().is_empty() {
            return Err(NotificationError::MissingRecipient);
        }

        let mut state = write(&self.state);
        if let Some(existing) = state.sent.get(dedup_key) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let notification = Notification {
            notification_id: format!("NOTE-{:04}", state.next_id),
            recipient: request.recipient,
            template: request.template,
            data: request.data,
            sent_at: Utc::now(),
        };
        state
            .sent
            .insert(dedup_key.to_string(), notification.clone());

        tracing::debug!(
            notification_id = %notification.notification_id,
            template = %notification.template,
            "Notification sent"
        );
        Ok(notification)
    }
}
