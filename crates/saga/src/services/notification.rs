//! Notification service trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use resilience::ClassifiedError;

use super::{Behavior, FailureMode};

#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub message_id: String,
}

/// Sends customer-facing messages. Sends cannot be undone.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_confirmation(
        &self,
        order_id: &str,
        customer_id: &str,
    ) -> Result<NotificationResult, ClassifiedError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<(String, String)>,
    send: Behavior,
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_send_failure(&self, mode: FailureMode) {
        self.state.write().send.set_mode(mode);
    }

    pub fn sent_count(&self) -> usize {
        self.state.read().sent.len()
    }

    pub fn send_calls(&self) -> u32 {
        self.state.read().send.calls()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send_confirmation(
        &self,
        order_id: &str,
        customer_id: &str,
    ) -> Result<NotificationResult, ClassifiedError> {
        let mut state = self.state.write();
        state.send.admit("Mailbox rejected message")?;
        state
            .sent
            .push((order_id.to_string(), customer_id.to_string()));
        Ok(NotificationResult {
            message_id: format!("MSG-{:04}", state.sent.len()),
        })
    }
}
