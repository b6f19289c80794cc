pub mod terminal;
pub mod webhook;

use std::sync::Arc;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::{DeliveryError, NotifyError};
use crate::model::EvaluationResult;
use crate::registry::ConnectionRegistry;

/// External sink for fired alerts, in addition to the push connection.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify<'a>(
        &'a self,
        result: &'a EvaluationResult,
    ) -> BoxFuture<'a, Result<(), Report<NotifyError>>>;
}

/// Delivers fired alerts: first to the user's push connection, then to every
/// configured channel. Failures are logged and never reach the caller.
pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            channels: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub async fn notify(&self, result: &EvaluationResult) {
        match self.registry.send(&result.user_id, result).await {
            Ok(()) => {
                tracing::debug!(
                    user_id = %result.user_id,
                    trigger_id = %result.trigger_id,
                    "alert pushed"
                );
            }
            Err(e) if matches!(e.current_context(), DeliveryError::NotConnected { .. }) => {
                tracing::debug!(
                    user_id = %result.user_id,
                    trigger_id = %result.trigger_id,
                    "user offline, push skipped"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = ?e,
                    user_id = %result.user_id,
                    trigger_id = %result.trigger_id,
                    "push delivery failed"
                );
            }
        }

        for channel in &self.channels {
            if let Err(e) = channel.notify(result).await {
                tracing::warn!(
                    error = ?e,
                    channel = channel.name(),
                    trigger_id = %result.trigger_id,
                    "notification channel failed"
                );
            }
        }
    }
}
