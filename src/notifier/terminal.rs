use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::model::EvaluationResult;
use crate::notifier::Notifier;

/// Writes every fired alert to the log.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn notify<'a>(
        &'a self,
        result: &'a EvaluationResult,
    ) -> BoxFuture<'a, Result<(), Report<NotifyError>>> {
        Box::pin(async move {
            tracing::warn!(
                exchange = %result.exchange,
                symbol = %result.symbol,
                user_id = %result.user_id,
                trigger_id = %result.trigger_id,
                price = result.current_price,
                "ALERT: {}",
                result.message,
            );
            Ok(())
        })
    }
}
