use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::model::EvaluationResult;
use crate::notifier::Notifier;

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// POSTs each fired alert as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, Report<NotifyError>> {
        let url = reqwest::Url::parse(url)
            .change_context(webhook_error())
            .attach_with(|| format!("url: {url}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .change_context(webhook_error())?;
        Ok(Self { client, url })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify<'a>(
        &'a self,
        result: &'a EvaluationResult,
    ) -> BoxFuture<'a, Result<(), Report<NotifyError>>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url.clone())
                .json(result)
                .send()
                .await
                .change_context(webhook_error())?;

            let status = response.status();
            if !status.is_success() {
                return Err(Report::new(webhook_error()).attach(format!("status: {status}")));
            }
            Ok(())
        })
    }
}

fn webhook_error() -> NotifyError {
    NotifyError::Channel {
        channel: "webhook".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(WebhookNotifier::new("not a url").is_err());
        assert!(WebhookNotifier::new("https://hooks.example.com/alerts").is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        // Port 9 on localhost is the discard port and is normally closed.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        let result = EvaluationResult {
            trigger_id: "t-1".into(),
            user_id: "u-1".into(),
            symbol: "AAPL".into(),
            exchange: "NASDAQ".into(),
            triggered: true,
            current_price: 165.0,
            timestamp: chrono::Utc::now(),
            message: "Price exceeded upper limit".into(),
        };
        assert!(notifier.notify(&result).await.is_err());
    }
}
