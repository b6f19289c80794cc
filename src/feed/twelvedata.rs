use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::QuoteSource;

const PROVIDER: &str = "twelvedata";
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Latest-price lookups against the Twelve Data REST API.
pub struct TwelveDataSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

/// Both the success body (`{"price": "165.20"}`) and the error body
/// (`{"code": 400, "message": "...", "status": "error"}`).
#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Option<String>,
    code: Option<i64>,
    message: Option<String>,
}

impl TwelveDataSource {
    pub fn new(config: &FeedConfig) -> Result<Self, Report<FeedError>> {
        // Free plan allowance when unset.
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(8u32));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .change_context(request_error())?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        })
    }
}

impl QuoteSource for TwelveDataSource {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn fetch_price<'a>(
        &'a self,
        symbol: &'a str,
        exchange: &'a str,
    ) -> BoxFuture<'a, Result<f64, Report<FeedError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/price", self.base_url);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("symbol", symbol),
                    ("exchange", exchange),
                    ("apikey", self.api_key.as_str()),
                ])
                .send()
                .await
                .change_context(request_error())
                .attach_with(|| format!("symbol: {symbol}"))?;

            if !response.status().is_success() {
                return Err(Report::new(request_error())
                    .attach(format!("HTTP status: {}", response.status())));
            }

            let body = response.text().await.change_context(request_error())?;
            parse_price(&body, symbol)
        })
    }
}

fn request_error() -> FeedError {
    FeedError::Request {
        provider: PROVIDER.into(),
    }
}

fn parse_price(body: &str, symbol: &str) -> Result<f64, Report<FeedError>> {
    let response: PriceResponse =
        serde_json::from_str(body).change_context(FeedError::ResponseParse {
            provider: PROVIDER.into(),
        })?;

    let no_price = || FeedError::NoPrice {
        provider: PROVIDER.into(),
        symbol: symbol.to_string(),
    };

    let Some(raw) = response.price else {
        let mut report = Report::new(no_price());
        if let Some(code) = response.code {
            report = report.attach(format!("api error code: {code}"));
        }
        if let Some(message) = response.message {
            report = report.attach(message);
        }
        return Err(report);
    };

    let price: f64 = raw
        .trim()
        .parse()
        .change_context(FeedError::ResponseParse {
            provider: PROVIDER.into(),
        })
        .attach_with(|| format!("price: {raw}"))?;

    if !price.is_finite() || price <= 0.0 {
        return Err(Report::new(no_price()).attach(format!("price: {price}")));
    }
    Ok(price)
}
