pub mod twelvedata;

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::model::Stock;
use crate::storage::StockStore;
use crate::trigger::evaluator::TriggerEvaluator;

/// Source of the latest traded price of an instrument.
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch_price<'a>(
        &'a self,
        symbol: &'a str,
        exchange: &'a str,
    ) -> BoxFuture<'a, Result<f64, Report<FeedError>>>;
}

/// Polls a quote source for every tracked instrument and feeds the prices
/// into the evaluator.
pub struct PriceFeed {
    source: Arc<dyn QuoteSource>,
    stocks: Arc<dyn StockStore>,
    evaluator: Arc<TriggerEvaluator>,
    interval: Duration,
    max_concurrency: usize,
}

impl PriceFeed {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        stocks: Arc<dyn StockStore>,
        evaluator: Arc<TriggerEvaluator>,
        interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            source,
            stocks,
            evaluator,
            interval,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = self.source.name(),
            interval_secs = self.interval.as_secs(),
            "price feed started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let updated = self.tick().await;
                    debug!(updated, "price feed tick complete");
                }
            }
        }

        info!("price feed stopped");
    }

    /// Fetch and apply one round of prices. Returns the number of instruments
    /// whose price was applied.
    pub async fn tick(&self) -> usize {
        let stocks = match self.stocks.list_stocks().await {
            Ok(stocks) => stocks,
            Err(e) => {
                warn!(error = ?e, "failed to list tracked instruments");
                return 0;
            }
        };

        futures::stream::iter(stocks)
            .map(|stock| async move { self.poll_instrument(&stock).await })
            .buffer_unordered(self.max_concurrency)
            .filter(|applied| futures::future::ready(*applied))
            .count()
            .await
    }

    async fn poll_instrument(&self, stock: &Stock) -> bool {
        let price = match self.source.fetch_price(&stock.symbol, &stock.exchange).await {
            Ok(price) => price,
            Err(e) => {
                warn!(error = ?e, instrument = %stock.instrument(), "quote fetch failed");
                return false;
            }
        };

        match self
            .evaluator
            .update_price(&stock.symbol, &stock.exchange, price)
            .await
        {
            Ok(summary) => {
                debug!(
                    instrument = %stock.instrument(),
                    price,
                    market_open = summary.market_open,
                    fired = summary.fired,
                    "price applied"
                );
                true
            }
            Err(e) => {
                warn!(error = ?e, instrument = %stock.instrument(), "trigger evaluation failed");
                false
            }
        }
    }
}
