use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use parking_lot::RwLock;

use crate::calendar::MarketCalendar;
use crate::error::EvaluatorError;
use crate::model::{EvaluationResult, InstrumentKey, Trigger};
use crate::notifier::NotificationDispatcher;
use crate::storage::TriggerStore;
use crate::trigger::condition::{Outcome, cooldown_elapsed, evaluate};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Latest observed price per instrument.
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<InstrumentKey, CachedPrice>>,
}

impl PriceCache {
    pub fn update(&self, key: InstrumentKey, price: f64, observed_at: DateTime<Utc>) {
        self.prices
            .write()
            .insert(key, CachedPrice { price, observed_at });
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<CachedPrice> {
        self.prices.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }
}

/// What a single price update did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub market_open: bool,
    pub candidates: usize,
    pub fired: usize,
    pub inactive: usize,
    pub cooling_down: usize,
    pub not_met: usize,
    pub not_evaluable: usize,
}

pub struct TriggerEvaluator {
    cache: PriceCache,
    calendar: Arc<MarketCalendar>,
    store: Arc<dyn TriggerStore>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl TriggerEvaluator {
    pub fn new(
        calendar: Arc<MarketCalendar>,
        store: Arc<dyn TriggerStore>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            cache: PriceCache::default(),
            calendar,
            store,
            dispatcher,
        }
    }

    pub fn cached_price(&self, symbol: &str, exchange: &str) -> Option<CachedPrice> {
        self.cache.get(&InstrumentKey::new(symbol, exchange))
    }

    pub async fn update_price(
        &self,
        symbol: &str,
        exchange: &str,
        price: f64,
    ) -> Result<EvaluationSummary, Report<EvaluatorError>> {
        self.update_price_at(symbol, exchange, price, Utc::now()).await
    }

    /// Record `price` and evaluate every trigger on the instrument at `now`.
    ///
    /// Only a failure to fetch the candidate triggers is returned; per-trigger
    /// persistence and delivery problems are logged.
    pub async fn update_price_at(
        &self,
        symbol: &str,
        exchange: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<EvaluationSummary, Report<EvaluatorError>> {
        self.cache
            .update(InstrumentKey::new(symbol, exchange), price, now);

        let mut summary = EvaluationSummary::default();
        if !self.calendar.is_open(exchange, now) {
            tracing::debug!(symbol, exchange, price, "market closed, skipping evaluation");
            return Ok(summary);
        }
        summary.market_open = true;

        let triggers = self
            .store
            .get_by_symbol(symbol, exchange)
            .await
            .change_context(EvaluatorError::FetchTriggers {
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
            })?;
        summary.candidates = triggers.len();

        for trigger in triggers {
            if !trigger.is_active {
                summary.inactive += 1;
                continue;
            }
            if !cooldown_elapsed(&trigger, now) {
                tracing::debug!(trigger_id = %trigger.trigger_id, "alert suppressed by cooldown");
                summary.cooling_down += 1;
                continue;
            }

            match evaluate(&trigger.condition, price) {
                Outcome::NotMet => summary.not_met += 1,
                Outcome::NotEvaluable { reason } => {
                    tracing::debug!(
                        trigger_id = %trigger.trigger_id,
                        kind = trigger.condition.kind(),
                        reason = %reason,
                        "trigger not evaluable"
                    );
                    summary.not_evaluable += 1;
                }
                Outcome::Fired { message } => {
                    if self.record_firing(&trigger, now).await {
                        let result = EvaluationResult {
                            trigger_id: trigger.trigger_id.clone(),
                            user_id: trigger.user_id.clone(),
                            symbol: symbol.to_string(),
                            exchange: exchange.to_string(),
                            triggered: true,
                            current_price: price,
                            timestamp: now,
                            message,
                        };
                        tracing::info!(
                            trigger_id = %result.trigger_id,
                            user_id = %result.user_id,
                            symbol,
                            exchange,
                            price,
                            condition = %trigger.condition,
                            "trigger fired"
                        );
                        self.dispatcher.notify(&result).await;
                        summary.fired += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Persist the new firing time. Returns `false` if the trigger was
    /// deleted in the meantime and must not be delivered.
    async fn record_firing(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        match self.store.record_firing(&trigger.trigger_id, now).await {
            Ok(()) => true,
            Err(e) if e.current_context().is_not_found() => {
                tracing::debug!(trigger_id = %trigger.trigger_id, "trigger deleted during evaluation");
                false
            }
            Err(e) => {
                tracing::warn!(
                    error = ?e,
                    trigger_id = %trigger.trigger_id,
                    "failed to persist firing time"
                );
                true
            }
        }
    }
}
