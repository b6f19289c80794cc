pub mod condition;
pub mod evaluator;

use std::sync::Arc;

use chrono::Utc;
use error_stack::{Report, ResultExt, bail};
use uuid::Uuid;

use crate::error::TriggerError;
use crate::model::{Stock, Trigger, TriggerCondition};
use crate::storage::{StockStore, TriggerStore};

/// Request to create a trigger.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub condition: TriggerCondition,
    pub cooldown_minutes: u32,
}

/// Trigger lifecycle operations that keep each instrument's trigger index in
/// step with the trigger records.
pub struct TriggerService {
    triggers: Arc<dyn TriggerStore>,
    stocks: Arc<dyn StockStore>,
}

impl TriggerService {
    pub fn new(triggers: Arc<dyn TriggerStore>, stocks: Arc<dyn StockStore>) -> Self {
        Self { triggers, stocks }
    }

    /// Return the instrument record for (symbol, exchange), creating it if needed.
    pub async fn track_instrument(
        &self,
        symbol: &str,
        exchange: &str,
        name: &str,
    ) -> Result<Stock, Report<TriggerError>> {
        let symbol = normalize(symbol);
        let exchange = normalize(exchange);
        if symbol.is_empty() || exchange.is_empty() {
            bail!(TriggerError::Invalid {
                reason: "symbol and exchange must not be empty".into(),
            });
        }

        if let Some(stock) = self
            .stocks
            .find_stock(&symbol, &exchange)
            .await
            .change_context(TriggerError::Storage)?
        {
            return Ok(stock);
        }

        let now = Utc::now();
        let stock = Stock {
            stock_id: Uuid::new_v4().to_string(),
            symbol,
            exchange,
            name: name.to_string(),
            trigger_ids: Vec::new(),
            added_at: now,
            updated_at: now,
        };
        self.stocks
            .create_stock(&stock)
            .await
            .change_context(TriggerError::Storage)?;
        tracing::info!(instrument = %stock.instrument(), stock_id = %stock.stock_id, "instrument tracked");
        Ok(stock)
    }

    pub async fn create(&self, request: NewTrigger) -> Result<Trigger, Report<TriggerError>> {
        validate_condition(&request.condition)?;
        if request.user_id.trim().is_empty() {
            bail!(TriggerError::Invalid {
                reason: "user_id must not be empty".into(),
            });
        }

        let symbol = normalize(&request.symbol);
        let exchange = normalize(&request.exchange);
        let stock = self
            .stocks
            .find_stock(&symbol, &exchange)
            .await
            .change_context(TriggerError::Storage)?
            .ok_or_else(|| {
                Report::new(TriggerError::UnknownInstrument {
                    symbol: symbol.clone(),
                    exchange: exchange.clone(),
                })
            })?;

        let now = Utc::now();
        let trigger = Trigger {
            trigger_id: Uuid::new_v4().to_string(),
            stock_id: stock.stock_id.clone(),
            user_id: request.user_id.trim().to_string(),
            symbol,
            exchange,
            condition: request.condition,
            is_active: true,
            cooldown_minutes: request.cooldown_minutes,
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        };

        self.triggers
            .create(&trigger)
            .await
            .change_context(TriggerError::Storage)?;

        if let Err(e) = self
            .stocks
            .attach_trigger(&stock.stock_id, &trigger.trigger_id)
            .await
        {
            if let Err(rollback) = self.triggers.delete(&trigger.trigger_id).await {
                tracing::warn!(
                    error = ?rollback,
                    trigger_id = %trigger.trigger_id,
                    "failed to roll back trigger"
                );
            }
            return Err(e.change_context(TriggerError::Storage));
        }

        tracing::info!(
            trigger_id = %trigger.trigger_id,
            user_id = %trigger.user_id,
            instrument = %trigger.instrument(),
            condition = %trigger.condition,
            "trigger created"
        );
        Ok(trigger)
    }

    /// Delete a trigger, then detach it from its instrument's index.
    pub async fn delete(&self, trigger_id: &str) -> Result<(), Report<TriggerError>> {
        let trigger = self
            .triggers
            .get(trigger_id)
            .await
            .change_context(TriggerError::Storage)?;

        self.triggers
            .delete(trigger_id)
            .await
            .change_context(TriggerError::Storage)?;

        match self
            .stocks
            .detach_trigger(&trigger.stock_id, trigger_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.current_context().is_not_found() => {
                tracing::warn!(
                    trigger_id,
                    stock_id = %trigger.stock_id,
                    "instrument record missing, nothing to detach"
                );
            }
            Err(e) => return Err(e.change_context(TriggerError::Storage)),
        }

        tracing::info!(trigger_id, user_id = %trigger.user_id, "trigger deleted");
        Ok(())
    }

    pub async fn set_active(
        &self,
        trigger_id: &str,
        active: bool,
    ) -> Result<Trigger, Report<TriggerError>> {
        let mut trigger = self
            .triggers
            .get(trigger_id)
            .await
            .change_context(TriggerError::Storage)?;
        trigger.is_active = active;
        self.triggers
            .update(&trigger)
            .await
            .change_context(TriggerError::Storage)?;
        tracing::info!(trigger_id, active, "trigger state changed");
        Ok(trigger)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Trigger>, Report<TriggerError>> {
        self.triggers
            .get_by_user(user_id)
            .await
            .change_context(TriggerError::Storage)
    }

    pub async fn list_instruments(&self) -> Result<Vec<Stock>, Report<TriggerError>> {
        self.stocks
            .list_stocks()
            .await
            .change_context(TriggerError::Storage)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}

fn validate_condition(condition: &TriggerCondition) -> Result<(), Report<TriggerError>> {
    let (field, value, must_be_positive) = match condition {
        TriggerCondition::PriceUpperLimit { threshold }
        | TriggerCondition::PriceLowerLimit { threshold } => ("threshold", *threshold, true),
        TriggerCondition::PriceChangePercent { percent } => ("percent", *percent, false),
        TriggerCondition::VolumeSpike { multiplier } => ("multiplier", *multiplier, true),
        TriggerCondition::Indicator { threshold, .. } => ("threshold", *threshold, false),
    };

    if !value.is_finite() {
        bail!(TriggerError::Invalid {
            reason: format!("{field} must be a finite number"),
        });
    }
    if must_be_positive && value <= 0.0 {
        bail!(TriggerError::Invalid {
            reason: format!("{field} must be positive, got {value}"),
        });
    }
    if matches!(condition, TriggerCondition::PriceChangePercent { .. }) && value == 0.0 {
        bail!(TriggerError::Invalid {
            reason: "percent must not be zero".into(),
        });
    }
    Ok(())
}
