use chrono::{DateTime, Duration, Utc};

use crate::model::{Trigger, TriggerCondition};

/// Result of checking a single condition against a price.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Fired { message: String },
    NotMet,
    /// The condition needs data a bare price cannot provide.
    NotEvaluable { reason: String },
}

impl Outcome {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }
}

/// Evaluate a condition against the latest price. Both limits are inclusive.
pub fn evaluate(condition: &TriggerCondition, price: f64) -> Outcome {
    match condition {
        TriggerCondition::PriceUpperLimit { threshold } => {
            if price >= *threshold {
                Outcome::Fired {
                    message: "Price exceeded upper limit".into(),
                }
            } else {
                Outcome::NotMet
            }
        }
        TriggerCondition::PriceLowerLimit { threshold } => {
            if price <= *threshold {
                Outcome::Fired {
                    message: "Price fell below lower limit".into(),
                }
            } else {
                Outcome::NotMet
            }
        }
        TriggerCondition::PriceChangePercent { .. } => Outcome::NotEvaluable {
            reason: "percent change requires a reference price".into(),
        },
        TriggerCondition::VolumeSpike { .. } => Outcome::NotEvaluable {
            reason: "volume spike requires volume data".into(),
        },
        TriggerCondition::Indicator { indicator, .. } => Outcome::NotEvaluable {
            reason: format!("{indicator} requires price history"),
        },
    }
}

/// Whether the trigger's cooldown has passed at `now`.
///
/// A trigger that never fired has no cooldown barrier.
pub fn cooldown_elapsed(trigger: &Trigger, now: DateTime<Utc>) -> bool {
    let cooldown = Duration::minutes(i64::from(trigger.cooldown_minutes));
    match trigger.last_fired_at {
        Some(last) if now - last < cooldown => false,
        _ => true,
    }
}
