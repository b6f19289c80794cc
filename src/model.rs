use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tradable symbol scoped to its exchange, e.g. `AAPL:NASDAQ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub exchange: String,
}

impl InstrumentKey {
    pub fn new(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.exchange)
    }
}

/// Indicators that a trigger can reference but this service cannot compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndicatorKind {
    Rsi,
    Macd,
    BollingerBands,
}

impl IndicatorKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rsi" => Some(Self::Rsi),
            "macd" => Some(Self::Macd),
            "bollinger" => Some(Self::BollingerBands),
            _ => None,
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsi => write!(f, "rsi"),
            Self::Macd => write!(f, "macd"),
            Self::BollingerBands => write!(f, "bollinger"),
        }
    }
}

/// The condition a trigger watches for.
///
/// Serialized with a `type` tag carrying the wire names used by existing
/// clients (`PRICE_UPPER_LIMIT`, `PRICE_LOWER_LIMIT`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerCondition {
    PriceUpperLimit { threshold: f64 },
    PriceLowerLimit { threshold: f64 },
    PriceChangePercent { percent: f64 },
    VolumeSpike { multiplier: f64 },
    Indicator { indicator: IndicatorKind, threshold: f64 },
}

impl TriggerCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PriceUpperLimit { .. } => "PRICE_UPPER_LIMIT",
            Self::PriceLowerLimit { .. } => "PRICE_LOWER_LIMIT",
            Self::PriceChangePercent { .. } => "PRICE_CHANGE_PERCENT",
            Self::VolumeSpike { .. } => "VOLUME_SPIKE",
            Self::Indicator { .. } => "INDICATOR",
        }
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PriceUpperLimit { threshold } => write!(f, "price >= {threshold}"),
            Self::PriceLowerLimit { threshold } => write!(f, "price <= {threshold}"),
            Self::PriceChangePercent { percent } => write!(f, "change >= {percent}%"),
            Self::VolumeSpike { multiplier } => write!(f, "volume >= {multiplier}x average"),
            Self::Indicator {
                indicator,
                threshold,
            } => write!(f, "{indicator} crosses {threshold}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub trigger_id: String,
    pub stock_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub condition: TriggerCondition,
    pub is_active: bool,
    pub cooldown_minutes: u32,
    /// `None` until the trigger fires for the first time.
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(&self.symbol, &self.exchange)
    }
}

/// Instrument record together with the ids of the triggers watching it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stock {
    pub stock_id: String,
    pub symbol: String,
    pub exchange: String,
    pub name: String,
    pub trigger_ids: Vec<String>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stock {
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(&self.symbol, &self.exchange)
    }
}

/// Outcome of a trigger firing. This is also the push message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub trigger_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub triggered: bool,
    pub current_price: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
