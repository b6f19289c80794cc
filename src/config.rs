use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use chrono::NaiveTime;
use chrono_tz::Tz;
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::calendar::MarketHours;
use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_cooldown_minutes() -> u32 {
    5
}

fn default_bind_addr() -> String {
    "127.0.0.1:8081".into()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    4
}

fn default_base_url() -> String {
    "https://api.twelvedata.com".into()
}

fn default_requests_per_minute() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_cooldown_minutes")]
    pub default_cooldown_minutes: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
            default_cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            max_concurrency: default_max_concurrency(),
            base_url: default_base_url(),
            api_key: String::new(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub terminal: bool,
    /// Empty disables the webhook channel.
    #[serde(default)]
    pub webhook_url: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            terminal: true,
            webhook_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    /// Local opening time, `HH:MM`.
    pub open: String,
    /// Local closing time, `HH:MM`.
    pub close: String,
    /// IANA timezone id, e.g. `America/New_York`.
    pub timezone: String,
}

impl ExchangeConfig {
    pub fn market_hours(&self) -> Option<MarketHours> {
        Some(MarketHours {
            open: parse_time_of_day(&self.open)?,
            close: parse_time_of_day(&self.close)?,
            timezone: self.timezone.parse::<Tz>().ok()?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    #[serde(default)]
    pub name: String,
}

fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(config)?;
    validate_server(config)?;
    validate_feed(config)?;
    validate_notifications(config)?;
    validate_exchanges(config)?;
    validate_instruments(config)?;
    Ok(())
}

fn invalid(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

fn validate_general(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !VALID_LOG_FORMATS.contains(&config.general.log_format.as_str()) {
        return Err(invalid(format!(
            "general.log_format \"{}\" is not valid",
            config.general.log_format
        )));
    }
    Ok(())
}

fn validate_server(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.server.bind_addr.parse::<SocketAddr>().is_err() {
        return Err(invalid(format!(
            "server.bind_addr \"{}\" is not a socket address",
            config.server.bind_addr
        )));
    }
    Ok(())
}

fn validate_feed(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let feed = &config.feed;
    if feed.interval_secs == 0 {
        return Err(invalid("feed.interval_secs must be > 0".into()));
    }
    if feed.max_concurrency == 0 {
        return Err(invalid("feed.max_concurrency must be > 0".into()));
    }
    if feed.requests_per_minute == 0 {
        return Err(invalid("feed.requests_per_minute must be > 0".into()));
    }
    if feed.enabled && feed.api_key.trim().is_empty() {
        return Err(invalid("feed.api_key is required when the feed is enabled".into()));
    }
    if reqwest::Url::parse(&feed.base_url).is_err() {
        return Err(invalid(format!(
            "feed.base_url \"{}\" is not a valid URL",
            feed.base_url
        )));
    }
    Ok(())
}

fn validate_notifications(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let url = config.notifications.webhook_url.trim();
    if !url.is_empty() && reqwest::Url::parse(url).is_err() {
        return Err(invalid(format!(
            "notifications.webhook_url \"{url}\" is not a valid URL"
        )));
    }
    Ok(())
}

fn validate_exchanges(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for exchange in &config.exchanges {
        if !seen.insert(exchange.name.to_ascii_uppercase()) {
            return Err(invalid(format!(
                "exchanges: duplicate name \"{}\"",
                exchange.name
            )));
        }

        let open = parse_time_of_day(&exchange.open).ok_or_else(|| {
            invalid(format!(
                "exchanges[\"{}\"].open \"{}\" is not HH:MM",
                exchange.name, exchange.open
            ))
        })?;
        let close = parse_time_of_day(&exchange.close).ok_or_else(|| {
            invalid(format!(
                "exchanges[\"{}\"].close \"{}\" is not HH:MM",
                exchange.name, exchange.close
            ))
        })?;
        if open >= close {
            return Err(invalid(format!(
                "exchanges[\"{}\"]: open must be before close",
                exchange.name
            )));
        }

        if exchange.timezone.parse::<Tz>().is_err() {
            return Err(invalid(format!(
                "exchanges[\"{}\"].timezone \"{}\" is unknown",
                exchange.name, exchange.timezone
            )));
        }
    }
    Ok(())
}

fn validate_instruments(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    // No [[exchanges]] means the built-in NYSE/NASDAQ calendar applies.
    let known: HashSet<String> = if config.exchanges.is_empty() {
        ["NYSE".to_string(), "NASDAQ".to_string()].into_iter().collect()
    } else {
        config
            .exchanges
            .iter()
            .map(|e| e.name.to_ascii_uppercase())
            .collect()
    };

    for instrument in &config.instruments {
        if instrument.symbol.trim().is_empty() {
            return Err(invalid("instruments: empty symbol".into()));
        }
        if !known.contains(&instrument.exchange.to_ascii_uppercase()) {
            return Err(invalid(format!(
                "instruments[symbol={}].exchange \"{}\" does not match any exchange",
                instrument.symbol, instrument.exchange
            )));
        }
    }
    Ok(())
}
