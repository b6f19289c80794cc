use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::ExchangeConfig;

/// Trading window of one exchange, in the exchange's local time.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub timezone: Tz,
}

/// Answers whether an exchange is trading at a given instant.
///
/// Weekends (in UTC) are always closed and holidays are not modeled. An
/// exchange without configured hours is treated as closed.
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    hours: HashMap<String, MarketHours>,
}

impl MarketCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// NYSE and NASDAQ, 09:30-16:00 America/New_York.
    pub fn us_equities() -> Self {
        let mut calendar = Self::new();
        for name in ["NYSE", "NASDAQ"] {
            calendar.insert(
                name,
                MarketHours {
                    open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
                    close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
                    timezone: chrono_tz::America::New_York,
                },
            );
        }
        calendar
    }

    /// Build from validated exchange entries; entries that fail to parse are skipped.
    pub fn from_config(exchanges: &[ExchangeConfig]) -> Self {
        if exchanges.is_empty() {
            return Self::us_equities();
        }

        let mut calendar = Self::new();
        for exchange in exchanges {
            match exchange.market_hours() {
                Some(hours) => calendar.insert(&exchange.name, hours),
                None => tracing::warn!(exchange = %exchange.name, "invalid market hours, skipping"),
            }
        }
        calendar
    }

    /// Exchange names are matched case-insensitively.
    pub fn insert(&mut self, exchange: &str, hours: MarketHours) {
        self.hours.insert(exchange.to_ascii_uppercase(), hours);
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &str> {
        self.hours.keys().map(String::as_str)
    }

    pub fn is_open(&self, exchange: &str, now: DateTime<Utc>) -> bool {
        let Some(hours) = self.hours.get(&exchange.to_ascii_uppercase()) else {
            return false;
        };

        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let local = now.with_timezone(&hours.timezone);
        let today = local.date_naive();

        let open = today
            .and_time(hours.open)
            .and_local_timezone(hours.timezone)
            .earliest();
        let close = today
            .and_time(hours.close)
            .and_local_timezone(hours.timezone)
            .earliest();

        match (open, close) {
            (Some(open), Some(close)) => local > open && local < close,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn open_during_new_york_session() {
        let calendar = MarketCalendar::us_equities();
        // Wednesday 2024-01-17 15:00 UTC = 10:00 EST
        assert!(calendar.is_open("NASDAQ", utc(2024, 1, 17, 15, 0)));
        assert!(calendar.is_open("NYSE", utc(2024, 1, 17, 15, 0)));
    }

    #[test]
    fn closed_outside_session() {
        let calendar = MarketCalendar::us_equities();
        // 08:00 EST and 17:00 EST
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 13, 0)));
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 22, 0)));
    }

    #[test]
    fn session_bounds_are_exclusive() {
        let calendar = MarketCalendar::us_equities();
        // exactly 09:30 and 16:00 EST
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 14, 30)));
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 21, 0)));
        assert!(calendar.is_open("NASDAQ", utc(2024, 1, 17, 14, 31)));
    }

    #[test]
    fn follows_daylight_saving_time() {
        let calendar = MarketCalendar::us_equities();
        // 2024-07-17 13:45 UTC = 09:45 EDT, but 08:45 EST would be closed
        assert!(calendar.is_open("NASDAQ", utc(2024, 7, 17, 13, 45)));
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 13, 45)));
    }

    #[test]
    fn closed_on_weekends() {
        let calendar = MarketCalendar::us_equities();
        // Saturday and Sunday at 15:00 UTC
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 20, 15, 0)));
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 21, 15, 0)));
    }

    #[test]
    fn unknown_exchange_is_closed() {
        let calendar = MarketCalendar::us_equities();
        assert!(!calendar.is_open("LSE", utc(2024, 1, 17, 12, 0)));
    }

    #[test]
    fn custom_exchange_from_config() {
        let calendar = MarketCalendar::from_config(&[ExchangeConfig {
            name: "TSE".into(),
            open: "09:00".into(),
            close: "15:00".into(),
            timezone: "Asia/Tokyo".into(),
        }]);
        // Wednesday 01:00 UTC = 10:00 JST
        assert!(calendar.is_open("TSE", utc(2024, 1, 17, 1, 0)));
        assert!(!calendar.is_open("TSE", utc(2024, 1, 17, 7, 0)));
        assert!(!calendar.is_open("NASDAQ", utc(2024, 1, 17, 15, 0)));
    }

    #[test]
    fn exchange_names_ignore_case() {
        let calendar = MarketCalendar::us_equities();
        assert!(calendar.is_open("nasdaq", utc(2024, 1, 17, 15, 0)));
    }

    #[test]
    fn empty_config_falls_back_to_us_equities() {
        let calendar = MarketCalendar::from_config(&[]);
        let mut names: Vec<_> = calendar.exchanges().collect();
        names.sort();
        assert_eq!(names, vec!["NASDAQ", "NYSE"]);
    }
}
