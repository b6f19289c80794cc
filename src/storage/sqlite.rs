use chrono::{DateTime, SecondsFormat, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::Path;
use std::str::FromStr;

use crate::error::StorageError;
use crate::model::{Stock, Trigger, TriggerCondition};
use crate::storage::{StockStore, TriggerStore};

type TriggerRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    i64,
    Option<String>,
    String,
    String,
);

type StockRow = (String, String, String, String, String, String, String);

const TRIGGER_COLUMNS: &str = "trigger_id, stock_id, user_id, symbol, exchange, condition, \
     is_active, cooldown_minutes, last_fired_at, created_at, updated_at";

const STOCK_COLUMNS: &str = "stock_id, symbol, exchange, name, trigger_ids, added_at, updated_at";

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, Report<StorageError>> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .change_context(StorageError::Migration)?
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .change_context(StorageError::Migration)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;
        Ok(Self { pool })
    }
}

impl TriggerStore for SqliteStorage {
    fn create(&self, trigger: &Trigger) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let trigger = trigger.clone();
        Box::pin(async move {
            let condition = encode_condition(&trigger.condition)?;
            sqlx::query(&format!(
                "INSERT INTO triggers ({TRIGGER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&trigger.trigger_id)
            .bind(&trigger.stock_id)
            .bind(&trigger.user_id)
            .bind(&trigger.symbol)
            .bind(&trigger.exchange)
            .bind(condition)
            .bind(trigger.is_active)
            .bind(i64::from(trigger.cooldown_minutes))
            .bind(trigger.last_fired_at.map(format_time))
            .bind(format_time(trigger.created_at))
            .bind(format_time(trigger.updated_at))
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("trigger_id: {}", trigger.trigger_id))?;
            Ok(())
        })
    }

    fn get(&self, trigger_id: &str) -> BoxFuture<'_, Result<Trigger, Report<StorageError>>> {
        let trigger_id = trigger_id.to_string();
        Box::pin(async move {
            let row: Option<TriggerRow> = sqlx::query_as(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE trigger_id = ? LIMIT 1"
            ))
            .bind(&trigger_id)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            let row = row.ok_or_else(|| Report::new(StorageError::trigger_not_found(&trigger_id)))?;
            map_trigger_row(row)
        })
    }

    fn get_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Vec<Trigger>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        let exchange = exchange.to_string();
        Box::pin(async move {
            let rows: Vec<TriggerRow> = sqlx::query_as(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers \
                 WHERE symbol = ? AND exchange = ? \
                 ORDER BY created_at ASC, trigger_id ASC"
            ))
            .bind(&symbol)
            .bind(&exchange)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)
            .attach_with(|| format!("instrument: {symbol}:{exchange}"))?;

            Ok(decode_trigger_rows(rows))
        })
    }

    fn get_by_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Trigger>, Report<StorageError>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let rows: Vec<TriggerRow> = sqlx::query_as(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers \
                 WHERE user_id = ? \
                 ORDER BY created_at ASC, trigger_id ASC"
            ))
            .bind(&user_id)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(decode_trigger_rows(rows))
        })
    }

    fn update(&self, trigger: &Trigger) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let trigger = trigger.clone();
        Box::pin(async move {
            let condition = encode_condition(&trigger.condition)?;
            let last_fired = trigger.last_fired_at.map(format_time);

            // RFC 3339 timestamps with a fixed format compare correctly as text.
            let result = sqlx::query(
                "UPDATE triggers SET \
                 condition = ?, is_active = ?, cooldown_minutes = ?, \
                 last_fired_at = CASE \
                     WHEN ? IS NULL THEN last_fired_at \
                     WHEN last_fired_at IS NULL OR last_fired_at < ? THEN ? \
                     ELSE last_fired_at END, \
                 updated_at = ? \
                 WHERE trigger_id = ?",
            )
            .bind(condition)
            .bind(trigger.is_active)
            .bind(i64::from(trigger.cooldown_minutes))
            .bind(&last_fired)
            .bind(&last_fired)
            .bind(&last_fired)
            .bind(format_time(Utc::now()))
            .bind(&trigger.trigger_id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Update)
            .attach_with(|| format!("trigger_id: {}", trigger.trigger_id))?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::trigger_not_found(
                    &trigger.trigger_id,
                )));
            }
            Ok(())
        })
    }

    fn record_firing(
        &self,
        trigger_id: &str,
        fired_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let trigger_id = trigger_id.to_string();
        Box::pin(async move {
            let fired_at = format_time(fired_at);
            let result = sqlx::query(
                "UPDATE triggers SET last_fired_at = CASE \
                     WHEN last_fired_at IS NULL OR last_fired_at < ? THEN ? \
                     ELSE last_fired_at END \
                 WHERE trigger_id = ?",
            )
            .bind(&fired_at)
            .bind(&fired_at)
            .bind(&trigger_id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Update)
            .attach_with(|| format!("trigger_id: {trigger_id}"))?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::trigger_not_found(&trigger_id)));
            }
            Ok(())
        })
    }

    fn delete(&self, trigger_id: &str) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let trigger_id = trigger_id.to_string();
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM triggers WHERE trigger_id = ?")
                .bind(&trigger_id)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Delete)?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::trigger_not_found(&trigger_id)));
            }
            Ok(())
        })
    }
}

impl StockStore for SqliteStorage {
    fn create_stock(&self, stock: &Stock) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let stock = stock.clone();
        Box::pin(async move {
            let trigger_ids = encode_trigger_ids(&stock.trigger_ids)?;
            sqlx::query(&format!(
                "INSERT INTO stocks ({STOCK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&stock.stock_id)
            .bind(&stock.symbol)
            .bind(&stock.exchange)
            .bind(&stock.name)
            .bind(trigger_ids)
            .bind(format_time(stock.added_at))
            .bind(format_time(stock.updated_at))
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("instrument: {}", stock.instrument()))?;
            Ok(())
        })
    }

    fn get_stock(&self, stock_id: &str) -> BoxFuture<'_, Result<Stock, Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        Box::pin(async move {
            let row: Option<StockRow> = sqlx::query_as(&format!(
                "SELECT {STOCK_COLUMNS} FROM stocks WHERE stock_id = ? LIMIT 1"
            ))
            .bind(&stock_id)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            let row = row.ok_or_else(|| Report::new(StorageError::stock_not_found(&stock_id)))?;
            map_stock_row(row)
        })
    }

    fn find_stock(
        &self,
        symbol: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Option<Stock>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        let exchange = exchange.to_string();
        Box::pin(async move {
            let row: Option<StockRow> = sqlx::query_as(&format!(
                "SELECT {STOCK_COLUMNS} FROM stocks WHERE symbol = ? AND exchange = ? LIMIT 1"
            ))
            .bind(&symbol)
            .bind(&exchange)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            row.map(map_stock_row).transpose()
        })
    }

    fn list_stocks(&self) -> BoxFuture<'_, Result<Vec<Stock>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<StockRow> = sqlx::query_as(&format!(
                "SELECT {STOCK_COLUMNS} FROM stocks ORDER BY exchange ASC, symbol ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter().map(map_stock_row).collect()
        })
    }

    fn update_stock(&self, stock: &Stock) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let stock = stock.clone();
        Box::pin(async move {
            let trigger_ids = encode_trigger_ids(&stock.trigger_ids)?;
            let result = sqlx::query(
                "UPDATE stocks SET name = ?, trigger_ids = ?, updated_at = ? WHERE stock_id = ?",
            )
            .bind(&stock.name)
            .bind(trigger_ids)
            .bind(format_time(Utc::now()))
            .bind(&stock.stock_id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Update)?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::stock_not_found(&stock.stock_id)));
            }
            Ok(())
        })
    }

    fn attach_trigger(
        &self,
        stock_id: &str,
        trigger_id: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        let trigger_id = trigger_id.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE stocks SET trigger_ids = json_insert(trigger_ids, '$[#]', ?), \
                 updated_at = ? WHERE stock_id = ?",
            )
            .bind(&trigger_id)
            .bind(format_time(Utc::now()))
            .bind(&stock_id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Update)
            .attach_with(|| format!("trigger_id: {trigger_id}"))?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::stock_not_found(&stock_id)));
            }
            Ok(())
        })
    }

    fn detach_trigger(
        &self,
        stock_id: &str,
        trigger_id: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        let trigger_id = trigger_id.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE stocks SET trigger_ids = ( \
                     SELECT json_group_array(value) FROM json_each(stocks.trigger_ids) \
                     WHERE value <> ?), \
                 updated_at = ? WHERE stock_id = ?",
            )
            .bind(&trigger_id)
            .bind(format_time(Utc::now()))
            .bind(&stock_id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Update)
            .attach_with(|| format!("trigger_id: {trigger_id}"))?;

            if result.rows_affected() == 0 {
                return Err(Report::new(StorageError::stock_not_found(&stock_id)));
            }
            Ok(())
        })
    }
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time_utc(value: &str, entity: &str) -> Result<DateTime<Utc>, Report<StorageError>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .change_context(StorageError::Decode {
            entity: entity.into(),
        })
        .attach_with(|| format!("timestamp: {value}"))
}

fn encode_condition(condition: &TriggerCondition) -> Result<String, Report<StorageError>> {
    serde_json::to_string(condition).change_context(StorageError::Insert)
}

fn encode_trigger_ids(ids: &[String]) -> Result<String, Report<StorageError>> {
    serde_json::to_string(ids).change_context(StorageError::Insert)
}

/// Rows that fail to decode are logged and skipped so one corrupt record
/// does not hide the others.
fn decode_trigger_rows(rows: Vec<TriggerRow>) -> Vec<Trigger> {
    rows.into_iter()
        .filter_map(|row| {
            let trigger_id = row.0.clone();
            match map_trigger_row(row) {
                Ok(trigger) => Some(trigger),
                Err(e) => {
                    tracing::warn!(error = ?e, trigger_id = %trigger_id, "skipping undecodable trigger");
                    None
                }
            }
        })
        .collect()
}

fn map_trigger_row(
    (
        trigger_id,
        stock_id,
        user_id,
        symbol,
        exchange,
        condition,
        is_active,
        cooldown_minutes,
        last_fired_at,
        created_at,
        updated_at,
    ): TriggerRow,
) -> Result<Trigger, Report<StorageError>> {
    let decode_err = || StorageError::Decode {
        entity: "trigger".into(),
    };

    let condition: TriggerCondition = serde_json::from_str(&condition)
        .change_context(decode_err())
        .attach_with(|| format!("trigger_id: {trigger_id}"))?;
    let cooldown_minutes = u32::try_from(cooldown_minutes).change_context(decode_err())?;
    let last_fired_at = last_fired_at
        .as_deref()
        .map(|ts| parse_time_utc(ts, "trigger"))
        .transpose()?;

    Ok(Trigger {
        trigger_id,
        stock_id,
        user_id,
        symbol,
        exchange,
        condition,
        is_active,
        cooldown_minutes,
        last_fired_at,
        created_at: parse_time_utc(&created_at, "trigger")?,
        updated_at: parse_time_utc(&updated_at, "trigger")?,
    })
}

fn map_stock_row(
    (stock_id, symbol, exchange, name, trigger_ids, added_at, updated_at): StockRow,
) -> Result<Stock, Report<StorageError>> {
    let trigger_ids: Vec<String> = serde_json::from_str(&trigger_ids)
        .change_context(StorageError::Decode {
            entity: "stock".into(),
        })
        .attach_with(|| format!("stock_id: {stock_id}"))?;

    Ok(Stock {
        stock_id,
        symbol,
        exchange,
        name,
        trigger_ids,
        added_at: parse_time_utc(&added_at, "stock")?,
        updated_at: parse_time_utc(&updated_at, "stock")?,
    })
}
