pub mod sqlite;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{Stock, Trigger};

/// Persistence of trigger records.
///
/// Neither `update` nor `record_firing` may move `last_fired_at` backwards: a
/// stored firing time newer than the one being written wins.
pub trait TriggerStore: Send + Sync {
    fn create(&self, trigger: &Trigger) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn get(&self, trigger_id: &str) -> BoxFuture<'_, Result<Trigger, Report<StorageError>>>;

    /// Triggers watching `symbol` on `exchange`, oldest first.
    fn get_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Vec<Trigger>, Report<StorageError>>>;

    fn get_by_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Trigger>, Report<StorageError>>>;

    /// Fails with `StorageError::NotFound` when the trigger no longer exists.
    fn update(&self, trigger: &Trigger) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Set only the firing time, leaving user-controlled fields untouched.
    /// Fails with `StorageError::NotFound` when the trigger no longer exists.
    fn record_firing(
        &self,
        trigger_id: &str,
        fired_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn delete(&self, trigger_id: &str) -> BoxFuture<'_, Result<(), Report<StorageError>>>;
}

/// Lookup of instrument records and their associated-trigger index.
pub trait StockStore: Send + Sync {
    fn create_stock(&self, stock: &Stock) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn get_stock(&self, stock_id: &str) -> BoxFuture<'_, Result<Stock, Report<StorageError>>>;

    fn find_stock(
        &self,
        symbol: &str,
        exchange: &str,
    ) -> BoxFuture<'_, Result<Option<Stock>, Report<StorageError>>>;

    fn list_stocks(&self) -> BoxFuture<'_, Result<Vec<Stock>, Report<StorageError>>>;

    fn update_stock(&self, stock: &Stock) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Append `trigger_id` to the instrument's index in one atomic step.
    fn attach_trigger(
        &self,
        stock_id: &str,
        trigger_id: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Remove `trigger_id` from the instrument's index in one atomic step.
    fn detach_trigger(
        &self,
        stock_id: &str,
        trigger_id: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;
}
