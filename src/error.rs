use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("failed to update data")]
    Update,
    #[display("failed to delete data")]
    Delete,
    #[display("failed to decode stored {entity}")]
    Decode { entity: String },
    #[display("{entity} {id} not found")]
    NotFound { entity: String, id: String },
}

impl StorageError {
    pub fn trigger_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "trigger".into(),
            id: id.to_string(),
        }
    }

    pub fn stock_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "stock".into(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Display, Error)]
pub enum DeliveryError {
    #[display("user {user_id} not connected")]
    NotConnected { user_id: String },
    #[display("failed to serialize push message")]
    Serialize,
    #[display("failed to write to connection of user {user_id}")]
    Transport { user_id: String },
}

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("{channel} notification failed")]
    Channel { channel: String },
}

#[derive(Debug, Display, Error)]
pub enum FeedError {
    #[display("request to {provider} failed")]
    Request { provider: String },
    #[display("failed to parse response from {provider}")]
    ResponseParse { provider: String },
    #[display("{provider} returned no usable price for {symbol}")]
    NoPrice { provider: String, symbol: String },
}

#[derive(Debug, Display, Error)]
pub enum EvaluatorError {
    #[display("failed to fetch triggers for {symbol}:{exchange}")]
    FetchTriggers { symbol: String, exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum TriggerError {
    #[display("invalid trigger: {reason}")]
    Invalid { reason: String },
    #[display("no instrument {symbol}:{exchange}")]
    UnknownInstrument { symbol: String, exchange: String },
    #[display("trigger storage failed")]
    Storage,
}
