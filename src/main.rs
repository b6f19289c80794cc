mod calendar;
mod config;
mod error;
mod feed;
mod model;
mod notifier;
mod registry;
mod storage;
mod trigger;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use tracing_subscriber::EnvFilter;

use calendar::MarketCalendar;
use config::AppConfig;
use feed::PriceFeed;
use feed::twelvedata::TwelveDataSource;
use model::{IndicatorKind, TriggerCondition};
use notifier::NotificationDispatcher;
use notifier::terminal::TerminalNotifier;
use notifier::webhook::WebhookNotifier;
use registry::ConnectionRegistry;
use registry::websocket;
use storage::sqlite::SqliteStorage;
use trigger::evaluator::TriggerEvaluator;
use trigger::{NewTrigger, TriggerService};

const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("invalid argument")]
    Argument,
    #[display("trigger operation failed")]
    Trigger,
    #[display("push server error")]
    Server,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "stock-notifier", about = "Stock price trigger alerts")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the push server and the price feed until Ctrl+C
    Serve,
    /// Manage tracked instruments
    Stock {
        #[command(subcommand)]
        action: StockCommand,
    },
    /// Manage triggers
    Trigger {
        #[command(subcommand)]
        action: TriggerCommand,
    },
}

#[derive(Subcommand)]
enum StockCommand {
    Add {
        symbol: String,
        exchange: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    List,
}

#[derive(Subcommand)]
enum TriggerCommand {
    Add {
        #[arg(long)]
        user: String,
        symbol: String,
        exchange: String,
        /// upper | lower | percent | volume | indicator
        #[arg(long)]
        kind: String,
        /// Threshold, percent or multiplier depending on the kind
        #[arg(long)]
        value: f64,
        /// rsi | macd | bollinger (only for `--kind indicator`)
        #[arg(long)]
        indicator: Option<String>,
        /// Defaults to `general.default_cooldown_minutes`
        #[arg(long)]
        cooldown: Option<u32>,
    },
    List {
        #[arg(long)]
        user: String,
    },
    Remove {
        trigger_id: String,
    },
    Enable {
        trigger_id: String,
    },
    Disable {
        trigger_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let data_dir = &config.general.data_dir;
    std::fs::create_dir_all(data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {data_dir}"))?;

    let db_path = format!("{data_dir}/stock-notifier.db");
    let storage = Arc::new(
        SqliteStorage::open(Path::new(&db_path))
            .await
            .change_context(AppError::Storage)?,
    );
    let service = TriggerService::new(storage.clone(), storage.clone());

    match cli.command {
        Command::Serve => serve(&config, storage, &service).await,
        Command::Stock { action } => run_stock_command(action, &service).await,
        Command::Trigger { action } => run_trigger_command(action, &config, &service).await,
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn serve(
    config: &AppConfig,
    storage: Arc<SqliteStorage>,
    service: &TriggerService,
) -> Result<(), Report<AppError>> {
    // ── Instruments ───────────────────────────────────────────────────────────
    for instrument in &config.instruments {
        service
            .track_instrument(&instrument.symbol, &instrument.exchange, &instrument.name)
            .await
            .change_context(AppError::Storage)?;
    }

    // ── Market calendar ───────────────────────────────────────────────────────
    let calendar = Arc::new(MarketCalendar::from_config(&config.exchanges));
    let mut exchanges: Vec<&str> = calendar.exchanges().collect();
    exchanges.sort_unstable();
    info!(exchanges = ?exchanges, "market calendar loaded");

    // ── Delivery ──────────────────────────────────────────────────────────────
    let registry = Arc::new(ConnectionRegistry::new());
    let mut dispatcher = NotificationDispatcher::new(Arc::clone(&registry));
    if config.notifications.terminal {
        dispatcher = dispatcher.with_channel(Arc::new(TerminalNotifier));
    }
    if !config.notifications.webhook_url.is_empty() {
        let webhook = WebhookNotifier::new(&config.notifications.webhook_url)
            .change_context(AppError::Config)?;
        dispatcher = dispatcher.with_channel(Arc::new(webhook));
    }
    info!(channels = dispatcher.channel_count(), "notification channels ready");

    let evaluator = Arc::new(TriggerEvaluator::new(
        calendar,
        storage.clone(),
        Arc::new(dispatcher),
    ));

    // ── Tasks ─────────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .change_context(AppError::Server)
        .attach_with(|| format!("bind_addr: {}", config.server.bind_addr))?;
    tracker.spawn(websocket::serve(
        listener,
        Arc::clone(&registry),
        cancel.clone(),
        tracker.clone(),
    ));

    if config.feed.enabled {
        let source = TwelveDataSource::new(&config.feed).change_context(AppError::Config)?;
        let feed = PriceFeed::new(
            Arc::new(source),
            storage,
            Arc::clone(&evaluator),
            Duration::from_secs(config.feed.interval_secs),
            config.feed.max_concurrency,
        );
        let feed_cancel = cancel.clone();
        tracker.spawn(async move { feed.run(feed_cancel).await });
    } else {
        tracing::warn!("price feed disabled, no prices will be evaluated");
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    let notified = websocket::shut_down(&registry, &cancel).await;
    info!(notified, "shutdown notice sent");

    tracker.close();
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("tasks still running after shutdown timeout");
    }

    info!("shutdown complete");
    Ok(())
}

async fn run_stock_command(
    action: StockCommand,
    service: &TriggerService,
) -> Result<(), Report<AppError>> {
    match action {
        StockCommand::Add {
            symbol,
            exchange,
            name,
        } => {
            let stock = service
                .track_instrument(&symbol, &exchange, &name)
                .await
                .change_context(AppError::Storage)?;
            println!("{} {}", stock.stock_id, stock.instrument());
        }
        StockCommand::List => {
            let stocks = service
                .list_instruments()
                .await
                .change_context(AppError::Storage)?;
            for stock in stocks {
                println!(
                    "{}\t{}\t{}\t{} trigger(s)",
                    stock.stock_id,
                    stock.instrument(),
                    stock.name,
                    stock.trigger_ids.len()
                );
            }
        }
    }
    Ok(())
}

async fn run_trigger_command(
    action: TriggerCommand,
    config: &AppConfig,
    service: &TriggerService,
) -> Result<(), Report<AppError>> {
    match action {
        TriggerCommand::Add {
            user,
            symbol,
            exchange,
            kind,
            value,
            indicator,
            cooldown,
        } => {
            let condition = build_condition(&kind, value, indicator.as_deref())?;
            let trigger = service
                .create(NewTrigger {
                    user_id: user,
                    symbol,
                    exchange,
                    condition,
                    cooldown_minutes: cooldown.unwrap_or(config.general.default_cooldown_minutes),
                })
                .await
                .change_context(AppError::Trigger)?;
            println!("{}", trigger.trigger_id);
        }
        TriggerCommand::List { user } => {
            let triggers = service
                .list_for_user(&user)
                .await
                .change_context(AppError::Trigger)?;
            for t in triggers {
                let last_fired = t
                    .last_fired_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{}\t{}\t{}\t{}\tcooldown={}m\tlast_fired={}",
                    t.trigger_id,
                    t.instrument(),
                    t.condition,
                    if t.is_active { "active" } else { "inactive" },
                    t.cooldown_minutes,
                    last_fired
                );
            }
        }
        TriggerCommand::Remove { trigger_id } => {
            service
                .delete(&trigger_id)
                .await
                .change_context(AppError::Trigger)?;
        }
        TriggerCommand::Enable { trigger_id } => {
            service
                .set_active(&trigger_id, true)
                .await
                .change_context(AppError::Trigger)?;
        }
        TriggerCommand::Disable { trigger_id } => {
            service
                .set_active(&trigger_id, false)
                .await
                .change_context(AppError::Trigger)?;
        }
    }
    Ok(())
}

fn build_condition(
    kind: &str,
    value: f64,
    indicator: Option<&str>,
) -> Result<TriggerCondition, Report<AppError>> {
    let condition = match kind {
        "upper" => TriggerCondition::PriceUpperLimit { threshold: value },
        "lower" => TriggerCondition::PriceLowerLimit { threshold: value },
        "percent" => TriggerCondition::PriceChangePercent { percent: value },
        "volume" => TriggerCondition::VolumeSpike { multiplier: value },
        "indicator" => {
            let name = indicator.unwrap_or_default();
            let Some(indicator) = IndicatorKind::from_str(name) else {
                return Err(
                    Report::new(AppError::Argument).attach(format!("unknown indicator: {name:?}"))
                );
            };
            TriggerCondition::Indicator {
                indicator,
                threshold: value,
            }
        }
        other => {
            return Err(Report::new(AppError::Argument).attach(format!("unknown kind: {other}")));
        }
    };
    Ok(condition)
}
