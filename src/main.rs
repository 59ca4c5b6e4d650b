//! `predictpool`: lifecycle scheduler and operator tools.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use predictpool_backend::{
    config::PoolConfig,
    lifecycle::{EventRefresher, LifecycleEngine, Scheduler, WindowGenerator},
    price::{HttpPriceSource, PriceSource},
    settlement::{reward_report, RpcSettlementSink, SettlementSink},
    store::PoolDb,
};
use std::{path::Path, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "predictpool")]
#[command(about = "Epoch/round lifecycle scheduler for the prediction pool")]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Log level for this crate, e.g. `debug` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,

    /// Run one window-generation pass and exit
    Generate,

    /// Print upcoming and overdue transition events
    Refresh {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Compute per-user rewards and APY from the vault contract
    Rewards {
        #[arg(long)]
        display_scale_factor: Option<i64>,
    },

    /// Show the best predictors of an epoch (latest completed if omitted)
    Leaderboard {
        #[arg(long)]
        epoch: Option<i64>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(format!("predictpool_backend={level}")),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "predictpool_backend=info".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut cfg = PoolConfig::from_env();
    if let Some(path) = cli.db_path {
        cfg.database_path = path;
    }
    cfg.validate().context("Invalid configuration")?;
    let cfg = Arc::new(cfg);

    let db = PoolDb::new(&cfg.database_path)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cfg, db).await,
        Commands::Generate => {
            let report = WindowGenerator::new(db, cfg).run(Utc::now())?;
            println!(
                "created {} epochs, {} already present",
                report.created, report.skipped
            );
            Ok(())
        }
        Commands::Refresh { limit } => print_events(&cfg, db, limit),
        Commands::Rewards {
            display_scale_factor,
        } => {
            let sink = RpcSettlementSink::new(&cfg)?;
            let factor = display_scale_factor.unwrap_or(cfg.display_scale_factor);
            let report = reward_report(&sink, &db, factor, cfg.periods_per_year()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Leaderboard { epoch, limit } => print_leaderboard(&db, epoch, limit),
    }
}

async fn run(cfg: Arc<PoolConfig>, db: PoolDb) -> Result<()> {
    info!("🚀 Starting PredictPool lifecycle backend");
    info!(
        "📐 Epoch {}s, {} rounds, lock fraction {}, horizon {}s",
        cfg.epoch_duration_secs,
        cfg.rounds_per_epoch,
        cfg.round_lock_fraction,
        cfg.generation_horizon_secs
    );

    let price = HttpPriceSource::new(&cfg)?;
    info!("💱 Price feed: {}", price.url());
    let price: Arc<dyn PriceSource> = Arc::new(price);
    let sink: Arc<dyn SettlementSink> =
        Arc::new(RpcSettlementSink::new(&cfg).context("Settlement sink not configured")?);

    let engine = Arc::new(LifecycleEngine::new(db.clone(), price, sink));
    let scheduler = Scheduler::new(engine);
    scheduler.start(
        WindowGenerator::new(db.clone(), cfg.clone()),
        EventRefresher::new(db, cfg.clone()),
        cfg.generator_interval(),
        cfg.refresh_interval(),
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("🛑 Shutdown signal received");
    scheduler.shutdown();
    Ok(())
}

fn print_events(cfg: &Arc<PoolConfig>, db: PoolDb, limit: usize) -> Result<()> {
    let refresher = EventRefresher::new(db, cfg.clone());
    let now = Utc::now();

    let overdue = refresher.overdue(now)?;
    if !overdue.is_empty() {
        println!("=== Overdue ({}) ===", overdue.len());
        for e in &overdue {
            println!("{:<45} {}", e.key.to_string(), e.due);
        }
        println!();
    }

    let upcoming = refresher.upcoming(now)?;
    println!("=== Upcoming ({} total) ===", upcoming.len());
    for e in upcoming.iter().take(limit) {
        println!("{:<45} {}", e.key.to_string(), e.due);
    }
    Ok(())
}

fn print_leaderboard(db: &PoolDb, epoch: Option<i64>, limit: usize) -> Result<()> {
    let epoch_id = match epoch {
        Some(id) => Some(id),
        None => db
            .latest_completed_epoch()?
            .or(db.current_epoch()?)
            .map(|e| e.id),
    };
    let Some(epoch_id) = epoch_id else {
        println!("No epoch to rank yet");
        return Ok(());
    };

    println!("=== Epoch {} leaderboard ===", epoch_id);
    println!(
        "{:<4} {:<44} {:>8} {:>6} {:>9} {:>7}",
        "#", "address", "correct", "total", "accuracy", "weight"
    );
    for (i, row) in db.leaderboard(epoch_id, limit)?.iter().enumerate() {
        println!(
            "{:<4} {:<44} {:>8} {:>6} {:>8.1}% {:>7}",
            i + 1,
            row.user_address,
            row.correct_predictions,
            row.total_predictions,
            row.accuracy * 100.0,
            row.weight
        );
    }
    Ok(())
}
