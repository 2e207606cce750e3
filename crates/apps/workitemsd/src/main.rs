//! workitemsd - runs work item syncs and scheduled jobs
//!
//! Usage:
//!   workitemsd sync <user>
//!   workitemsd job <name> <day|hour> <user>

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{error, info, warn};
use workitems::{EngineConfig, EngineContext, Granularity, SyncError, UserId};

const USAGE: &str = "usage: workitemsd sync <user> | workitemsd job <name> <day|hour> <user>";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    if let Err(e) = run(std::env::args().skip(1).collect()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Vec<String>) -> Result<()> {
    let config = EngineConfig::load().context("Failed to load engine config")?;
    let engine = EngineContext::from_config(config).context("Failed to start engine")?;

    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let result = match args.as_slice() {
        ["sync", user] => sync(&engine, &UserId::new(*user)),
        ["job", name, granularity, user] => {
            let granularity = Granularity::parse(granularity)
                .with_context(|| format!("Unknown granularity '{}', expected day or hour", granularity))?;
            job(&engine, name, granularity, &UserId::new(*user))
        }
        _ => bail!(USAGE),
    };

    engine.shutdown();
    result
}

fn sync(engine: &EngineContext, user_id: &UserId) -> Result<()> {
    let report = engine
        .sync_all(user_id)
        .with_context(|| format!("Sync failed for {}", user_id))?;

    for failure in report.escalations() {
        warn!(
            "{} {} ({}) failed: {}",
            failure.source_id, failure.account_id, failure.capability, failure.error
        );
    }
    for record in report.sorted_for_display() {
        println!("{}", serde_json::to_string(record)?);
    }
    info!(
        "Synced {} records for {} ({} failed jobs)",
        report.records.len(),
        user_id,
        report.errors.len()
    );
    Ok(())
}

fn job(engine: &EngineContext, name: &str, granularity: Granularity, user_id: &UserId) -> Result<()> {
    let now = Utc::now();
    let bucket = granularity.bucket(now);
    let outcome = engine
        .jobs()
        .run_once_at(name, granularity, now, |lock| {
            info!("Running job {} for bucket {} as {}", name, lock.bucket, lock.holder);
            engine.sync_all(user_id)
        });

    match outcome {
        Ok(Some(report)) => {
            info!(
                "Job {} finished: {} records, {} failed jobs",
                name,
                report.records.len(),
                report.errors.len()
            );
            Ok(())
        }
        Ok(None) => {
            info!("Job {} already ran for bucket {}", name, bucket);
            Ok(())
        }
        Err(SyncError::Cancelled) => {
            warn!("Job {} cancelled", name);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Job {} failed", name)),
    }
}
