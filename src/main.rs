//! `swarmsched-cli` — manual exercising of the scheduling engine against a
//! local SQLite database: schedule, reap, update, cancel, and the two cron
//! sweeps.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swarmsched::adapters::sqlite::{initialize_database, SqliteRequestStore, SqliteResultTracker, SqliteRunQueue};
use swarmsched::adapters::stats::LoggingStatsSink;
use swarmsched::domain::models::{DataRef, NewTaskRequest, TaskProperties};
use swarmsched::domain::ports::{AllowAll, CallerContext};
use swarmsched::infrastructure::config::ConfigLoader;
use swarmsched::infrastructure::logging::LoggerImpl;
use swarmsched::Scheduler;

#[derive(Parser)]
#[command(name = "swarmsched-cli", about = "Manual driver for the swarmsched scheduling engine")]
struct Cli {
    /// Print results as JSON instead of a human-readable summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule a new task request.
    Schedule {
        name: String,
        user: String,
        #[arg(long, default_value = "50")]
        priority: u8,
        /// Argv for a single command; repeat `--command` for a multi-step task.
        #[arg(long = "command", required = true)]
        commands: Vec<String>,
        #[arg(long, default_value = "3600")]
        expiration_secs: i64,
        #[arg(long, default_value = "60")]
        execution_timeout_secs: i64,
        #[arg(long, default_value = "60")]
        io_timeout_secs: i64,
        #[arg(long)]
        idempotent: bool,
        /// `key=value` dimension pairs, repeatable.
        #[arg(long = "dimension")]
        dimensions: Vec<String>,
        #[arg(long)]
        parent_task_id: Option<String>,
    },
    /// Poll for and claim the next matching task for a bot.
    Reap {
        bot_id: String,
        #[arg(long, default_value = "bot-version-1")]
        bot_version: String,
        /// `key=value` dimension pairs this bot satisfies, repeatable.
        #[arg(long = "dimension")]
        dimensions: Vec<String>,
    },
    /// Report a command result for a claimed attempt.
    Update {
        request_id: u64,
        try_number: u32,
        bot_id: String,
        #[arg(long, default_value = "0")]
        command_index: u32,
        #[arg(long)]
        exit_code: Option<i32>,
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long, default_value = "0.0")]
        cost_usd: f64,
    },
    /// Cancel a still-pending request.
    Cancel { request_id: u64 },
    /// Run the bot-died sweep once.
    CronBotDied,
    /// Run the expired-task-to-run sweep once.
    CronExpire,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _logger = LoggerImpl::init(&config.logging).context("failed to initialize logging")?;

    let pool = initialize_database(&config.database.url)
        .await
        .context("failed to initialize database")?;

    let scheduler = Scheduler::new(
        Arc::new(SqliteRequestStore::new(pool.clone())),
        Arc::new(SqliteRunQueue::new(pool.clone())),
        Arc::new(SqliteResultTracker::new(pool.clone())),
        Arc::new(LoggingStatsSink),
        config.settings,
    )?;

    match cli.command {
        Command::Schedule {
            name,
            user,
            priority,
            commands,
            expiration_secs,
            execution_timeout_secs,
            io_timeout_secs,
            idempotent,
            dimensions,
            parent_task_id,
        } => {
            let data = NewTaskRequest {
                name,
                user,
                priority,
                properties: TaskProperties {
                    commands: vec![commands],
                    data: Vec::<DataRef>::new(),
                    dimensions: parse_dimensions(&dimensions),
                    env: BTreeMap::new(),
                    execution_timeout_secs,
                    io_timeout_secs,
                    idempotent,
                },
                scheduling_expiration_secs: expiration_secs,
                parent_task_id,
                tags: Vec::new(),
            };
            let caller = CallerContext::new("cli");
            let summary = scheduler.schedule_request(data, &caller, &AllowAll).await?;
            print_result(cli.json, &summary)?;
        }
        Command::Reap { bot_id, bot_version, dimensions } => {
            let bot_dimensions = parse_bot_dimensions(&dimensions);
            let reaped = scheduler.bot_reap_task(&bot_dimensions, &bot_id, &bot_version).await?;
            match reaped {
                Some((request, run)) => print_result(cli.json, &(request, run))?,
                None => println!("no matching work available"),
            }
        }
        Command::Update { request_id, try_number, bot_id, command_index, exit_code, duration, cost_usd } => {
            let (accepted, terminal) = scheduler
                .bot_update_task(
                    request_id,
                    try_number,
                    &bot_id,
                    &[],
                    command_index,
                    0,
                    exit_code,
                    duration,
                    false,
                    false,
                    cost_usd,
                )
                .await?;
            print_result(cli.json, &serde_json::json!({ "accepted": accepted, "terminal": terminal }))?;
        }
        Command::Cancel { request_id } => {
            let caller = CallerContext::new("cli");
            let (ok, was_running) = scheduler.cancel_task(request_id, &caller, &AllowAll).await?;
            print_result(cli.json, &serde_json::json!({ "canceled": ok, "was_running": was_running }))?;
        }
        Command::CronBotDied => {
            let (retried, terminal, denied) = scheduler.cron_handle_bot_died().await?;
            print_result(
                cli.json,
                &serde_json::json!({ "retried": retried, "terminal": terminal, "denied": denied }),
            )?;
        }
        Command::CronExpire => {
            let aborted = scheduler.cron_abort_expired_task_to_run().await?;
            print_result(cli.json, &serde_json::json!({ "aborted": aborted }))?;
        }
    }

    Ok(())
}

fn parse_dimensions(pairs: &[String]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_bot_dimensions(pairs: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut dimensions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in pairs {
        if let Some((k, v)) = pair.split_once('=') {
            dimensions.entry(k.to_string()).or_default().push(v.to_string());
        }
    }
    dimensions
}

fn print_result<T: serde::Serialize>(as_json: bool, value: &T) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
