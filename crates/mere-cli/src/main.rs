use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use mere_engine::EngineConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mere")]
#[command(about = "Month-end reconciliation engine")]
struct Cli {
    /// Log filter, tracing EnvFilter syntax.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the cron-driven scheduler until interrupted.
    Run,
    /// Execute one scheduler pass now and exit.
    Tick,
    /// Schedule reconciliation for a district and month-end date.
    Schedule {
        district_id: String,
        /// Month-end date, `YYYY-MM-DD`.
        month_end: NaiveDate,
    },
    /// List active reconciliation jobs.
    Jobs,
    /// Print a job's day-by-day check timeline.
    Timeline { job_id: Uuid },
    /// Cancel an active job.
    Cancel { job_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let engine_config = EngineConfig::from_env();
    let (scheduler, service) = mere_engine::build_from_env(&engine_config).await?;

    match cli.command {
        Commands::Run => {
            let mut sched = scheduler
                .build_cron_scheduler(&engine_config.tick_cron)
                .await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %engine_config.tick_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
        }
        Commands::Tick => {
            let summary = scheduler.tick(Utc::now()).await?;
            println!(
                "tick complete: created={} dispatched={} dropped={} failures={} retired={}",
                summary.jobs_created,
                summary.cycles_dispatched,
                summary.ticks_dropped,
                summary.cycle_failures,
                summary.jobs_retired
            );
        }
        Commands::Schedule {
            district_id,
            month_end,
        } => {
            let job = service
                .schedule_month_end_reconciliation(&district_id, month_end, Utc::now())
                .await?;
            println!(
                "job {} for {} {} (max end {})",
                job.id, job.district_id, job.target_month, job.max_end_date
            );
        }
        Commands::Jobs => {
            for job in service.list_active_jobs().await? {
                println!(
                    "{} {} {} status={} checks={} max_end={}",
                    job.id,
                    job.district_id,
                    job.target_month,
                    job.status,
                    job.progress.timeline().len(),
                    job.max_end_date
                );
            }
        }
        Commands::Timeline { job_id } => {
            for entry in service.get_reconciliation_timeline(job_id).await? {
                println!(
                    "{} as_of={} significant={} cache_updated={} fields={:?}",
                    entry.date,
                    entry.source_data_date,
                    entry.is_significant,
                    entry.cache_updated,
                    entry.changes.changed_fields
                );
            }
        }
        Commands::Cancel { job_id } => {
            let job = service.cancel_reconciliation(job_id, Utc::now()).await?;
            println!("job {} now {}", job.id, job.status);
        }
    }

    Ok(())
}
