use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use classcatch_core::{Channel, EnrollmentChange};
use classcatch_storage::{CourseStore, MemoryStore, PgStore, ProxyStore};
use classcatch_sync::{
    maybe_build_scheduler, recent_reports, ChangeHook, ClassCatchConfig, ProxyRefresh,
    RunOutcome, ScrapePipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "classcatch")]
#[command(about = "Course timetable scraper with a verified proxy pool")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch proxy candidates and run the verification funnel.
    RefreshProxies,
    /// Scrape one term and reconcile it into the course table.
    Scrape {
        #[arg(long)]
        term: Option<String>,
        /// Use an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// List stored proxies with per-channel health.
    Proxies,
    Migrate,
    /// Run the refresh and scrape cron jobs until interrupted.
    Schedule,
    /// Show the most recent run report directories.
    Reports {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

/// Logs each committed enrollment change.
struct LogChangeHook;

impl ChangeHook for LogChangeHook {
    fn on_changes(&self, term: &str, changes: &[EnrollmentChange]) -> Result<()> {
        for change in changes {
            info!(
                term,
                course = %change.key,
                previous = change.previous_enrollment,
                current = change.new_enrollment,
                limit = change.limit,
                opened_up = change.opened_up(),
                "enrollment changed"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ClassCatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape {
        term: None,
        dry_run: false,
    }) {
        Commands::RefreshProxies => {
            let store = connect(&config).await?;
            let report = ProxyRefresh::from_config(&config, store)?.run_once().await?;
            println!(
                "proxy refresh complete: checked={} alive={} requests_working={} browser_working={}",
                report.checked, report.stage1_passed, report.requests.working, report.browser.working
            );
        }
        Commands::Scrape { term, dry_run } => {
            let term = term.unwrap_or_else(|| config.term.clone());
            let pipeline = if dry_run {
                let store = Arc::new(MemoryStore::new());
                build_pipeline(&config, &term, store.clone(), store)
            } else {
                let store = connect(&config).await?;
                build_pipeline(&config, &term, store.clone(), store)
            };
            let summary = pipeline.run_once(&term).await?;
            println!(
                "scrape {}: run_id={} created={} updated={} changes={} reports={}",
                term,
                summary.run_id,
                summary.created,
                summary.updated,
                summary.changes.len(),
                summary.reports_dir
            );
            if let RunOutcome::Failure { reason } = summary.outcome {
                bail!("scrape run {} failed: {reason}", summary.run_id);
            }
        }
        Commands::Proxies => {
            let store = connect(&config).await?;
            let now = Utc::now();
            let window = config.freshness_window();
            let mut records = store.proxies().await.context("listing proxies")?;
            records.sort_by(|a, b| b.latest_verification().cmp(&a.latest_verification()));
            for record in records {
                let describe = |channel: Channel| {
                    let health = record.health(channel);
                    let state = if health.is_fresh(now, window) {
                        "fresh"
                    } else if health.is_working {
                        "stale"
                    } else {
                        "down"
                    };
                    let seen = health
                        .last_verified
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    format!("{channel}={state} ({seen})")
                };
                println!(
                    "{}\t{}\t{}",
                    record.addr,
                    describe(Channel::Requests),
                    describe(Channel::Browser)
                );
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let store = connect(&config).await?;
            let refresh = Arc::new(ProxyRefresh::from_config(&config, store.clone())?);
            let scrape = Arc::new(build_pipeline(&config, &config.term, store.clone(), store));
            let Some(sched) = maybe_build_scheduler(&config, refresh, scrape).await? else {
                bail!("scheduler disabled; set CLASSCATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                refresh_cron = %config.refresh_cron,
                scrape_cron = %config.scrape_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::Reports { runs } => {
            for dir in recent_reports(&config.reports_root(), runs)? {
                println!("{}", dir.display());
            }
        }
    }

    Ok(())
}

async fn connect(config: &ClassCatchConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    Ok(Arc::new(store))
}

fn build_pipeline(
    config: &ClassCatchConfig,
    term: &str,
    proxies: Arc<dyn ProxyStore>,
    courses: Arc<dyn CourseStore>,
) -> ScrapePipeline {
    ScrapePipeline::new(config.clone(), Arc::new(config.fetcher(term)), proxies, courses)
        .with_change_hook(Box::new(LogChangeHook))
}
