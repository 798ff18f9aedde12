//! Crawler CLI: queue building, the worker run loop and the kill-switch.
//!
//! `run` exits with the status bitmask of the run so a cron wrapper can
//! tell whether work remains.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawl_queue::config::split_list;
use crawl_queue::storage::postgres::migrate;
use crawl_queue::{
    CliStatus, Clock, CommandJobExecutor, CrawlerSettings, CrawlerStorage, FileCrawlerSwitch,
    GenerationMode, GenerationOptions, JobGenerator, MemoryStorage, PostgresStorage,
    ProcessManager, RunLoop, StaticSite, SystemClock, UrlStatus,
};

#[derive(Parser)]
#[command(name = "crawler")]
#[command(about = "Generate crawl jobs and work through the crawl queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim and execute a batch of due queue entries
    Run {
        /// Entries claimed in this run
        #[arg(long)]
        amount: Option<i64>,
        /// Delay between entries in microseconds
        #[arg(long)]
        sleep_time: Option<u64>,
        /// Delay after the batch in seconds
        #[arg(long)]
        sleep_after_finish: Option<u64>,
    },

    /// Generate crawl jobs for a page and its subtree
    BuildQueue {
        /// JSON site definition
        #[arg(long)]
        site: PathBuf,
        /// Root page id
        #[arg(long)]
        page: i64,
        /// Levels below the root page (99 for all)
        #[arg(long, default_value_t = 0)]
        depth: i64,
        #[arg(long, value_enum, default_value_t = BuildMode::Queue)]
        mode: BuildMode,
        #[arg(long, default_value_t = 30)]
        requests_per_minute: i64,
        /// Comma separated processing instructions
        #[arg(long, default_value = "")]
        proc_instr: String,
        /// Comma separated configuration keys
        #[arg(long, default_value = "")]
        conf: String,
    },

    /// Stop all workers after their current entry
    Disable,

    /// Allow workers to run again
    Enable,

    /// Release a worker lease
    Release {
        #[arg(long)]
        process_id: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BuildMode {
    /// Write entries to the queue
    Queue,
    /// Print the URLs only
    Url,
    /// Execute the generated entries right away
    Exec,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawl_queue=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = CrawlerSettings::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            amount,
            sleep_time,
            sleep_after_finish,
        } => {
            let settings = settings.with_count_in_a_run(amount);
            let status = run(
                settings.clone(),
                settings.count_in_a_run,
                sleep_time.unwrap_or(settings.sleep_time),
                sleep_after_finish.unwrap_or(settings.sleep_after_finish),
            )
            .await?;
            tracing::info!(status = %status, "Run finished");
            std::process::exit(i32::from(status.bits()));
        }
        Commands::BuildQueue {
            site,
            page,
            depth,
            mode,
            requests_per_minute,
            proc_instr,
            conf,
        } => {
            let options = GenerationOptions::builder()
                .mode(match mode {
                    BuildMode::Queue | BuildMode::Exec => GenerationMode::Submit,
                    BuildMode::Url => GenerationMode::Download,
                })
                .requests_per_minute(requests_per_minute)
                .proc_instructions(split_list(&proc_instr))
                .selection(split_list(&conf))
                .build();
            build_queue(settings, site, page, depth, mode, options).await?;
        }
        Commands::Disable => {
            FileCrawlerSwitch::new(&settings.disabled_flag_path)
                .disable()
                .context("Failed to disable crawling")?;
        }
        Commands::Enable => {
            FileCrawlerSwitch::new(&settings.disabled_flag_path)
                .enable()
                .context("Failed to enable crawling")?;
        }
        Commands::Release { process_id } => {
            let storage = Arc::new(PostgresStorage::new(connect().await?));
            let manager = ProcessManager::new(storage, Arc::new(SystemClock), &settings);
            let released = manager
                .release(&[process_id.clone()])
                .await
                .context("Failed to release process")?;
            tracing::info!(process_id = %process_id, released, "Release finished");
        }
    }

    Ok(())
}

async fn connect() -> Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    migrate(&pool).await.context("Failed to run migrations")?;
    Ok(pool)
}

fn executor(settings: &CrawlerSettings) -> Result<Arc<CommandJobExecutor>> {
    let command = settings
        .executor_command
        .clone()
        .context("CRAWLER_EXECUTOR_COMMAND must be set")?;
    Ok(Arc::new(CommandJobExecutor::new(
        command,
        Duration::from_secs(settings.executor_timeout),
    )))
}

async fn run(
    settings: CrawlerSettings,
    amount: i64,
    sleep_time: u64,
    sleep_after_finish: u64,
) -> Result<CliStatus> {
    let executor = executor(&settings)?;
    let storage = Arc::new(PostgresStorage::new(connect().await?));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processes = Arc::new(ProcessManager::new(storage.clone(), clock.clone(), &settings));
    let run_loop = RunLoop::new(
        storage,
        executor,
        Arc::new(FileCrawlerSwitch::new(&settings.disabled_flag_path)),
        clock,
        processes,
        settings,
    );

    run_loop
        .run_with_lease(amount, sleep_time, sleep_after_finish)
        .await
        .context("Run failed")
}

async fn build_queue(
    settings: CrawlerSettings,
    site: PathBuf,
    page: i64,
    depth: i64,
    mode: BuildMode,
    options: GenerationOptions,
) -> Result<()> {
    let site = Arc::new(
        StaticSite::load(&site)
            .with_context(|| format!("Failed to load site definition {}", site.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage: Arc<dyn CrawlerStorage> = match mode {
        BuildMode::Url => Arc::new(MemoryStorage::new()),
        BuildMode::Queue | BuildMode::Exec => Arc::new(PostgresStorage::new(connect().await?)),
    };

    let mut generator = JobGenerator::new(
        storage.clone(),
        site.clone(),
        site.clone(),
        site,
        clock.clone(),
        settings.clone(),
    )
    .register_internally(mode == BuildMode::Exec);

    let report = generator.generate(page, depth, &options).await?;

    match mode {
        BuildMode::Url => {
            for url in &report.download_urls {
                println!("{}", url);
            }
        }
        BuildMode::Queue => {
            tracing::info!(
                set_id = report.set_id,
                scheduled = report.count(UrlStatus::Scheduled),
                already_queued = report.count(UrlStatus::AlreadyQueued),
                already_seen = report.count(UrlStatus::AlreadySeen),
                "Queue built"
            );
        }
        BuildMode::Exec => {
            let processes = Arc::new(ProcessManager::new(storage.clone(), clock.clone(), &settings));
            let run_loop = RunLoop::new(
                storage,
                executor(&settings)?,
                Arc::new(FileCrawlerSwitch::new(&settings.disabled_flag_path)),
                clock,
                processes,
                settings,
            );
            for entry in report.queue_entries {
                let page_id = entry.page_id;
                let result = run_loop.read_url_from_array(entry).await?;
                println!(
                    "{} {}",
                    page_id,
                    serde_json::to_string(&result).context("Failed to serialize result")?
                );
            }
        }
    }

    Ok(())
}
