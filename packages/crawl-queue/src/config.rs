use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Crawler settings loaded from environment variables.
///
/// Values are normalized on load: limits are clamped into their valid
/// ranges and zero counts fall back to their defaults.
#[derive(Debug, Clone)]
pub struct CrawlerSettings {
    /// Queue entries claimed per run
    pub count_in_a_run: i64,
    /// Maximum number of concurrently active worker leases
    pub process_limit: i64,
    /// Lease lifetime in seconds
    pub process_max_run_time: i64,
    /// Cap on URLs produced by one compilation
    pub max_compile_urls: usize,
    /// Delay between two queue entries, in microseconds
    pub sleep_time: u64,
    /// Delay after a batch, in seconds
    pub sleep_after_finish: u64,
    pub enable_timeslot: bool,
    /// Half-width of the duplicate window when timeslots are enabled, in seconds
    pub timeslot_window: i64,
    pub crawl_hidden_pages: bool,
    pub clean_up_old_queue_entries: bool,
    /// Executed entries older than this many days are purged
    pub clean_up_processed_age: i64,
    /// Unexecuted entries scheduled more than this many days ago are purged
    pub clean_up_scheduled_age: i64,
    /// Processing instructions whose success is reported as pollable
    pub pollable_instructions: Vec<String>,
    /// Named groups of doktypes that are never crawled
    pub exclude_doktypes: BTreeMap<String, Vec<i64>>,
    pub default_base_url: String,
    pub disabled_flag_path: PathBuf,
    pub executor_command: Option<String>,
    /// Executor timeout in seconds
    pub executor_timeout: u64,
}

pub const DEFAULT_COUNT_IN_A_RUN: i64 = 100;
pub const DEFAULT_MAX_COMPILE_URLS: usize = 10_000;
pub const DEFAULT_TIMESLOT_WINDOW: i64 = 100;

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            count_in_a_run: DEFAULT_COUNT_IN_A_RUN,
            process_limit: 1,
            process_max_run_time: 300,
            max_compile_urls: DEFAULT_MAX_COMPILE_URLS,
            sleep_time: 1000,
            sleep_after_finish: 10,
            enable_timeslot: true,
            timeslot_window: DEFAULT_TIMESLOT_WINDOW,
            crawl_hidden_pages: false,
            clean_up_old_queue_entries: true,
            clean_up_processed_age: 2,
            clean_up_scheduled_age: 7,
            pollable_instructions: Vec::new(),
            exclude_doktypes: BTreeMap::new(),
            default_base_url: "http://localhost/".to_string(),
            disabled_flag_path: PathBuf::from("var/crawler.disabled"),
            executor_command: None,
            executor_timeout: 120,
        }
    }
}

impl CrawlerSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        let settings = Self {
            count_in_a_run: parse_var("CRAWLER_COUNT_IN_A_RUN", defaults.count_in_a_run)?,
            process_limit: parse_var("CRAWLER_PROCESS_LIMIT", defaults.process_limit)?,
            process_max_run_time: parse_var(
                "CRAWLER_PROCESS_MAX_RUN_TIME",
                defaults.process_max_run_time,
            )?,
            max_compile_urls: parse_var("CRAWLER_MAX_COMPILE_URLS", defaults.max_compile_urls)?,
            sleep_time: parse_var("CRAWLER_SLEEP_TIME", defaults.sleep_time)?,
            sleep_after_finish: parse_var(
                "CRAWLER_SLEEP_AFTER_FINISH",
                defaults.sleep_after_finish,
            )?,
            enable_timeslot: parse_var("CRAWLER_ENABLE_TIMESLOT", defaults.enable_timeslot)?,
            timeslot_window: parse_var("CRAWLER_TIMESLOT_WINDOW", defaults.timeslot_window)?,
            crawl_hidden_pages: parse_var(
                "CRAWLER_CRAWL_HIDDEN_PAGES",
                defaults.crawl_hidden_pages,
            )?,
            clean_up_old_queue_entries: parse_var(
                "CRAWLER_CLEAN_UP_OLD_QUEUE_ENTRIES",
                defaults.clean_up_old_queue_entries,
            )?,
            clean_up_processed_age: parse_var(
                "CRAWLER_CLEAN_UP_PROCESSED_AGE",
                defaults.clean_up_processed_age,
            )?,
            clean_up_scheduled_age: parse_var(
                "CRAWLER_CLEAN_UP_SCHEDULED_AGE",
                defaults.clean_up_scheduled_age,
            )?,
            pollable_instructions: env::var("CRAWLER_POLLABLE_INSTRUCTIONS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            exclude_doktypes: match env::var("CRAWLER_EXCLUDE_DOKTYPES") {
                Ok(v) => parse_doktype_groups(&v)
                    .context("CRAWLER_EXCLUDE_DOKTYPES must look like name:1,2;other:7")?,
                Err(_) => BTreeMap::new(),
            },
            default_base_url: env::var("CRAWLER_DEFAULT_BASE_URL")
                .unwrap_or(defaults.default_base_url),
            disabled_flag_path: env::var("CRAWLER_DISABLED_FLAG")
                .map(PathBuf::from)
                .unwrap_or(defaults.disabled_flag_path),
            executor_command: env::var("CRAWLER_EXECUTOR_COMMAND").ok(),
            executor_timeout: parse_var("CRAWLER_EXECUTOR_TIMEOUT", defaults.executor_timeout)?,
        };

        Ok(settings.normalized())
    }

    /// Clamp every limit into its valid range.
    pub fn normalized(mut self) -> Self {
        if self.count_in_a_run <= 0 {
            self.count_in_a_run = DEFAULT_COUNT_IN_A_RUN;
        }
        self.process_limit = self.process_limit.clamp(1, 99);
        self.process_max_run_time = self.process_max_run_time.max(1);
        self.max_compile_urls = self.max_compile_urls.clamp(1, 1_000_000_000);
        self.timeslot_window = self.timeslot_window.max(0);
        self
    }

    /// Apply a per-run batch size override, clamped like the env value.
    pub fn with_count_in_a_run(mut self, count: Option<i64>) -> Self {
        if let Some(count) = count {
            self.count_in_a_run = count;
        }
        self.normalized()
    }

    /// Window used by the persisted duplicate check, `None` when timeslots are off.
    pub fn duplicate_window(&self) -> Option<i64> {
        self.enable_timeslot.then_some(self.timeslot_window)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

/// Split a comma separated list, trimming entries and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_doktype_groups(value: &str) -> Result<BTreeMap<String, Vec<i64>>> {
    let mut groups = BTreeMap::new();
    for group in value.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let (name, list) = group
            .split_once(':')
            .with_context(|| format!("missing ':' in doktype group {}", group))?;
        let doktypes = split_list(list)
            .iter()
            .map(|d| d.parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("invalid doktype in group {}", name))?;
        groups.insert(name.trim().to_string(), doktypes);
    }
    Ok(groups)
}
