use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use typed_builder::TypedBuilder;
use url::Url;

use crate::compile::UrlCompiler;
use crate::config::CrawlerSettings;
use crate::configuration::{filter_selection, CrawlConfiguration};
use crate::error::{CrawlerError, Result};
use crate::exclude::ExcludeCache;
use crate::expand::{ExpandedParameters, ParameterExpander};
use crate::traits::{
    Clock, ConfigurationSource, CrawlerStorage, ExpansionHook, PageTree, PageVeto, RecordLookup,
};
use crate::types::{NewQueueEntry, PageRow, DISALLOWED_DOKTYPES};
use crate::writer::{QueueWriter, UrlJob};

const SCRIPT_NAME: &str = "index.php";

/// What a generation pass does with the URLs it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Write queue entries
    Submit,
    /// Collect the unique URLs
    Download,
    /// Only report
    Preview,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct GenerationOptions {
    #[builder(default = GenerationMode::Preview)]
    pub mode: GenerationMode,
    #[builder(default = 30)]
    pub requests_per_minute: i64,
    /// Processing instructions a configuration must serve, empty for all
    #[builder(default)]
    pub proc_instructions: Vec<String>,
    /// Configuration keys to use, empty for all
    #[builder(default)]
    pub selection: Vec<String>,
    /// Base scheduling time, defaults to now
    #[builder(default, setter(strip_option))]
    pub scheduled: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStatus {
    Scheduled,
    /// Emitted earlier in the same pass
    AlreadySeen,
    /// An equivalent unexecuted entry is already in the queue
    AlreadyQueued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLine {
    pub url: String,
    /// `None` for URLs already seen in this pass
    pub scheduled: Option<i64>,
    pub status: UrlStatus,
}

#[derive(Debug, Clone)]
pub struct ConfigurationReport {
    pub key: String,
    /// The page is covered by the configuration's exclude list
    pub excluded: bool,
    pub expanded: ExpandedParameters,
    pub urls: Vec<UrlLine>,
}

#[derive(Debug, Clone)]
pub enum PageOutcome {
    Skipped(String),
    Configurations(Vec<ConfigurationReport>),
}

#[derive(Debug, Clone)]
pub struct PageReport {
    pub page: PageRow,
    pub outcome: PageOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub set_id: i64,
    pub pages: Vec<PageReport>,
    /// Unique URLs in emission order (download mode)
    pub download_urls: Vec<String>,
    /// Entries collected instead of written (internal registration)
    pub queue_entries: Vec<NewQueueEntry>,
}

impl PageReport {
    pub fn configurations(&self) -> &[ConfigurationReport] {
        match &self.outcome {
            PageOutcome::Skipped(_) => &[],
            PageOutcome::Configurations(configs) => configs,
        }
    }
}

impl GenerationReport {
    pub fn url_lines(&self) -> impl Iterator<Item = &UrlLine> {
        self.pages
            .iter()
            .flat_map(|page| page.configurations().iter())
            .flat_map(|c| c.urls.iter())
    }

    pub fn count(&self, status: UrlStatus) -> usize {
        self.url_lines().filter(|l| l.status == status).count()
    }
}

/// In-pass set of emitted `(url, user groups, instruction filter)` keys.
#[derive(Debug, Default)]
pub struct DuplicateTracker {
    seen: HashSet<String>,
}

impl DuplicateTracker {
    pub fn key(url: &str, user_groups: &str, proc_instr_filter: &str) -> String {
        format!("{}|{}|{}", url, user_groups, proc_instr_filter)
    }

    /// Record a key. Returns false when it was already seen.
    pub fn register(&mut self, key: String) -> bool {
        self.seen.insert(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Scheduling time of the n-th unique URL of a pass, floored to the minute.
pub fn schedule_time(base: i64, n: usize, requests_per_minute: i64) -> i64 {
    let requests_per_minute = requests_per_minute.max(1);
    let scheduled = base + (n as i64 * 60) / requests_per_minute;
    scheduled - scheduled.rem_euclid(60)
}

/// Walks a page tree and turns its crawl configurations into queue entries.
pub struct JobGenerator {
    storage: Arc<dyn CrawlerStorage>,
    tree: Arc<dyn PageTree>,
    configurations: Arc<dyn ConfigurationSource>,
    clock: Arc<dyn Clock>,
    expander: ParameterExpander,
    compiler: UrlCompiler,
    settings: CrawlerSettings,
    vetoes: Vec<Arc<dyn PageVeto>>,
    exclude_cache: ExcludeCache,
    register_internally: bool,
}

impl JobGenerator {
    pub fn new(
        storage: Arc<dyn CrawlerStorage>,
        tree: Arc<dyn PageTree>,
        configurations: Arc<dyn ConfigurationSource>,
        lookup: Arc<dyn RecordLookup>,
        clock: Arc<dyn Clock>,
        settings: CrawlerSettings,
    ) -> Self {
        Self {
            expander: ParameterExpander::new(lookup, tree.clone()),
            compiler: UrlCompiler::new(settings.max_compile_urls),
            storage,
            tree,
            configurations,
            clock,
            settings,
            vetoes: Vec::new(),
            exclude_cache: ExcludeCache::new(),
            register_internally: false,
        }
    }

    pub fn with_veto(mut self, veto: Arc<dyn PageVeto>) -> Self {
        self.vetoes.push(veto);
        self
    }

    pub fn with_expansion_hook(mut self, hook: Arc<dyn ExpansionHook>) -> Self {
        self.expander = self.expander.with_hook(hook);
        self
    }

    /// Collect submitted entries in the report instead of writing them.
    pub fn register_internally(mut self, enabled: bool) -> Self {
        self.register_internally = enabled;
        self
    }

    /// Why a page gets no URLs at all, `None` when it is crawlable.
    pub fn skip_reason(&self, page: &PageRow) -> Option<String> {
        if page.hidden && !self.settings.crawl_hidden_pages {
            return Some("Because page is hidden".to_string());
        }

        if DISALLOWED_DOKTYPES.contains(&page.doktype) {
            return Some("Because doktype is not allowed".to_string());
        }

        if let Some(group) = self
            .settings
            .exclude_doktypes
            .iter()
            .find(|(_, doktypes)| doktypes.contains(&page.doktype))
            .map(|(group, _)| group)
        {
            return Some(format!("Doktype was excluded by \"{}\"", group));
        }

        self.vetoes.iter().find_map(|veto| {
            veto.veto(page).map(|reason| {
                if reason.is_empty() {
                    format!("Veto from hook \"{}\"", veto.name())
                } else {
                    reason
                }
            })
        })
    }

    /// Generate URLs for `root` and its subtree down to `depth` levels.
    pub async fn generate(
        &mut self,
        root: i64,
        depth: i64,
        options: &GenerationOptions,
    ) -> Result<GenerationReport> {
        let mut pages = Vec::new();
        if let Some(page) = self.tree.page(root).await? {
            pages.push(page);
        }
        if depth > 0 {
            pages.extend(self.tree.subtree(root, depth).await?);
        }

        let mut writer = QueueWriter::new(
            self.storage.clone(),
            self.clock.clone(),
            self.settings.duplicate_window(),
        )
        .register_internally(self.register_internally);
        let mut pass = Pass {
            base_time: options.scheduled.unwrap_or_else(|| self.clock.now()),
            tracker: DuplicateTracker::default(),
            download_urls: Vec::new(),
            downloaded: HashSet::new(),
        };

        let mut report = GenerationReport {
            set_id: writer.set_id(),
            ..Default::default()
        };

        for page in pages {
            let outcome = match self.skip_reason(&page) {
                Some(reason) => {
                    debug!(page_id = page.uid, reason = %reason, "Page skipped");
                    PageOutcome::Skipped(reason)
                }
                None => PageOutcome::Configurations(
                    self.generate_for_page(&page, options, &mut writer, &mut pass)
                        .await?,
                ),
            };
            report.pages.push(PageReport { page, outcome });
        }

        report.download_urls = pass.download_urls;
        report.queue_entries = writer.take_queue_entries();

        info!(
            root,
            depth,
            set_id = report.set_id,
            unique_urls = pass.tracker.len(),
            scheduled = report.count(UrlStatus::Scheduled),
            already_queued = report.count(UrlStatus::AlreadyQueued),
            "Generation pass finished"
        );
        Ok(report)
    }

    async fn generate_for_page(
        &mut self,
        page: &PageRow,
        options: &GenerationOptions,
        writer: &mut QueueWriter,
        pass: &mut Pass,
    ) -> Result<Vec<ConfigurationReport>> {
        let configurations: Vec<CrawlConfiguration> = self
            .configurations
            .configurations_for_page(page.uid)
            .await?
            .into_iter()
            .filter(|c| c.applies_to_page(page.uid))
            .collect();

        let mut reports = Vec::new();
        for configuration in filter_selection(configurations, &options.selection) {
            if self
                .exclude_cache
                .contains(&configuration.exclude, page.uid, self.tree.as_ref())
                .await?
            {
                reports.push(ConfigurationReport {
                    key: configuration.key,
                    excluded: true,
                    expanded: ExpandedParameters::new(),
                    urls: Vec::new(),
                });
                continue;
            }

            let expanded = self
                .expander
                .expand(&configuration.parameter_spec(), page.uid)
                .await?;
            let queries = self
                .compiler
                .compile(&expanded, vec![format!("?id={}", page.uid)]);

            let urls = if configuration.accepts_instructions(&options.proc_instructions) {
                self.emit(page.uid, &configuration, &queries, options, writer, pass)
                    .await?
            } else {
                Vec::new()
            };

            reports.push(ConfigurationReport {
                key: configuration.key,
                excluded: false,
                expanded,
                urls,
            });
        }

        Ok(reports)
    }

    async fn emit(
        &self,
        page_id: i64,
        configuration: &CrawlConfiguration,
        queries: &[String],
        options: &GenerationOptions,
        writer: &mut QueueWriter,
        pass: &mut Pass,
    ) -> Result<Vec<UrlLine>> {
        let configuration_hash = configuration.configuration_hash();
        let skip_inner_check = options.mode == GenerationMode::Submit
            && self
                .storage
                .no_unprocessed_entries_for_configuration(page_id, &configuration_hash)
                .await?;

        let mut lines = Vec::with_capacity(queries.len());
        for query in queries {
            let url = absolute_url(
                configuration
                    .base_url
                    .as_deref()
                    .unwrap_or(&self.settings.default_base_url),
                query,
                configuration.force_ssl,
            )?;

            let key = DuplicateTracker::key(
                &url,
                &configuration.user_groups,
                &configuration.normalized_filter(),
            );
            if pass.tracker.contains(&key) {
                debug!(page_id, url = %url, "URL already seen in this pass");
                lines.push(UrlLine {
                    url,
                    scheduled: None,
                    status: UrlStatus::AlreadySeen,
                });
                continue;
            }

            let scheduled = schedule_time(
                pass.base_time,
                pass.tracker.len(),
                options.requests_per_minute,
            );
            pass.tracker.register(key);

            let status = match options.mode {
                GenerationMode::Submit => {
                    let added = writer
                        .add_url(UrlJob {
                            page_id,
                            url: &url,
                            configuration,
                            scheduled,
                            configuration_hash: &configuration_hash,
                            skip_inner_check,
                        })
                        .await?;
                    if added || writer.is_registering_internally() {
                        UrlStatus::Scheduled
                    } else {
                        UrlStatus::AlreadyQueued
                    }
                }
                GenerationMode::Download => {
                    if pass.downloaded.insert(url.clone()) {
                        pass.download_urls.push(url.clone());
                    }
                    UrlStatus::Scheduled
                }
                GenerationMode::Preview => UrlStatus::Scheduled,
            };

            lines.push(UrlLine {
                url,
                scheduled: Some(scheduled),
                status,
            });
        }

        Ok(lines)
    }
}

/// Per-pass state shared by all pages of one `generate` call.
struct Pass {
    base_time: i64,
    tracker: DuplicateTracker,
    download_urls: Vec<String>,
    downloaded: HashSet<String>,
}

/// `base` + `index.php` + `query`, with the scheme forced to https when asked.
pub fn absolute_url(base: &str, query: &str, force_ssl: bool) -> Result<String> {
    let mut base = Url::parse(base)
        .map_err(|e| CrawlerError::InvalidConfiguration(format!("base url {}: {}", base, e)))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    if force_ssl && base.set_scheme("https").is_err() {
        return Err(CrawlerError::InvalidConfiguration(format!(
            "cannot force https on {}",
            base
        )));
    }

    let url = base
        .join(&format!("{}{}", SCRIPT_NAME, query))
        .map_err(|e| CrawlerError::InvalidConfiguration(format!("url for {}: {}", query, e)))?;
    Ok(url.to_string())
}
