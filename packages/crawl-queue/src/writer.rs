use std::sync::Arc;
use tracing::debug;

use crate::configuration::CrawlConfiguration;
use crate::error::Result;
use crate::hash::{new_set_id, short_hash};
use crate::traits::{Clock, CrawlerStorage, DuplicateQuery};
use crate::types::{JobParameters, NewQueueEntry};

/// A compiled URL ready to become a queue entry.
#[derive(Debug, Clone)]
pub struct UrlJob<'a> {
    pub page_id: i64,
    pub url: &'a str,
    pub configuration: &'a CrawlConfiguration,
    pub scheduled: i64,
    pub configuration_hash: &'a str,
    /// Caller proved no unexecuted entry of this configuration exists for the page
    pub skip_inner_check: bool,
}

/// Persists generated jobs, or collects them in memory when registering
/// internally.
pub struct QueueWriter {
    storage: Arc<dyn CrawlerStorage>,
    clock: Arc<dyn Clock>,
    window: Option<i64>,
    set_id: i64,
    register_internally: bool,
    queue_entries: Vec<NewQueueEntry>,
}

impl QueueWriter {
    pub fn new(storage: Arc<dyn CrawlerStorage>, clock: Arc<dyn Clock>, window: Option<i64>) -> Self {
        Self {
            storage,
            clock,
            window,
            set_id: new_set_id(),
            register_internally: false,
            queue_entries: Vec::new(),
        }
    }

    /// Collect entries in memory instead of writing them to storage.
    pub fn register_internally(mut self, enabled: bool) -> Self {
        self.register_internally = enabled;
        self
    }

    pub fn with_set_id(mut self, set_id: i64) -> Self {
        self.set_id = set_id;
        self
    }

    pub fn set_id(&self) -> i64 {
        self.set_id
    }

    pub fn is_registering_internally(&self) -> bool {
        self.register_internally
    }

    /// Entries collected while registering internally.
    pub fn queue_entries(&self) -> &[NewQueueEntry] {
        &self.queue_entries
    }

    pub fn take_queue_entries(&mut self) -> Vec<NewQueueEntry> {
        std::mem::take(&mut self.queue_entries)
    }

    /// Queue a URL.
    ///
    /// Returns true only when a new row was written. Internal registration
    /// and duplicates both report false.
    pub async fn add_url(&mut self, job: UrlJob<'_>) -> Result<bool> {
        let entry = self.build_entry(&job)?;

        if self.register_internally {
            self.queue_entries.push(entry);
            return Ok(false);
        }

        if !job.skip_inner_check {
            let query = DuplicateQuery {
                page_id: entry.page_id,
                parameters_hash: entry.parameters_hash.clone(),
                scheduled: entry.scheduled,
                now: self.clock.now(),
                window: self.window,
            };
            let duplicates = self.storage.find_duplicates(&query).await?;
            if !duplicates.is_empty() {
                debug!(
                    page_id = entry.page_id,
                    url = job.url,
                    existing = ?duplicates,
                    "Queue entry already exists"
                );
                return Ok(false);
            }
        }

        let qid = self.storage.insert(entry).await?;
        debug!(qid, page_id = job.page_id, url = job.url, "Queue entry added");
        Ok(true)
    }

    /// Build the row for a job without touching storage.
    pub fn build_entry(&self, job: &UrlJob<'_>) -> Result<NewQueueEntry> {
        let parameters = JobParameters {
            url: job.url.to_string(),
            fe_user_group_list: job.configuration.user_group_list(),
            proc_instructions: job.configuration.proc_instructions(),
            proc_instr_params: job.configuration.proc_instr_params.clone(),
        };
        let serialized = serde_json::to_string(&parameters)?;

        Ok(NewQueueEntry::builder()
            .page_id(job.page_id)
            .parameters_hash(short_hash(&serialized))
            .parameters(serialized)
            .configuration_hash(job.configuration_hash)
            .configuration(job.configuration.key.as_str())
            .scheduled(job.scheduled)
            .set_id(self.set_id)
            .build())
    }
}
