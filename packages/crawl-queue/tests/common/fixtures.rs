//! Test doubles shared by the integration tests.

use async_trait::async_trait;
use crawl_queue::traits::DuplicateQuery;
use crawl_queue::{
    CrawlerSwitch, ExecutionResult, JobExecutor, MemoryStorage, NewQueueEntry, Process,
    ProcessRepository, QueueEntry, QueueRepository, Result,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const SITE: &str = r#"{
    "pages": [
        { "uid": 1, "pid": 0, "title": "Home" },
        { "uid": 5, "pid": 1, "title": "News" },
        { "uid": 6, "pid": 5, "title": "Archive", "hidden": true }
    ],
    "configurations": [
        { "root": 5, "key": "pages", "parameters": "&p=[1-3]" }
    ],
    "tables": {
        "tx_news": [{ "uid": 40, "pid": 5 }, { "uid": 41, "pid": 5 }]
    }
}"#;

pub fn queued(page_id: i64, scheduled: i64) -> NewQueueEntry {
    NewQueueEntry::builder()
        .page_id(page_id)
        .parameters(format!(
            "{{\"url\":\"http://localhost/index.php?id={}&s={}\"}}",
            page_id, scheduled
        ))
        .parameters_hash(format!("{}-{}", page_id, scheduled))
        .scheduled(scheduled)
        .build()
}

/// Records every executed qid and answers with a successful result.
#[derive(Default)]
pub struct RecordingExecutor {
    pub executed: Mutex<Vec<i64>>,
    calls: AtomicUsize,
}

impl RecordingExecutor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<i64> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, entry: &QueueEntry) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(entry.qid);
        Ok(ExecutionResult::success(json!({ "url": entry.job_parameters()?.url })))
    }
}

pub struct Enabled;

impl CrawlerSwitch for Enabled {
    fn is_disabled(&self) -> bool {
        false
    }
}

/// Memory storage where a rival worker claims every fetched batch between
/// the fetch and the assignment of the worker under test.
pub struct RacingStorage {
    pub inner: Arc<MemoryStorage>,
    rival: Mutex<Option<String>>,
}

impl RacingStorage {
    pub fn new(inner: Arc<MemoryStorage>, rival: &str) -> Self {
        Self {
            inner,
            rival: Mutex::new(Some(rival.to_string())),
        }
    }
}

#[async_trait]
impl QueueRepository for RacingStorage {
    async fn insert(&self, entry: NewQueueEntry) -> Result<i64> {
        self.inner.insert(entry).await
    }

    async fn find_by_qid(&self, qid: i64) -> Result<Option<QueueEntry>> {
        self.inner.find_by_qid(qid).await
    }

    async fn find_duplicates(&self, query: &DuplicateQuery) -> Result<Vec<i64>> {
        self.inner.find_duplicates(query).await
    }

    async fn no_unprocessed_entries_for_configuration(
        &self,
        page_id: i64,
        configuration_hash: &str,
    ) -> Result<bool> {
        self.inner
            .no_unprocessed_entries_for_configuration(page_id, configuration_hash)
            .await
    }

    async fn fetch_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntry>> {
        let due = self.inner.fetch_due(limit, now).await?;
        let rival = self.rival.lock().unwrap().take();
        if let Some(rival) = rival {
            let qids: Vec<i64> = due.iter().map(|e| e.qid).collect();
            self.inner.assign_to_process(&qids, &rival, now).await?;
        }
        Ok(due)
    }

    async fn assign_to_process(&self, qids: &[i64], process_id: &str, now: i64) -> Result<u64> {
        self.inner.assign_to_process(qids, process_id, now).await
    }

    async fn lock_entry(&self, qid: i64, process_id: &str, now: i64, force: bool) -> Result<bool> {
        self.inner.lock_entry(qid, process_id, now, force).await
    }

    async fn save_result(&self, qid: i64, result_data: &str) -> Result<()> {
        self.inner.save_result(qid, result_data).await
    }

    async fn cleanup_queue(&self, processed_before: i64, scheduled_before: i64) -> Result<u64> {
        self.inner.cleanup_queue(processed_before, scheduled_before).await
    }

    async fn count_unprocessed(&self, now: i64) -> Result<u64> {
        self.inner.count_unprocessed(now).await
    }
}

#[async_trait]
impl ProcessRepository for RacingStorage {
    async fn find_all_active(&self) -> Result<Vec<Process>> {
        self.inner.find_all_active().await
    }

    async fn insert_process(&self, process: Process) -> Result<()> {
        self.inner.insert_process(process).await
    }

    async fn is_process_active(&self, process_id: &str) -> Result<bool> {
        self.inner.is_process_active(process_id).await
    }

    async fn update_assigned_item_count(&self, process_id: &str, count: i64) -> Result<()> {
        self.inner.update_assigned_item_count(process_id, count).await
    }

    async fn delete_released_processes(&self) -> Result<u64> {
        self.inner.delete_released_processes().await
    }

    async fn release_entries_of_inactive_processes(&self, except: &[String]) -> Result<u64> {
        self.inner.release_entries_of_inactive_processes(except).await
    }

    async fn mark_inactive_processes_reapable(&self, except: &[String]) -> Result<u64> {
        self.inner.mark_inactive_processes_reapable(except).await
    }

    async fn mark_processes_inactive(&self, process_ids: &[String]) -> Result<u64> {
        self.inner.mark_processes_inactive(process_ids).await
    }
}
