use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CrawlerSettings;
use crate::error::Result;
use crate::process::ProcessManager;
use crate::status::CliStatus;
use crate::traits::{Clock, CrawlerStorage, CrawlerSwitch, JobExecutor};
use crate::types::{ExecutionResult, NewQueueEntry, QueueEntry};

const SECONDS_PER_DAY: i64 = 86_400;

/// Drives one worker through a bounded batch of due queue entries.
pub struct RunLoop {
    storage: Arc<dyn CrawlerStorage>,
    executor: Arc<dyn JobExecutor>,
    switch: Arc<dyn CrawlerSwitch>,
    clock: Arc<dyn Clock>,
    processes: Arc<ProcessManager>,
    settings: CrawlerSettings,
}

impl RunLoop {
    pub fn new(
        storage: Arc<dyn CrawlerStorage>,
        executor: Arc<dyn JobExecutor>,
        switch: Arc<dyn CrawlerSwitch>,
        clock: Arc<dyn Clock>,
        processes: Arc<ProcessManager>,
        settings: CrawlerSettings,
    ) -> Self {
        Self {
            storage,
            executor,
            switch,
            clock,
            processes,
            settings,
        }
    }

    pub fn process_id(&self) -> &str {
        self.processes.build_process_id()
    }

    /// Claim up to `count` due entries and execute them in order.
    ///
    /// `sleep_time` (µs) is slept after every entry, `sleep_after_finish`
    /// (s) once after a non-empty batch. Losing the claim race, the global
    /// kill-switch and losing the own lease all end the run with `ABORTED`.
    pub async fn run(&self, count: i64, sleep_time: u64, sleep_after_finish: u64) -> Result<CliStatus> {
        let mut result = CliStatus::NOTHING_PROCESSED;
        let mut counter = 0;

        self.housekeeping().await?;

        let entries = self.storage.fetch_due(count, self.clock.now()).await?;
        if !entries.is_empty() {
            let process_id = self.process_id().to_string();
            let qids: Vec<i64> = entries.iter().map(|e| e.qid).collect();

            let assigned = self
                .storage
                .assign_to_process(&qids, &process_id, self.clock.now())
                .await?;
            self.storage
                .update_assigned_item_count(&process_id, assigned as i64)
                .await?;

            if assigned != qids.len() as u64 {
                warn!(
                    process_id = %process_id,
                    requested = qids.len(),
                    assigned,
                    "Lost claim race, aborting run"
                );
                return Ok(result | CliStatus::ABORTED);
            }

            for entry in &entries {
                result |= self.read_url(entry.qid, false).await?;
                counter += 1;

                tokio::time::sleep(Duration::from_micros(sleep_time)).await;

                if self.switch.is_disabled() {
                    info!(process_id = %process_id, "Crawling disabled, aborting run");
                    return Ok(result | processed_flag(counter) | CliStatus::ABORTED);
                }

                if !self.processes.is_active().await? {
                    warn!(process_id = %process_id, "conflict / timeout");
                    result |= CliStatus::ABORTED;
                    break;
                }
            }

            tokio::time::sleep(Duration::from_secs(sleep_after_finish)).await;
        }

        Ok(result | processed_flag(counter))
    }

    /// Take a lease, run one batch and release the lease again.
    ///
    /// Returns `NOTHING_PROCESSED` without touching the queue when the
    /// process limit is reached. The lease is released even when the run
    /// fails. `REMAIN` is added when due entries are left afterwards.
    pub async fn run_with_lease(
        &self,
        count: i64,
        sleep_time: u64,
        sleep_after_finish: u64,
    ) -> Result<CliStatus> {
        let process_id = self.process_id().to_string();
        if !self.processes.acquire(&process_id).await? {
            info!("process limit reached");
            return Ok(CliStatus::NOTHING_PROCESSED);
        }

        let outcome = self.run(count, sleep_time, sleep_after_finish).await;
        self.processes.release(&[process_id]).await?;
        let mut status = outcome?;

        if self.storage.count_unprocessed(self.clock.now()).await? > 0 {
            status |= CliStatus::REMAIN;
        }
        Ok(status)
    }

    /// Execute one queue entry.
    ///
    /// Without `force` the entry must be assigned and not yet executed, and
    /// losing the `exec_time` lock to another worker skips it silently.
    pub async fn read_url(&self, qid: i64, force: bool) -> Result<CliStatus> {
        let Some(entry) = self.storage.find_by_qid(qid).await? else {
            return Ok(CliStatus::NOTHING_PROCESSED);
        };
        if !force && (entry.exec_time != 0 || entry.process_scheduled == 0) {
            return Ok(CliStatus::NOTHING_PROCESSED);
        }

        let process_id = self.process_id().to_string();
        if !self
            .storage
            .lock_entry(qid, &process_id, self.clock.now(), force)
            .await?
        {
            debug!(qid, process_id = %process_id, "Entry already locked by another worker");
            return Ok(CliStatus::NOTHING_PROCESSED);
        }

        let result = self.execute(&entry).await;
        self.storage
            .save_result(qid, &serde_json::to_string(&result)?)
            .await?;

        Ok(self.pollable_status(&result))
    }

    /// Store an entry that was never queued already locked, execute it and
    /// record its result.
    pub async fn read_url_from_array(&self, mut entry: NewQueueEntry) -> Result<ExecutionResult> {
        entry.exec_time = self.clock.now();
        entry.process_id_completed = self.process_id().to_string();

        let qid = self.storage.insert(entry.clone()).await?;
        let result = self.execute(&QueueEntry::from_new(qid, entry)).await;
        self.storage
            .save_result(qid, &serde_json::to_string(&result)?)
            .await?;

        Ok(result)
    }

    async fn execute(&self, entry: &QueueEntry) -> ExecutionResult {
        let result = match self.executor.execute(entry).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(e.to_string()),
        };

        if result.is_failure() {
            warn!(qid = entry.qid, page_id = entry.page_id, metadata = %result.metadata, "Job execution failed");
        } else {
            debug!(qid = entry.qid, page_id = entry.page_id, "Job executed");
        }
        result
    }

    fn pollable_status(&self, result: &ExecutionResult) -> CliStatus {
        let succeeded = self
            .settings
            .pollable_instructions
            .iter()
            .any(|pollable| result.pollable_succeeded(pollable));

        if succeeded {
            CliStatus::POLLABLE_PROCESSED
        } else {
            CliStatus::NOTHING_PROCESSED
        }
    }

    async fn housekeeping(&self) -> Result<()> {
        if !self.settings.clean_up_old_queue_entries {
            return Ok(());
        }

        let now = self.clock.now();
        let deleted = self
            .storage
            .cleanup_queue(
                now - self.settings.clean_up_processed_age * SECONDS_PER_DAY,
                now - self.settings.clean_up_scheduled_age * SECONDS_PER_DAY,
            )
            .await?;
        if deleted > 0 {
            debug!(deleted, "Removed old queue entries");
        }
        Ok(())
    }
}

fn processed_flag(counter: usize) -> CliStatus {
    if counter > 0 {
        CliStatus::PROCESSED
    } else {
        CliStatus::NOTHING_PROCESSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlerError;
    use crate::storage::MemoryStorage;
    use crate::traits::{FixedClock, ProcessRepository, QueueRepository};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubExecutor {
        calls: AtomicUsize,
        fail: bool,
        content: Option<serde_json::Value>,
    }

    #[async_trait]
    impl JobExecutor for StubExecutor {
        async fn execute(&self, _entry: &QueueEntry) -> Result<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CrawlerError::Executor("connection refused".to_string()));
            }
            Ok(ExecutionResult::success(
                self.content.clone().unwrap_or_else(|| json!({ "ok": true })),
            ))
        }
    }

    #[derive(Default)]
    struct StubSwitch(AtomicBool);

    impl CrawlerSwitch for StubSwitch {
        fn is_disabled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        clock: Arc<FixedClock>,
        switch: Arc<StubSwitch>,
        processes: Arc<ProcessManager>,
    }

    impl Fixture {
        async fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let clock = Arc::new(FixedClock::new(10_000));
            let settings = CrawlerSettings {
                process_limit: 5,
                ..Default::default()
            };
            let processes = Arc::new(ProcessManager::new(storage.clone(), clock.clone(), &settings));
            let id = processes.build_process_id().to_string();
            assert!(processes.acquire(&id).await.unwrap());

            Self {
                storage,
                clock,
                switch: Arc::new(StubSwitch::default()),
                processes,
            }
        }

        fn run_loop(&self, executor: Arc<StubExecutor>, settings: CrawlerSettings) -> RunLoop {
            RunLoop::new(
                self.storage.clone(),
                executor,
                self.switch.clone(),
                self.clock.clone(),
                self.processes.clone(),
                settings,
            )
        }

        async fn queue(&self, count: usize) -> Vec<i64> {
            let mut qids = Vec::new();
            for n in 0..count {
                let qid = self
                    .storage
                    .insert(
                        NewQueueEntry::builder()
                            .page_id(1)
                            .parameters(format!("{{\"url\":\"http://localhost/?id={}\"}}", n))
                            .scheduled(9_000 + n as i64)
                            .build(),
                    )
                    .await
                    .unwrap();
                qids.push(qid);
            }
            qids
        }
    }

    fn unleased(storage: Arc<MemoryStorage>, clock: Arc<FixedClock>, executor: Arc<StubExecutor>) -> RunLoop {
        let settings = CrawlerSettings {
            process_limit: 1,
            ..Default::default()
        };
        let processes = Arc::new(ProcessManager::new(storage.clone(), clock.clone(), &settings));
        RunLoop::new(
            storage,
            executor,
            Arc::new(StubSwitch::default()),
            clock,
            processes,
            settings,
        )
    }

    #[tokio::test]
    async fn test_run_with_lease_frees_the_slot() {
        let fixture = Fixture::new().await;
        let storage = Arc::new(MemoryStorage::new());
        for n in 0..3 {
            storage
                .insert(
                    NewQueueEntry::builder()
                        .page_id(1)
                        .parameters(format!("{{\"url\":\"http://localhost/?id={}\"}}", n))
                        .scheduled(9_000 + n)
                        .build(),
                )
                .await
                .unwrap();
        }
        let executor = Arc::new(StubExecutor::default());

        let first = unleased(storage.clone(), fixture.clock.clone(), executor.clone());
        let status = first.run_with_lease(2, 0, 0).await.unwrap();
        assert_eq!(status, CliStatus::PROCESSED | CliStatus::REMAIN);
        assert!(!storage.is_process_active(first.process_id()).await.unwrap());

        // With a limit of one, a second worker only runs if the first let go
        let second = unleased(storage.clone(), fixture.clock.clone(), executor.clone());
        assert_eq!(second.run_with_lease(2, 0, 0).await.unwrap(), CliStatus::PROCESSED);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_with_lease_respects_process_limit() {
        let fixture = Fixture::new().await;
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(StubExecutor::default());

        let holder = unleased(storage.clone(), fixture.clock.clone(), executor.clone());
        assert!(holder.processes.acquire(holder.process_id()).await.unwrap());
        storage
            .insert(
                NewQueueEntry::builder()
                    .page_id(1)
                    .parameters("{\"url\":\"http://localhost/\"}")
                    .scheduled(9_000)
                    .build(),
            )
            .await
            .unwrap();

        let refused = unleased(storage, fixture.clock.clone(), executor.clone());
        assert_eq!(
            refused.run_with_lease(10, 0, 0).await.unwrap(),
            CliStatus::NOTHING_PROCESSED
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_processes_due_entries() {
        let fixture = Fixture::new().await;
        let qids = fixture.queue(3).await;
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        let status = run_loop.run(10, 0, 0).await.unwrap();

        assert_eq!(status, CliStatus::PROCESSED);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        for qid in qids {
            let entry = fixture.storage.find_by_qid(qid).await.unwrap().unwrap();
            assert_eq!(entry.exec_time, 10_000);
            assert_eq!(entry.process_id_completed, run_loop.process_id());
            assert!(entry.result_data.contains("\"ok\":true"));
        }
    }

    #[tokio::test]
    async fn test_run_with_empty_queue() {
        let fixture = Fixture::new().await;
        let run_loop = fixture.run_loop(Arc::new(StubExecutor::default()), CrawlerSettings::default());
        assert_eq!(run_loop.run(10, 0, 0).await.unwrap(), CliStatus::NOTHING_PROCESSED);
    }

    #[tokio::test]
    async fn test_run_respects_batch_size() {
        let fixture = Fixture::new().await;
        fixture.queue(5).await;
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        run_loop.run(2, 0, 0).await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.storage.count_unprocessed(10_000).await.unwrap(), 3);
        let process = fixture
            .storage
            .find_all_active()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.process_id == run_loop.process_id())
            .unwrap();
        assert_eq!(process.assigned_item_count, 2);
    }

    #[tokio::test]
    async fn test_executor_failure_is_recorded_and_run_continues() {
        let fixture = Fixture::new().await;
        let qids = fixture.queue(2).await;
        let executor = Arc::new(StubExecutor {
            fail: true,
            ..Default::default()
        });
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        let status = run_loop.run(10, 0, 0).await.unwrap();

        assert_eq!(status, CliStatus::PROCESSED);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        let entry = fixture.storage.find_by_qid(qids[0]).await.unwrap().unwrap();
        let result: ExecutionResult = serde_json::from_str(&entry.result_data).unwrap();
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_disabled_switch_aborts_after_current_entry() {
        let fixture = Fixture::new().await;
        fixture.queue(3).await;
        fixture.switch.0.store(true, Ordering::SeqCst);
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        let status = run_loop.run(10, 0, 0).await.unwrap();

        assert!(status.contains(CliStatus::ABORTED));
        assert!(status.contains(CliStatus::PROCESSED));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_aborts() {
        let fixture = Fixture::new().await;
        fixture.queue(3).await;
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        fixture
            .storage
            .mark_processes_inactive(&[run_loop.process_id().to_string()])
            .await
            .unwrap();

        let status = run_loop.run(10, 0, 0).await.unwrap();

        assert_eq!(status, CliStatus::PROCESSED | CliStatus::ABORTED);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pollable_success_is_reported() {
        let fixture = Fixture::new().await;
        fixture.queue(1).await;
        let executor = Arc::new(StubExecutor {
            content: Some(json!({
                "parameters": { "procInstructions": ["tx_staticpub_publish"] },
                "success": { "tx_staticpub_publish": true },
            })),
            ..Default::default()
        });
        let settings = CrawlerSettings {
            pollable_instructions: vec!["tx_staticpub_publish".to_string()],
            ..Default::default()
        };
        let run_loop = fixture.run_loop(executor, settings);

        let status = run_loop.run(10, 0, 0).await.unwrap();
        assert_eq!(status, CliStatus::PROCESSED | CliStatus::POLLABLE_PROCESSED);
    }

    #[tokio::test]
    async fn test_read_url_requires_assignment_unless_forced() {
        let fixture = Fixture::new().await;
        let qids = fixture.queue(1).await;
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        run_loop.read_url(qids[0], false).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        run_loop.read_url(qids[0], true).await.unwrap();
        run_loop.read_url(qids[0], true).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_url_from_array() {
        let fixture = Fixture::new().await;
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        let result = run_loop
            .read_url_from_array(
                NewQueueEntry::builder()
                    .page_id(3)
                    .parameters("{\"url\":\"http://localhost/?id=3\"}")
                    .scheduled(10_000)
                    .build(),
            )
            .await
            .unwrap();

        assert!(!result.is_failure());
        let entries = fixture.storage.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exec_time, 10_000);
        assert!(!entries[0].result_data.is_empty());
        assert_eq!(fixture.storage.count_unprocessed(i64::MAX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_housekeeping_removes_stale_entries() {
        let fixture = Fixture::new().await;
        fixture
            .storage
            .insert(
                NewQueueEntry::builder()
                    .page_id(1)
                    .parameters("{}")
                    .scheduled(10_000 - 8 * SECONDS_PER_DAY)
                    .build(),
            )
            .await
            .unwrap();
        let executor = Arc::new(StubExecutor::default());
        let run_loop = fixture.run_loop(executor.clone(), CrawlerSettings::default());

        let status = run_loop.run(10, 0, 0).await.unwrap();

        assert_eq!(status, CliStatus::NOTHING_PROCESSED);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(fixture.storage.entries().unwrap().is_empty());
    }
}
