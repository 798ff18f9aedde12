use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::config::CrawlerSettings;
use crate::error::Result;
use crate::hash::new_process_id;
use crate::traits::{Clock, CrawlerStorage};
use crate::types::Process;

/// Worker lease bookkeeping on top of the shared process table.
///
/// A lease moves through `active -> inactive -> deleted`. Reclaiming a
/// crashed worker takes two release passes: the first marks it inactive,
/// a later one for other ids returns its waiting entries and makes the row
/// deletable, and the next acquisition deletes it.
pub struct ProcessManager {
    storage: Arc<dyn CrawlerStorage>,
    clock: Arc<dyn Clock>,
    process_limit: i64,
    max_run_time: i64,
    system_process_id: i64,
    process_id: OnceLock<String>,
}

impl ProcessManager {
    pub fn new(storage: Arc<dyn CrawlerStorage>, clock: Arc<dyn Clock>, settings: &CrawlerSettings) -> Self {
        Self {
            storage,
            clock,
            process_limit: settings.process_limit,
            max_run_time: settings.process_max_run_time,
            system_process_id: i64::from(std::process::id()),
            process_id: OnceLock::new(),
        }
    }

    /// Override the OS pid recorded on acquired leases.
    pub fn with_system_process_id(mut self, system_process_id: i64) -> Self {
        self.system_process_id = system_process_id;
        self
    }

    /// Id of this worker, created on first use and stable afterwards.
    pub fn build_process_id(&self) -> &str {
        self.process_id.get_or_init(new_process_id)
    }

    /// Try to register a lease for `process_id`.
    ///
    /// Expired leases do not count against the limit; they are released
    /// after the decision together with a purge of reapable rows, whether
    /// or not the lease was granted.
    pub async fn acquire(&self, process_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let (orphans, live): (Vec<Process>, Vec<Process>) = self
            .storage
            .find_all_active()
            .await?
            .into_iter()
            .partition(|p| p.is_orphan(now));

        let acquired = (live.len() as i64) < self.process_limit;
        if acquired {
            self.storage
                .insert_process(Process {
                    process_id: process_id.to_string(),
                    active: true,
                    ttl: now + self.max_run_time,
                    system_process_id: self.system_process_id,
                    assigned_item_count: 0,
                })
                .await?;
            debug!(process_id, ttl = now + self.max_run_time, "Lease acquired");
        } else {
            info!(
                process_id,
                active = live.len(),
                limit = self.process_limit,
                "Process limit reached"
            );
        }

        let deleted = self.storage.delete_released_processes().await?;
        if deleted > 0 {
            debug!(deleted, "Deleted released processes");
        }

        let orphan_ids: Vec<String> = orphans.into_iter().map(|p| p.process_id).collect();
        if !orphan_ids.is_empty() {
            info!(orphans = ?orphan_ids, "Releasing orphaned leases");
        }
        self.release(&orphan_ids).await?;

        Ok(acquired)
    }

    /// Run the release protocol for the given leases. Returns false when
    /// there was nothing to release.
    ///
    /// Only leases that were already inactive before this call get their
    /// entries returned and become reapable; the released ids are
    /// merely marked inactive. Releasing the same ids again changes nothing.
    pub async fn release(&self, process_ids: &[String]) -> Result<bool> {
        if process_ids.is_empty() {
            return Ok(false);
        }

        let returned = self
            .storage
            .release_entries_of_inactive_processes(process_ids)
            .await?;
        let reapable = self
            .storage
            .mark_inactive_processes_reapable(process_ids)
            .await?;
        let deactivated = self.storage.mark_processes_inactive(process_ids).await?;

        debug!(
            released = ?process_ids,
            returned,
            reapable,
            deactivated,
            "Released processes"
        );
        Ok(true)
    }

    /// Whether this worker's own lease is still active.
    pub async fn is_active(&self) -> Result<bool> {
        self.storage
            .is_process_active(self.build_process_id())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::traits::{FixedClock, ProcessRepository, QueueRepository};
    use crate::types::NewQueueEntry;

    fn settings(process_limit: i64) -> CrawlerSettings {
        CrawlerSettings {
            process_limit,
            process_max_run_time: 300,
            ..Default::default()
        }
    }

    fn manager(storage: Arc<MemoryStorage>, clock: Arc<FixedClock>, limit: i64) -> ProcessManager {
        ProcessManager::new(storage, clock, &settings(limit)).with_system_process_id(4242)
    }

    #[tokio::test]
    async fn test_process_id_is_stable() {
        let manager = manager(
            Arc::new(MemoryStorage::new()),
            Arc::new(FixedClock::new(0)),
            1,
        );
        let first = manager.build_process_id().to_string();
        assert_eq!(manager.build_process_id(), first);
    }

    #[tokio::test]
    async fn test_acquire_respects_limit() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(FixedClock::new(1_000));
        let manager = manager(storage.clone(), clock, 2);

        assert!(manager.acquire("a").await.unwrap());
        assert!(manager.acquire("b").await.unwrap());
        assert!(!manager.acquire("c").await.unwrap());

        assert_eq!(storage.find_all_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_orphans_do_not_count_and_are_released() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(FixedClock::new(1_000));
        let manager = manager(storage.clone(), clock.clone(), 1);

        assert!(manager.acquire("crashed").await.unwrap());
        clock.advance(301);

        assert!(manager.acquire("fresh").await.unwrap());
        assert!(!storage.is_process_active("crashed").await.unwrap());
        assert!(storage.is_process_active("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_without_ids_does_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager(storage, Arc::new(FixedClock::new(0)), 1);
        assert!(!manager.release(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(FixedClock::new(1_000));
        let manager = manager(storage.clone(), clock, 5);

        manager.acquire("worker").await.unwrap();
        let qid = storage
            .insert(
                NewQueueEntry::builder()
                    .page_id(1)
                    .parameters("{}")
                    .scheduled(900)
                    .build(),
            )
            .await
            .unwrap();
        storage.assign_to_process(&[qid], "worker", 1_000).await.unwrap();

        let ids = vec!["worker".to_string()];
        assert!(manager.release(&ids).await.unwrap());
        let once = (storage.entries().unwrap(), storage.processes().unwrap());

        assert!(manager.release(&ids).await.unwrap());
        let twice = (storage.entries().unwrap(), storage.processes().unwrap());

        assert_eq!(once, twice);
        assert!(!twice.1[0].active);
        // The worker cannot wipe its own footprint
        assert_eq!(twice.0[0].process_id_assigned, "worker");
        assert_eq!(twice.1[0].system_process_id, 4242);
    }

    #[tokio::test]
    async fn test_second_chance_reclamation() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(FixedClock::new(1_000));

        let crashed = manager(storage.clone(), clock.clone(), 5);
        assert!(crashed.acquire("crashed").await.unwrap());
        let qid = storage
            .insert(
                NewQueueEntry::builder()
                    .page_id(1)
                    .parameters("{}")
                    .scheduled(900)
                    .build(),
            )
            .await
            .unwrap();
        storage.assign_to_process(&[qid], "crashed", 1_000).await.unwrap();

        clock.advance(400);

        // First observer only marks the orphan inactive
        let first = manager(storage.clone(), clock.clone(), 5);
        assert!(first.acquire("first").await.unwrap());
        assert!(!storage.is_process_active("crashed").await.unwrap());
        let entry = storage.find_by_qid(qid).await.unwrap().unwrap();
        assert_eq!(entry.process_id_assigned, "crashed");

        // Its own release at the end of a run returns the entry
        first.release(&["first".to_string()]).await.unwrap();
        let entry = storage.find_by_qid(qid).await.unwrap().unwrap();
        assert_eq!(entry.process_id_assigned, "");
        assert_eq!(entry.process_scheduled, 0);

        // The next acquisition deletes the crashed row
        let second = manager(storage.clone(), clock, 5);
        assert!(second.acquire("second").await.unwrap());
        let ids: Vec<String> = storage
            .processes()
            .unwrap()
            .into_iter()
            .map(|p| p.process_id)
            .collect();
        assert!(!ids.contains(&"crashed".to_string()));
    }
}
