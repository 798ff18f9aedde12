use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::configuration::CrawlConfiguration;
use crate::error::Result;
use crate::types::{ExecutionResult, NewQueueEntry, PageRow, Process, QueueEntry};

// ============================================================================
// STORAGE: the shared queue and process tables
// ============================================================================

/// Persisted-queue lookup for an equivalent unexecuted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateQuery {
    pub page_id: i64,
    pub parameters_hash: String,
    /// Scheduled time of the candidate entry
    pub scheduled: i64,
    pub now: i64,
    /// Half-width of the timeslot window, `None` when timeslots are disabled
    pub window: Option<i64>,
}

impl DuplicateQuery {
    /// Whether a persisted, unexecuted entry with the same page and hash
    /// scheduled at `scheduled` collides with the candidate.
    pub fn matches_schedule(&self, scheduled: i64) -> bool {
        match (self.window, self.scheduled <= self.now) {
            // Everything due now collapses together
            (Some(window), true) => {
                scheduled <= self.now
                    || (scheduled >= self.now - window && scheduled <= self.now + window)
            }
            (None, true) => scheduled <= self.now,
            (Some(window), false) => (scheduled - self.scheduled).abs() <= window,
            // Without timeslots anything already due blocks a re-enqueue
            (None, false) => scheduled <= self.now || scheduled == self.scheduled,
        }
    }
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert an entry and return the storage-assigned `qid`.
    async fn insert(&self, entry: NewQueueEntry) -> Result<i64>;

    async fn find_by_qid(&self, qid: i64) -> Result<Option<QueueEntry>>;

    /// Qids of unexecuted, unassigned entries matching the query.
    async fn find_duplicates(&self, query: &DuplicateQuery) -> Result<Vec<i64>>;

    /// True when no unexecuted entry produced by the configuration exists for the page.
    async fn no_unprocessed_entries_for_configuration(
        &self,
        page_id: i64,
        configuration_hash: &str,
    ) -> Result<bool>;

    /// Unassigned, unexecuted entries with `scheduled <= now`, oldest first.
    async fn fetch_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntry>>;

    /// Assign entries to a process, only touching rows that are still
    /// unexecuted and unassigned. Returns the number of rows updated.
    async fn assign_to_process(&self, qids: &[i64], process_id: &str, now: i64) -> Result<u64>;

    /// Set `exec_time` (compare-and-swap against `exec_time = 0` unless forced).
    /// Returns false when another worker won the entry.
    async fn lock_entry(&self, qid: i64, process_id: &str, now: i64, force: bool) -> Result<bool>;

    async fn save_result(&self, qid: i64, result_data: &str) -> Result<()>;

    /// Delete executed entries older than `processed_before` and unexecuted
    /// entries scheduled before `scheduled_before`.
    async fn cleanup_queue(&self, processed_before: i64, scheduled_before: i64) -> Result<u64>;

    /// Number of unexecuted entries due at `now`.
    async fn count_unprocessed(&self, now: i64) -> Result<u64>;
}

#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn find_all_active(&self) -> Result<Vec<Process>>;

    async fn insert_process(&self, process: Process) -> Result<()>;

    async fn is_process_active(&self, process_id: &str) -> Result<bool>;

    async fn update_assigned_item_count(&self, process_id: &str, count: i64) -> Result<()>;

    /// Delete rows with `active = false AND system_process_id = 0`.
    async fn delete_released_processes(&self) -> Result<u64>;

    /// Clear the assignment of every entry held by an inactive process other
    /// than `except`. Unexecuted ones become claimable again.
    async fn release_entries_of_inactive_processes(&self, except: &[String]) -> Result<u64>;

    /// Zero `system_process_id` of inactive processes, other than `except`,
    /// that no longer hold any waiting (unexecuted) entry.
    async fn mark_inactive_processes_reapable(&self, except: &[String]) -> Result<u64>;

    async fn mark_processes_inactive(&self, process_ids: &[String]) -> Result<u64>;
}

/// Both tables behind one handle.
pub trait CrawlerStorage: QueueRepository + ProcessRepository {}

impl<T: QueueRepository + ProcessRepository> CrawlerStorage for T {}

// ============================================================================
// COLLABORATORS: page tree, configuration source, record lookup, executor
// ============================================================================

/// Table-driven enumeration request of a `_TABLE:` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub table: String,
    /// Lookup pid plus its subtree when `recursion_depth > 0`
    pub scope_page_ids: Vec<i64>,
    pub recursion_depth: i64,
    pub pid_field: String,
    pub where_clause: String,
    pub add_table: String,
    pub project_field: String,
    /// Keep only rows whose translation pointer is not set
    pub exclude_translations: bool,
}

#[async_trait]
pub trait RecordLookup: Send + Sync {
    /// Projected field values in storage order. Unknown tables or fields
    /// produce an empty list.
    async fn lookup(&self, query: &RecordQuery) -> Result<Vec<String>>;
}

#[async_trait]
pub trait PageTree: Send + Sync {
    async fn page(&self, page_id: i64) -> Result<Option<PageRow>>;

    /// Descendants of `root` down to `depth` levels, parents before children.
    /// `depth >= 99` is unbounded.
    async fn subtree(&self, root: i64, depth: i64) -> Result<Vec<PageRow>>;
}

#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn configurations_for_page(&self, page_id: i64) -> Result<Vec<CrawlConfiguration>>;
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run a queued job. A `None` content marks a failed run; `Err` is
    /// reserved for failures to reach the executor at all.
    async fn execute(&self, entry: &QueueEntry) -> Result<ExecutionResult>;
}

/// Global "crawling disabled" kill-switch.
pub trait CrawlerSwitch: Send + Sync {
    fn is_disabled(&self) -> bool;
}

// ============================================================================
// TIME
// ============================================================================

pub trait Clock: Send + Sync {
    /// Unix seconds
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// EXTENSION POINTS
// ============================================================================

/// What a hook sees after one part of a bracketed expression was expanded.
#[derive(Debug)]
pub struct ExpansionContext<'a> {
    pub parameter: &'a str,
    pub part: &'a str,
    pub page_id: i64,
}

/// Post-processing of expanded parameter values. Does nothing by default.
pub trait ExpansionHook: Send + Sync {
    fn after_part(&self, _context: &ExpansionContext<'_>, _values: &mut Vec<String>) {}
}

/// Page-level veto consulted by the skip check.
pub trait PageVeto: Send + Sync {
    fn name(&self) -> &str;

    /// `Some` skips the page. An empty reason is replaced by a generic one.
    fn veto(&self, page: &PageRow) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(scheduled: i64, window: Option<i64>) -> DuplicateQuery {
        DuplicateQuery {
            page_id: 1,
            parameters_hash: "abc".to_string(),
            scheduled,
            now: 1_000,
            window,
        }
    }

    #[test]
    fn test_due_candidates_collapse_with_everything_due() {
        let q = query(1_000, Some(100));
        assert!(q.matches_schedule(10));
        assert!(q.matches_schedule(1_100));
        assert!(!q.matches_schedule(1_101));

        let q = query(1_000, None);
        assert!(q.matches_schedule(1_000));
        assert!(!q.matches_schedule(1_001));
    }

    #[test]
    fn test_future_candidates_use_window() {
        let q = query(5_000, Some(100));
        assert!(q.matches_schedule(4_900));
        assert!(q.matches_schedule(5_100));
        assert!(!q.matches_schedule(800));

        let q = query(5_000, None);
        assert!(q.matches_schedule(5_000));
        assert!(!q.matches_schedule(5_060));
    }

    #[test]
    fn test_future_candidate_collides_with_due_entry_without_timeslots() {
        let q = query(5_000, None);
        assert!(q.matches_schedule(900));
        assert!(q.matches_schedule(1_000));
        assert!(!q.matches_schedule(1_001));

        let q = query(5_000, Some(100));
        assert!(!q.matches_schedule(900));
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(60);
        clock.advance(30);
        assert_eq!(clock.now(), 90);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
