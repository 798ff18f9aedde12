use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::traits::{DuplicateQuery, ProcessRepository, QueueRepository};
use crate::types::{NewQueueEntry, Process, QueueEntry};

#[derive(Debug, Default)]
struct MemoryState {
    queue: BTreeMap<i64, QueueEntry>,
    next_qid: i64,
    processes: BTreeMap<String, Process>,
}

impl MemoryState {
    fn inactive_process_ids(&self, except: &[String]) -> HashSet<String> {
        self.processes
            .values()
            .filter(|p| !p.active && !except.contains(&p.process_id))
            .map(|p| p.process_id.clone())
            .collect()
    }
}

/// Queue and process tables held in memory.
///
/// Every operation runs under one lock, so conditional updates behave like
/// their single-statement SQL counterparts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned").into())
    }

    /// Snapshot of all queue entries ordered by qid.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.state()?.queue.values().cloned().collect())
    }

    /// Snapshot of all process rows.
    pub fn processes(&self) -> Result<Vec<Process>> {
        Ok(self.state()?.processes.values().cloned().collect())
    }
}

#[async_trait]
impl QueueRepository for MemoryStorage {
    async fn insert(&self, entry: NewQueueEntry) -> Result<i64> {
        let mut state = self.state()?;
        state.next_qid += 1;
        let qid = state.next_qid;
        state.queue.insert(qid, QueueEntry::from_new(qid, entry));
        Ok(qid)
    }

    async fn find_by_qid(&self, qid: i64) -> Result<Option<QueueEntry>> {
        Ok(self.state()?.queue.get(&qid).cloned())
    }

    async fn find_duplicates(&self, query: &DuplicateQuery) -> Result<Vec<i64>> {
        Ok(self
            .state()?
            .queue
            .values()
            .filter(|e| {
                e.page_id == query.page_id
                    && e.parameters_hash == query.parameters_hash
                    && e.exec_time == 0
                    && e.process_id_assigned.is_empty()
                    && query.matches_schedule(e.scheduled)
            })
            .map(|e| e.qid)
            .collect())
    }

    async fn no_unprocessed_entries_for_configuration(
        &self,
        page_id: i64,
        configuration_hash: &str,
    ) -> Result<bool> {
        Ok(!self.state()?.queue.values().any(|e| {
            e.page_id == page_id && e.configuration_hash == configuration_hash && e.exec_time == 0
        }))
    }

    async fn fetch_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntry>> {
        let state = self.state()?;
        let mut due: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|e| e.exec_time == 0 && e.process_scheduled == 0 && e.scheduled <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.scheduled, e.qid));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn assign_to_process(&self, qids: &[i64], process_id: &str, now: i64) -> Result<u64> {
        let mut state = self.state()?;
        let mut updated = 0;
        for qid in qids {
            if let Some(entry) = state.queue.get_mut(qid) {
                if entry.exec_time == 0 && entry.process_scheduled == 0 {
                    entry.process_scheduled = now;
                    entry.process_id_assigned = process_id.to_string();
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn lock_entry(&self, qid: i64, process_id: &str, now: i64, force: bool) -> Result<bool> {
        let mut state = self.state()?;
        match state.queue.get_mut(&qid) {
            Some(entry) if force || entry.exec_time == 0 => {
                entry.exec_time = now;
                entry.process_id_completed = process_id.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_result(&self, qid: i64, result_data: &str) -> Result<()> {
        if let Some(entry) = self.state()?.queue.get_mut(&qid) {
            entry.result_data = result_data.to_string();
        }
        Ok(())
    }

    async fn cleanup_queue(&self, processed_before: i64, scheduled_before: i64) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.queue.len();
        state.queue.retain(|_, e| {
            let processed_expired = e.exec_time != 0 && e.exec_time < processed_before;
            let scheduled_expired = e.exec_time == 0 && e.scheduled < scheduled_before;
            !(processed_expired || scheduled_expired)
        });
        Ok((before - state.queue.len()) as u64)
    }

    async fn count_unprocessed(&self, now: i64) -> Result<u64> {
        Ok(self
            .state()?
            .queue
            .values()
            .filter(|e| e.exec_time == 0 && e.scheduled <= now)
            .count() as u64)
    }
}

#[async_trait]
impl ProcessRepository for MemoryStorage {
    async fn find_all_active(&self) -> Result<Vec<Process>> {
        Ok(self
            .state()?
            .processes
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }

    async fn insert_process(&self, process: Process) -> Result<()> {
        self.state()?
            .processes
            .insert(process.process_id.clone(), process);
        Ok(())
    }

    async fn is_process_active(&self, process_id: &str) -> Result<bool> {
        Ok(self
            .state()?
            .processes
            .get(process_id)
            .map(|p| p.active)
            .unwrap_or(false))
    }

    async fn update_assigned_item_count(&self, process_id: &str, count: i64) -> Result<()> {
        if let Some(process) = self.state()?.processes.get_mut(process_id) {
            process.assigned_item_count = count;
        }
        Ok(())
    }

    async fn delete_released_processes(&self) -> Result<u64> {
        let mut state = self.state()?;
        let before = state.processes.len();
        state
            .processes
            .retain(|_, p| p.active || p.system_process_id != 0);
        Ok((before - state.processes.len()) as u64)
    }

    async fn release_entries_of_inactive_processes(&self, except: &[String]) -> Result<u64> {
        let mut state = self.state()?;
        let inactive = state.inactive_process_ids(except);
        let mut updated = 0;
        for entry in state.queue.values_mut() {
            if inactive.contains(&entry.process_id_assigned) {
                entry.process_scheduled = 0;
                entry.process_id_assigned = String::new();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_inactive_processes_reapable(&self, except: &[String]) -> Result<u64> {
        let mut state = self.state()?;
        let waiting: HashSet<String> = state
            .queue
            .values()
            .filter(|e| e.exec_time == 0 && !e.process_id_assigned.is_empty())
            .map(|e| e.process_id_assigned.clone())
            .collect();

        let mut updated = 0;
        for process in state.processes.values_mut() {
            if !process.active
                && process.system_process_id != 0
                && !except.contains(&process.process_id)
                && !waiting.contains(&process.process_id)
            {
                process.system_process_id = 0;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_processes_inactive(&self, process_ids: &[String]) -> Result<u64> {
        let mut state = self.state()?;
        let mut updated = 0;
        for id in process_ids {
            if let Some(process) = state.processes.get_mut(id) {
                if process.active {
                    process.active = false;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }
}
