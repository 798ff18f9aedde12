use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::error::Result;

// ============================================================================
// Queue
// ============================================================================

/// A persisted crawl job.
///
/// `exec_time == 0` means the entry is still claimable. Once set it never
/// changes again; the storage backends only write it through a conditional
/// update against `exec_time = 0`.
#[derive(FromRow, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub qid: i64,
    pub page_id: i64,
    /// Serialized [`JobParameters`]
    pub parameters: String,
    pub parameters_hash: String,
    pub configuration_hash: String,
    /// Key of the configuration that produced the entry
    pub configuration: String,
    pub scheduled: i64,
    pub exec_time: i64,
    pub set_id: i64,
    pub result_data: String,
    pub process_scheduled: i64,
    pub process_id_assigned: String,
    pub process_id_completed: String,
}

impl QueueEntry {
    pub fn is_claimable(&self) -> bool {
        self.exec_time == 0
    }

    pub fn job_parameters(&self) -> Result<JobParameters> {
        Ok(serde_json::from_str(&self.parameters)?)
    }

    /// Materialize a not-yet-persisted entry under the given id.
    pub fn from_new(qid: i64, entry: NewQueueEntry) -> Self {
        Self {
            qid,
            page_id: entry.page_id,
            parameters: entry.parameters,
            parameters_hash: entry.parameters_hash,
            configuration_hash: entry.configuration_hash,
            configuration: entry.configuration,
            scheduled: entry.scheduled,
            exec_time: entry.exec_time,
            set_id: entry.set_id,
            result_data: String::new(),
            process_scheduled: 0,
            process_id_assigned: String::new(),
            process_id_completed: entry.process_id_completed,
        }
    }
}

/// A queue entry before storage has assigned its `qid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewQueueEntry {
    pub page_id: i64,
    pub parameters: String,
    #[builder(default)]
    pub parameters_hash: String,
    #[builder(default)]
    pub configuration_hash: String,
    #[builder(default)]
    pub configuration: String,
    pub scheduled: i64,
    #[builder(default = 0)]
    pub exec_time: i64,
    #[builder(default = 0)]
    pub set_id: i64,
    #[builder(default)]
    pub process_id_completed: String,
}

/// Payload handed to the job executor.
///
/// Its serialized form is what `parameters_hash` covers, so two
/// configurations producing the same payload collapse into one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameters {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fe_user_group_list: Option<String>,
    #[serde(default)]
    pub proc_instructions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_instr_params: Option<serde_json::Value>,
}

/// Outcome reported by a job executor. `content == None` marks a failed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionResult {
    pub fn success(content: serde_json::Value) -> Self {
        Self {
            content: Some(content),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            content: None,
            metadata: serde_json::json!({ "error": reason.into() }),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.content.is_none()
    }

    /// True when `instruction` was part of the run and reported success.
    pub fn pollable_succeeded(&self, instruction: &str) -> bool {
        let Some(content) = &self.content else {
            return false;
        };

        let requested = content
            .pointer("/parameters/procInstructions")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().any(|pi| pi.as_str() == Some(instruction)))
            .unwrap_or(false);

        requested
            && content
                .get("success")
                .and_then(|s| s.get(instruction))
                .map(is_truthy)
                .unwrap_or(false)
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty() && s != "0",
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Processes
// ============================================================================

/// A worker lease.
#[derive(FromRow, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub process_id: String,
    pub active: bool,
    /// Absolute expiry (unix seconds)
    pub ttl: i64,
    /// OS pid of the owning worker, 0 once the lease is fully reapable
    pub system_process_id: i64,
    pub assigned_item_count: i64,
}

impl Process {
    pub fn is_orphan(&self, now: i64) -> bool {
        self.ttl < now
    }
}

// ============================================================================
// Pages
// ============================================================================

/// Doktypes that never produce crawl URLs (links, shortcuts, spacers,
/// folders and recycler pages).
pub const DISALLOWED_DOKTYPES: [i64; 5] = [3, 4, 199, 254, 255];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRow {
    pub uid: i64,
    #[serde(default)]
    pub pid: i64,
    #[serde(default = "default_doktype")]
    pub doktype: i64,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub title: String,
}

fn default_doktype() -> i64 {
    1
}

impl PageRow {
    pub fn new(uid: i64, pid: i64) -> Self {
        Self {
            uid,
            pid,
            doktype: default_doktype(),
            hidden: false,
            title: String::new(),
        }
    }
}
