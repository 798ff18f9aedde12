use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{PgPool, Row};

use crate::error::{CrawlerError, Result};
use crate::traits::{DuplicateQuery, ProcessRepository, QueueRepository, RecordLookup, RecordQuery};
use crate::types::{NewQueueEntry, Process, QueueEntry};

const QUEUE_COLUMNS: &str = r#"
    qid, page_id, parameters, parameters_hash, configuration_hash, configuration,
    scheduled, exec_time, set_id, result_data, process_scheduled,
    process_id_assigned, process_id_completed
"#;

/// Run the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed queue and process tables.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueRepository for PostgresStorage {
    async fn insert(&self, entry: NewQueueEntry) -> Result<i64> {
        let qid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO crawler_queue (
                page_id, parameters, parameters_hash, configuration_hash, configuration,
                scheduled, exec_time, set_id, result_data, process_id_completed
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '', $9)
            RETURNING qid
            "#,
        )
        .bind(entry.page_id)
        .bind(&entry.parameters)
        .bind(&entry.parameters_hash)
        .bind(&entry.configuration_hash)
        .bind(&entry.configuration)
        .bind(entry.scheduled)
        .bind(entry.exec_time)
        .bind(entry.set_id)
        .bind(&entry.process_id_completed)
        .fetch_one(&self.pool)
        .await?;

        Ok(qid)
    }

    async fn find_by_qid(&self, qid: i64) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(&format!(
            "SELECT {} FROM crawler_queue WHERE qid = $1",
            QUEUE_COLUMNS
        ))
        .bind(qid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn find_duplicates(&self, query: &DuplicateQuery) -> Result<Vec<i64>> {
        let window = query.window.unwrap_or(0);

        // Due candidates collapse with everything already due. Future ones
        // match entries inside the window around their own slot, plus
        // anything already due when timeslots are off.
        let (anchor, due_before) = match (query.scheduled <= query.now, query.window) {
            (true, _) => (query.now, query.now),
            (false, None) => (query.scheduled, query.now),
            (false, Some(_)) => (query.scheduled, i64::MIN),
        };

        let qids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT qid FROM crawler_queue
            WHERE page_id = $1
              AND parameters_hash = $2
              AND exec_time = 0
              AND process_id_assigned = ''
              AND (scheduled <= $5 OR scheduled BETWEEN $3 - $4 AND $3 + $4)
            ORDER BY qid
            "#,
        )
        .bind(query.page_id)
        .bind(&query.parameters_hash)
        .bind(anchor)
        .bind(window)
        .bind(due_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(qids)
    }

    async fn no_unprocessed_entries_for_configuration(
        &self,
        page_id: i64,
        configuration_hash: &str,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM crawler_queue
                WHERE page_id = $1 AND configuration_hash = $2 AND exec_time = 0
            )
            "#,
        )
        .bind(page_id)
        .bind(configuration_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(!exists)
    }

    async fn fetch_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntry>> {
        let entries = sqlx::query_as::<_, QueueEntry>(&format!(
            r#"
            SELECT {} FROM crawler_queue
            WHERE exec_time = 0 AND process_scheduled = 0 AND scheduled <= $1
            ORDER BY scheduled, qid
            LIMIT $2
            "#,
            QUEUE_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn assign_to_process(&self, qids: &[i64], process_id: &str, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_queue
            SET process_scheduled = $1, process_id_assigned = $2
            WHERE qid = ANY($3) AND exec_time = 0 AND process_scheduled = 0
            "#,
        )
        .bind(now)
        .bind(process_id)
        .bind(qids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn lock_entry(&self, qid: i64, process_id: &str, now: i64, force: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_queue
            SET exec_time = $1, process_id_completed = $2
            WHERE qid = $3 AND ($4 OR exec_time = 0)
            "#,
        )
        .bind(now)
        .bind(process_id)
        .bind(qid)
        .bind(force)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_result(&self, qid: i64, result_data: &str) -> Result<()> {
        sqlx::query("UPDATE crawler_queue SET result_data = $1 WHERE qid = $2")
            .bind(result_data)
            .bind(qid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_queue(&self, processed_before: i64, scheduled_before: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM crawler_queue
            WHERE (exec_time <> 0 AND exec_time < $1)
               OR (exec_time = 0 AND scheduled < $2)
            "#,
        )
        .bind(processed_before)
        .bind(scheduled_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_unprocessed(&self, now: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM crawler_queue WHERE exec_time = 0 AND scheduled <= $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}

#[async_trait]
impl ProcessRepository for PostgresStorage {
    async fn find_all_active(&self) -> Result<Vec<Process>> {
        let processes = sqlx::query_as::<_, Process>(
            r#"
            SELECT process_id, active, ttl, system_process_id, assigned_item_count
            FROM crawler_process
            WHERE active
            ORDER BY ttl
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(processes)
    }

    async fn insert_process(&self, process: Process) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawler_process (
                process_id, active, ttl, system_process_id, assigned_item_count
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&process.process_id)
        .bind(process.active)
        .bind(process.ttl)
        .bind(process.system_process_id)
        .bind(process.assigned_item_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_process_active(&self, process_id: &str) -> Result<bool> {
        let active: Option<bool> =
            sqlx::query_scalar("SELECT active FROM crawler_process WHERE process_id = $1")
                .bind(process_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(active.unwrap_or(false))
    }

    async fn update_assigned_item_count(&self, process_id: &str, count: i64) -> Result<()> {
        sqlx::query("UPDATE crawler_process SET assigned_item_count = $1 WHERE process_id = $2")
            .bind(count)
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_released_processes(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM crawler_process WHERE NOT active AND system_process_id = 0",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_entries_of_inactive_processes(&self, except: &[String]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_queue
            SET process_scheduled = 0, process_id_assigned = ''
            WHERE process_id_assigned IN (
                  SELECT process_id FROM crawler_process
                  WHERE NOT active AND NOT (process_id = ANY($1))
              )
            "#,
        )
        .bind(except)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_inactive_processes_reapable(&self, except: &[String]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawler_process p
            SET system_process_id = 0
            WHERE NOT p.active
              AND p.system_process_id <> 0
              AND NOT (p.process_id = ANY($1))
              AND NOT EXISTS (
                  SELECT 1 FROM crawler_queue q
                  WHERE q.process_id_assigned = p.process_id AND q.exec_time = 0
              )
            "#,
        )
        .bind(except)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_processes_inactive(&self, process_ids: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE crawler_process SET active = FALSE WHERE active AND process_id = ANY($1)",
        )
        .bind(process_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Record lookup
// ============================================================================

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Resolves `_TABLE:` directives against tables of the current schema.
///
/// Table and column names are checked against `information_schema` before
/// they are interpolated; unknown names produce an empty result.
#[derive(Clone)]
pub struct PostgresRecordLookup {
    pool: PgPool,
    translation_pointer_field: String,
    deleted_field: String,
}

impl PostgresRecordLookup {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            translation_pointer_field: "l10n_parent".to_string(),
            deleted_field: "deleted".to_string(),
        }
    }

    pub fn with_translation_pointer_field(mut self, field: impl Into<String>) -> Self {
        self.translation_pointer_field = field.into();
        self
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("column_name")).collect())
    }
}

#[async_trait]
impl RecordLookup for PostgresRecordLookup {
    async fn lookup(&self, query: &RecordQuery) -> Result<Vec<String>> {
        if !IDENTIFIER.is_match(&query.table) {
            return Ok(Vec::new());
        }

        let columns = self.columns(&query.table).await?;
        let known = |field: &str| IDENTIFIER.is_match(field) && columns.iter().any(|c| c == field);
        if columns.is_empty() || !known(&query.project_field) || !known(&query.pid_field) {
            return Ok(Vec::new());
        }

        let mut from = query.table.clone();
        for extra in query
            .add_table
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            if !IDENTIFIER.is_match(extra) {
                return Err(CrawlerError::Lookup(format!("invalid _ADDTABLE entry: {}", extra)));
            }
            from.push_str(", ");
            from.push_str(extra);
        }

        let mut sql = format!(
            "SELECT {table}.{field}::text AS value FROM {from} WHERE {table}.{pid} = ANY($1)",
            table = query.table,
            field = query.project_field,
            from = from,
            pid = query.pid_field,
        );
        if known(&self.deleted_field) {
            sql.push_str(&format!(" AND {}.{} = 0", query.table, self.deleted_field));
        }
        if !query.where_clause.trim().is_empty() {
            sql.push_str(&format!(" AND ({})", query.where_clause));
        }
        if query.exclude_translations && known(&self.translation_pointer_field) {
            sql.push_str(&format!(
                " AND {}.{} <= 0",
                query.table, self.translation_pointer_field
            ));
        }

        let rows = sqlx::query(&sql)
            .bind(&query.scope_page_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CrawlerError::Lookup(format!("{} ({})", e, query.table)))?;

        Ok(rows
            .iter()
            .filter_map(|r| r.get::<Option<String>, _>("value"))
            .collect())
    }
}
