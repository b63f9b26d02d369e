//! SQLite implementation of the storage capability traits.
//!
//! Runs, checkpoints, schedule state, the leader lease, and API keys are
//! persisted with sqlx over the split read/write pool. JSON-shaped fields
//! (inputs, output, overrides, source, definition, context, scopes) are
//! stored as JSON text columns.

use chrono::{DateTime, Utc};
use conductor_core::backend::{
    ApiKeyStore, CheckpointStore, LeaseStore, RunStore, ScheduleStore,
};
use conductor_types::apikey::ApiKey;
use conductor_types::checkpoint::Checkpoint;
use conductor_types::error::{CoreError, CoreResult};
use conductor_types::lease::{AcquireOutcome, LeaderLease, RenewOutcome};
use conductor_types::run::{Run, RunFilter};
use conductor_types::schedule::ScheduleState;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of all storage capabilities.
pub struct SqliteBackend {
    pool: DatabasePool,
}

impl SqliteBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_sqlx(e: sqlx::Error) -> CoreError {
    match &e {
        sqlx::Error::RowNotFound => CoreError::not_found("row not found").with_source(e),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CoreError::already_exists("unique constraint violated").with_source(e)
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => {
            CoreError::fatal("schema mismatch or corrupt row").with_source(e)
        }
        _ => CoreError::transient("database I/O error").with_source(e),
    }
}

fn json_error(context: &str, e: serde_json::Error) -> CoreError {
    CoreError::fatal(format!("{context}: {e}")).with_source(e)
}

fn parse_datetime(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::fatal(format!("invalid datetime '{s}': {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    source: String,
    status: String,
    inputs: String,
    output: String,
    error: String,
    current_step_id: String,
    completed_step_count: i64,
    total_step_count: i64,
    priority: i64,
    correlation_id: Option<String>,
    workspace: Option<String>,
    profile: Option<String>,
    overrides: String,
    definition: String,
    last_event_seq: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            source: row.try_get("source")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            current_step_id: row.try_get("current_step_id")?,
            completed_step_count: row.try_get("completed_step_count")?,
            total_step_count: row.try_get("total_step_count")?,
            priority: row.try_get("priority")?,
            correlation_id: row.try_get("correlation_id")?,
            workspace: row.try_get("workspace")?,
            profile: row.try_get("profile")?,
            overrides: row.try_get("overrides")?,
            definition: row.try_get("definition")?,
            last_event_seq: row.try_get("last_event_seq")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> CoreResult<Run> {
        Ok(Run {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            source: serde_json::from_str(&self.source)
                .map_err(|e| json_error("invalid run source", e))?,
            status: self
                .status
                .parse()
                .map_err(|e: String| CoreError::fatal(e))?,
            inputs: serde_json::from_str(&self.inputs)
                .map_err(|e| json_error("invalid run inputs", e))?,
            output: serde_json::from_str(&self.output)
                .map_err(|e| json_error("invalid run output", e))?,
            error: self.error,
            current_step_id: self.current_step_id,
            completed_step_count: self.completed_step_count as u32,
            total_step_count: self.total_step_count as u32,
            priority: self.priority as i32,
            correlation_id: self.correlation_id,
            workspace: self.workspace,
            profile: self.profile,
            overrides: serde_json::from_str(&self.overrides)
                .map_err(|e| json_error("invalid run overrides", e))?,
            definition: serde_json::from_str(&self.definition)
                .map_err(|e| json_error("invalid run definition", e))?,
            last_event_seq: self.last_event_seq as u64,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct RunParams {
    source: String,
    inputs: String,
    output: String,
    overrides: String,
    definition: String,
}

impl RunParams {
    fn from_run(run: &Run) -> CoreResult<Self> {
        Ok(Self {
            source: serde_json::to_string(&run.source)
                .map_err(|e| json_error("serialize run source", e))?,
            inputs: serde_json::to_string(&run.inputs)
                .map_err(|e| json_error("serialize run inputs", e))?,
            output: serde_json::to_string(&run.output)
                .map_err(|e| json_error("serialize run output", e))?,
            overrides: serde_json::to_string(&run.overrides)
                .map_err(|e| json_error("serialize run overrides", e))?,
            definition: serde_json::to_string(&run.definition)
                .map_err(|e| json_error("serialize run definition", e))?,
        })
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

impl RunStore for SqliteBackend {
    async fn create_run(&self, run: &Run) -> CoreResult<()> {
        let params = RunParams::from_run(run)?;
        sqlx::query(
            r#"INSERT INTO runs (
                 id, workflow_id, workflow_name, source, status, inputs, output,
                 error, current_step_id, completed_step_count, total_step_count,
                 priority, correlation_id, workspace, profile, overrides,
                 definition, last_event_seq, created_at, started_at,
                 completed_at, updated_at
               ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(&run.workflow_name)
        .bind(&params.source)
        .bind(run.status.as_str())
        .bind(&params.inputs)
        .bind(&params.output)
        .bind(&run.error)
        .bind(&run.current_step_id)
        .bind(run.completed_step_count as i64)
        .bind(run.total_step_count as i64)
        .bind(run.priority as i64)
        .bind(&run.correlation_id)
        .bind(&run.workspace)
        .bind(&run.profile)
        .bind(&params.overrides)
        .bind(&params.definition)
        .bind(run.last_event_seq as i64)
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> CoreResult<Run> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| CoreError::not_found(format!("run '{id}' not found")))?;
        RunRow::from_row(&row).map_err(map_sqlx)?.into_run()
    }

    async fn update_run(&self, run: &Run) -> CoreResult<()> {
        let params = RunParams::from_run(run)?;
        let result = sqlx::query(
            r#"UPDATE runs SET
                 workflow_id = ?, workflow_name = ?, source = ?, status = ?,
                 inputs = ?, output = ?, error = ?, current_step_id = ?,
                 completed_step_count = ?, total_step_count = ?, priority = ?,
                 correlation_id = ?, workspace = ?, profile = ?, overrides = ?,
                 definition = ?, last_event_seq = ?, started_at = ?,
                 completed_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&run.workflow_id)
        .bind(&run.workflow_name)
        .bind(&params.source)
        .bind(run.status.as_str())
        .bind(&params.inputs)
        .bind(&params.output)
        .bind(&run.error)
        .bind(&run.current_step_id)
        .bind(run.completed_step_count as i64)
        .bind(run.total_step_count as i64)
        .bind(run.priority as i64)
        .bind(&run.correlation_id)
        .bind(&run.workspace)
        .bind(&run.profile)
        .bind(&params.overrides)
        .bind(&params.definition)
        .bind(run.last_event_seq as i64)
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(&run.id)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("run '{}' not found", run.id)));
        }
        Ok(())
    }

    async fn delete_run(&self, id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> CoreResult<Vec<Run>> {
        let mut sql = String::from("SELECT * FROM runs");
        let mut clauses = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.workflow.is_some() {
            clauses.push("workflow_name = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC, created_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(workflow) = &filter.workflow {
            query = query.bind(workflow);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(map_sqlx)?.into_run())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteBackend {
    async fn save_checkpoint(&self, cp: &Checkpoint) -> CoreResult<()> {
        let context = serde_json::to_string(&cp.context)
            .map_err(|e| json_error("serialize checkpoint context", e))?;
        sqlx::query(
            r#"INSERT INTO checkpoints (run_id, step_id, step_index, context, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 step_id = excluded.step_id,
                 step_index = excluded.step_index,
                 context = excluded.context,
                 created_at = excluded.created_at"#,
        )
        .bind(&cp.run_id)
        .bind(&cp.step_id)
        .bind(cp.step_index as i64)
        .bind(&context)
        .bind(format_datetime(&cp.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_checkpoint(&self, run_id: &str) -> CoreResult<Checkpoint> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| CoreError::not_found(format!("no checkpoint for run '{run_id}'")))?;

        let context: String = row.try_get("context").map_err(map_sqlx)?;
        let step_index: i64 = row.try_get("step_index").map_err(map_sqlx)?;
        let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
        Ok(Checkpoint {
            run_id: row.try_get("run_id").map_err(map_sqlx)?,
            step_id: row.try_get("step_id").map_err(map_sqlx)?,
            step_index: step_index as u32,
            context: serde_json::from_str(&context)
                .map_err(|e| json_error("invalid checkpoint context", e))?,
            created_at: parse_datetime(&created_at)?,
        })
    }

    async fn delete_checkpoint(&self, run_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

impl ScheduleStore for SqliteBackend {
    async fn save_schedule_state(&self, state: &ScheduleState) -> CoreResult<()> {
        sqlx::query(
            r#"INSERT INTO schedule_state (name, last_fire, success_count, error_count, enabled, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 last_fire = excluded.last_fire,
                 success_count = excluded.success_count,
                 error_count = excluded.error_count,
                 enabled = excluded.enabled,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.name)
        .bind(state.last_fire.as_ref().map(format_datetime))
        .bind(state.success_count as i64)
        .bind(state.error_count as i64)
        .bind(state.enabled)
        .bind(format_datetime(&state.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_schedule_state(&self, name: &str) -> CoreResult<ScheduleState> {
        let row = sqlx::query("SELECT * FROM schedule_state WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| CoreError::not_found(format!("schedule '{name}' not found")))?;
        schedule_state_from_row(&row)
    }

    async fn list_schedule_states(&self) -> CoreResult<Vec<ScheduleState>> {
        let rows = sqlx::query("SELECT * FROM schedule_state ORDER BY name")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(schedule_state_from_row).collect()
    }

    async fn delete_schedule_state(&self, name: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM schedule_state WHERE name = ?")
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

fn schedule_state_from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<ScheduleState> {
    let last_fire: Option<String> = row.try_get("last_fire").map_err(map_sqlx)?;
    let success_count: i64 = row.try_get("success_count").map_err(map_sqlx)?;
    let error_count: i64 = row.try_get("error_count").map_err(map_sqlx)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_sqlx)?;
    Ok(ScheduleState {
        name: row.try_get("name").map_err(map_sqlx)?,
        last_fire: last_fire.as_deref().map(parse_datetime).transpose()?,
        success_count: success_count as u64,
        error_count: error_count as u64,
        enabled: row.try_get("enabled").map_err(map_sqlx)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

impl LeaseStore for SqliteBackend {
    async fn try_acquire(
        &self,
        instance_id: &str,
        ttl: std::time::Duration,
    ) -> CoreResult<AcquireOutcome> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CoreError::invalid_input(e.to_string()))?;

        // Conditional upsert: take the row when absent, expired, or
        // already ours. The WHERE on the DO UPDATE makes losing attempts
        // affect zero rows.
        let result = sqlx::query(
            r#"INSERT INTO leader_lease (id, holder_instance_id, acquired_at, expires_at)
               VALUES (1, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 holder_instance_id = excluded.holder_instance_id,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at
               WHERE leader_lease.expires_at <= excluded.acquired_at
                  OR leader_lease.holder_instance_id = excluded.holder_instance_id"#,
        )
        .bind(instance_id)
        .bind(format_datetime(&now))
        .bind(format_datetime(&expires_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(AcquireOutcome::Acquired(LeaderLease {
                holder_instance_id: instance_id.to_string(),
                acquired_at: now,
                expires_at,
            }));
        }

        let holder: (String,) =
            sqlx::query_as("SELECT holder_instance_id FROM leader_lease WHERE id = 1")
                .fetch_one(&self.pool.reader)
                .await
                .map_err(map_sqlx)?;
        Ok(AcquireOutcome::HeldByOther {
            holder_instance_id: holder.0,
        })
    }

    async fn renew(
        &self,
        instance_id: &str,
        ttl: std::time::Duration,
    ) -> CoreResult<RenewOutcome> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CoreError::invalid_input(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE leader_lease SET expires_at = ?
               WHERE id = 1 AND holder_instance_id = ? AND expires_at > ?"#,
        )
        .bind(format_datetime(&expires_at))
        .bind(instance_id)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            Ok(RenewOutcome::Renewed)
        } else {
            Ok(RenewOutcome::Lost)
        }
    }

    async fn release(&self, instance_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM leader_lease WHERE id = 1 AND holder_instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ApiKeyStore
// ---------------------------------------------------------------------------

impl ApiKeyStore for SqliteBackend {
    async fn insert_api_key(&self, key: &ApiKey) -> CoreResult<()> {
        let scopes = serde_json::to_string(&key.scopes)
            .map_err(|e| json_error("serialize key scopes", e))?;
        sqlx::query(
            r#"INSERT INTO api_keys (id, key_hash, name, created_at, expires_at, scopes)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.name)
        .bind(format_datetime(&key.created_at))
        .bind(key.expires_at.as_ref().map(format_datetime))
        .bind(&scopes)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> CoreResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn list_api_keys(&self) -> CoreResult<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY created_at")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(api_key_from_row).collect()
    }
}

fn api_key_from_row(row: &sqlx::sqlite::SqliteRow) -> CoreResult<ApiKey> {
    let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
    let expires_at: Option<String> = row.try_get("expires_at").map_err(map_sqlx)?;
    let scopes: String = row.try_get("scopes").map_err(map_sqlx)?;
    Ok(ApiKey {
        id: row.try_get("id").map_err(map_sqlx)?,
        key_hash: row.try_get("key_hash").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        created_at: parse_datetime(&created_at)?,
        expires_at: expires_at.as_deref().map(parse_datetime).transpose()?,
        scopes: serde_json::from_str(&scopes)
            .map_err(|e| json_error("invalid key scopes", e))?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
