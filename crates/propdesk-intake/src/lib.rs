//! Intake reconciliation engine: run/job lifecycle, webhook ingestion with
//! idempotency, the three-layer data model (raw extraction, override patch,
//! merged view) and active-source rebase.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propdesk_core::{
    apply_sanitized, defined, fallback_dataset, merge, provenance, prune_matching, sanitize,
    FieldSource, IntakeStatus,
};
use propdesk_storage::{
    signature_header, verify_signature, DocumentStore, ParserClient, ParserNotification,
    StorageError,
};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "propdesk-intake";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("webhook signature rejected")]
    SignatureRejected,
}

impl From<sqlx::Error> for IntakeError {
    fn from(err: sqlx::Error) -> Self {
        IntakeError::Persistence(err.to_string())
    }
}

/// One attempt to extract structured data from one uploaded file for one
/// property object. Terminal statuses are final.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRun {
    pub id: Uuid,
    pub object_id: String,
    pub upload_storage_path: String,
    pub filename: String,
    pub status: IntakeStatus,
    #[serde(rename = "uploadedAt")]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
}

/// Dispatch unit sent to the external parser; carries the same terminal
/// status as its run after ingestion completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeJob {
    pub id: Uuid,
    pub intake_run_id: Uuid,
    pub status: IntakeStatus,
    pub webhook_target: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
}

/// Immutable whitelist-filtered extraction output, keyed 1:1 with a
/// succeeded run. Upserts keep the original `created_at`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub intake_run_id: Uuid,
    pub data: JsonMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// The single mutable per-object correction layer. Keys are a subset of the
/// field whitelist; a key that stops diverging from raw is removed, never
/// stored as null.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectOverride {
    pub object_id: String,
    pub base_intake_run_id: Option<Uuid>,
    pub data: JsonMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

/// Per-run patch layer for cleaning up one extraction before deciding to
/// promote it; independent of the object-level override.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorDraft {
    pub intake_run_id: Uuid,
    pub data: JsonMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row, written for every inbound callback before any
/// business effect is evaluated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub job_id: String,
    pub event_type: String,
    pub payload: Value,
    pub signature_valid: bool,
    pub received_at: DateTime<Utc>,
}

/// Persistence contract for the reconciliation engine. The in-memory
/// implementation backs tests and secret-free development; the Postgres
/// implementation backs deployments.
#[async_trait]
pub trait IntakeStore: Send + Sync {
    async fn insert_run(&self, run: &IntakeRun) -> Result<(), IntakeError>;
    async fn update_run(&self, run: &IntakeRun) -> Result<(), IntakeError>;
    async fn run(&self, id: Uuid) -> Result<Option<IntakeRun>, IntakeError>;
    async fn runs_for_object(&self, object_id: &str) -> Result<Vec<IntakeRun>, IntakeError>;
    async fn succeeded_runs_for_object(&self, object_id: &str)
        -> Result<Vec<IntakeRun>, IntakeError>;

    async fn insert_job(&self, job: &IntakeJob) -> Result<(), IntakeError>;
    async fn update_job(&self, job: &IntakeJob) -> Result<(), IntakeError>;
    async fn job(&self, id: Uuid) -> Result<Option<IntakeJob>, IntakeError>;
    async fn job_for_run(&self, run_id: Uuid) -> Result<Option<IntakeJob>, IntakeError>;

    async fn upsert_extraction(&self, result: &ExtractionResult) -> Result<(), IntakeError>;
    async fn extraction(&self, run_id: Uuid) -> Result<Option<ExtractionResult>, IntakeError>;

    async fn override_row(&self, object_id: &str) -> Result<Option<ObjectOverride>, IntakeError>;
    async fn put_override(&self, row: &ObjectOverride) -> Result<(), IntakeError>;

    async fn draft(&self, run_id: Uuid) -> Result<Option<EditorDraft>, IntakeError>;
    async fn put_draft(&self, draft: &EditorDraft) -> Result<(), IntakeError>;

    async fn append_webhook_event(&self, event: &WebhookEvent) -> Result<(), IntakeError>;
    async fn webhook_events_for_job(&self, job_id: &str)
        -> Result<Vec<WebhookEvent>, IntakeError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<Uuid, IntakeRun>,
    jobs: HashMap<Uuid, IntakeJob>,
    extractions: HashMap<Uuid, ExtractionResult>,
    overrides: HashMap<String, ObjectOverride>,
    drafts: HashMap<Uuid, EditorDraft>,
    webhook_events: Vec<WebhookEvent>,
}

/// Mutex-guarded map store, used by tests and when no `DATABASE_URL` is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryIntakeStore {
    state: Mutex<MemoryState>,
}

impl MemoryIntakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntakeStore for MemoryIntakeStore {
    async fn insert_run(&self, run: &IntakeRun) -> Result<(), IntakeError> {
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &IntakeRun) -> Result<(), IntakeError> {
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<IntakeRun>, IntakeError> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn runs_for_object(&self, object_id: &str) -> Result<Vec<IntakeRun>, IntakeError> {
        let state = self.state.lock().await;
        let mut runs: Vec<IntakeRun> = state
            .runs
            .values()
            .filter(|r| r.object_id == object_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn succeeded_runs_for_object(
        &self,
        object_id: &str,
    ) -> Result<Vec<IntakeRun>, IntakeError> {
        let state = self.state.lock().await;
        let mut runs: Vec<IntakeRun> = state
            .runs
            .values()
            .filter(|r| r.object_id == object_id && r.status == IntakeStatus::Succeeded)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        Ok(runs)
    }

    async fn insert_job(&self, job: &IntakeJob) -> Result<(), IntakeError> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &IntakeJob) -> Result<(), IntakeError> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<IntakeJob>, IntakeError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn job_for_run(&self, run_id: Uuid) -> Result<Option<IntakeJob>, IntakeError> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .values()
            .find(|j| j.intake_run_id == run_id)
            .cloned())
    }

    async fn upsert_extraction(&self, result: &ExtractionResult) -> Result<(), IntakeError> {
        let mut state = self.state.lock().await;
        match state.extractions.get_mut(&result.intake_run_id) {
            Some(existing) => existing.data = result.data.clone(),
            None => {
                state
                    .extractions
                    .insert(result.intake_run_id, result.clone());
            }
        }
        Ok(())
    }

    async fn extraction(&self, run_id: Uuid) -> Result<Option<ExtractionResult>, IntakeError> {
        Ok(self.state.lock().await.extractions.get(&run_id).cloned())
    }

    async fn override_row(&self, object_id: &str) -> Result<Option<ObjectOverride>, IntakeError> {
        Ok(self.state.lock().await.overrides.get(object_id).cloned())
    }

    async fn put_override(&self, row: &ObjectOverride) -> Result<(), IntakeError> {
        self.state
            .lock()
            .await
            .overrides
            .insert(row.object_id.clone(), row.clone());
        Ok(())
    }

    async fn draft(&self, run_id: Uuid) -> Result<Option<EditorDraft>, IntakeError> {
        Ok(self.state.lock().await.drafts.get(&run_id).cloned())
    }

    async fn put_draft(&self, draft: &EditorDraft) -> Result<(), IntakeError> {
        self.state
            .lock()
            .await
            .drafts
            .insert(draft.intake_run_id, draft.clone());
        Ok(())
    }

    async fn append_webhook_event(&self, event: &WebhookEvent) -> Result<(), IntakeError> {
        self.state.lock().await.webhook_events.push(event.clone());
        Ok(())
    }

    async fn webhook_events_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<WebhookEvent>, IntakeError> {
        Ok(self
            .state
            .lock()
            .await
            .webhook_events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Postgres-backed store; runtime-checked queries with JSONB payload
/// columns, schema applied through the embedded migrations.
pub struct PgIntakeStore {
    pool: PgPool,
}

impl PgIntakeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, IntakeError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), IntakeError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| IntakeError::Persistence(err.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_from_value(value: Value) -> JsonMap<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

fn run_from_row(row: &PgRow) -> Result<IntakeRun, IntakeError> {
    let status: String = row.try_get("status")?;
    Ok(IntakeRun {
        id: row.try_get("id")?,
        object_id: row.try_get("object_id")?,
        upload_storage_path: row.try_get("upload_storage_path")?,
        filename: row.try_get("filename")?,
        status: IntakeStatus::from(status.as_str()),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_text: row.try_get("error_text")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<IntakeJob, IntakeError> {
    let status: String = row.try_get("status")?;
    Ok(IntakeJob {
        id: row.try_get("id")?,
        intake_run_id: row.try_get("intake_run_id")?,
        status: IntakeStatus::from(status.as_str()),
        webhook_target: row.try_get("webhook_target")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_text: row.try_get("error_text")?,
    })
}

#[async_trait]
impl IntakeStore for PgIntakeStore {
    async fn insert_run(&self, run: &IntakeRun) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO intake_runs
                (id, object_id, upload_storage_path, filename, status,
                 created_at, started_at, finished_at, error_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(&run.object_id)
        .bind(&run.upload_storage_path)
        .bind(&run.filename)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &IntakeRun) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            UPDATE intake_runs
               SET status = $2,
                   started_at = $3,
                   finished_at = $4,
                   error_text = $5
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, id: Uuid) -> Result<Option<IntakeRun>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT id, object_id, upload_storage_path, filename, status,
                   created_at, started_at, finished_at, error_text
              FROM intake_runs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_for_object(&self, object_id: &str) -> Result<Vec<IntakeRun>, IntakeError> {
        let rows = sqlx::query(
            r#"
            SELECT id, object_id, upload_storage_path, filename, status,
                   created_at, started_at, finished_at, error_text
              FROM intake_runs
             WHERE object_id = $1
             ORDER BY created_at DESC
            "#,
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn succeeded_runs_for_object(
        &self,
        object_id: &str,
    ) -> Result<Vec<IntakeRun>, IntakeError> {
        let rows = sqlx::query(
            r#"
            SELECT id, object_id, upload_storage_path, filename, status,
                   created_at, started_at, finished_at, error_text
              FROM intake_runs
             WHERE object_id = $1
               AND status = 'succeeded'
             ORDER BY finished_at DESC NULLS LAST
            "#,
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn insert_job(&self, job: &IntakeJob) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO intake_jobs
                (id, intake_run_id, status, webhook_target,
                 started_at, finished_at, error_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.intake_run_id)
        .bind(job.status.as_str())
        .bind(&job.webhook_target)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &IntakeJob) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            UPDATE intake_jobs
               SET status = $2,
                   started_at = $3,
                   finished_at = $4,
                   error_text = $5
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<IntakeJob>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT id, intake_run_id, status, webhook_target,
                   started_at, finished_at, error_text
              FROM intake_jobs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn job_for_run(&self, run_id: Uuid) -> Result<Option<IntakeJob>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT id, intake_run_id, status, webhook_target,
                   started_at, finished_at, error_text
              FROM intake_jobs
             WHERE intake_run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn upsert_extraction(&self, result: &ExtractionResult) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO extraction_results (intake_run_id, data, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (intake_run_id)
            DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(result.intake_run_id)
        .bind(Value::Object(result.data.clone()))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn extraction(&self, run_id: Uuid) -> Result<Option<ExtractionResult>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT intake_run_id, data, created_at
              FROM extraction_results
             WHERE intake_run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: Value = row.try_get("data")?;
        Ok(Some(ExtractionResult {
            intake_run_id: row.try_get("intake_run_id")?,
            data: map_from_value(data),
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn override_row(&self, object_id: &str) -> Result<Option<ObjectOverride>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT object_id, base_intake_run_id, data, updated_at
              FROM object_overrides
             WHERE object_id = $1
            "#,
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: Value = row.try_get("data")?;
        Ok(Some(ObjectOverride {
            object_id: row.try_get("object_id")?,
            base_intake_run_id: row.try_get("base_intake_run_id")?,
            data: map_from_value(data),
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn put_override(&self, row: &ObjectOverride) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO object_overrides (object_id, base_intake_run_id, data, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (object_id)
            DO UPDATE SET base_intake_run_id = EXCLUDED.base_intake_run_id,
                          data = EXCLUDED.data,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.object_id)
        .bind(row.base_intake_run_id)
        .bind(Value::Object(row.data.clone()))
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn draft(&self, run_id: Uuid) -> Result<Option<EditorDraft>, IntakeError> {
        let row = sqlx::query(
            r#"
            SELECT intake_run_id, data, updated_at
              FROM editor_drafts
             WHERE intake_run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: Value = row.try_get("data")?;
        Ok(Some(EditorDraft {
            intake_run_id: row.try_get("intake_run_id")?,
            data: map_from_value(data),
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn put_draft(&self, draft: &EditorDraft) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO editor_drafts (intake_run_id, data, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (intake_run_id)
            DO UPDATE SET data = EXCLUDED.data,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(draft.intake_run_id)
        .bind(Value::Object(draft.data.clone()))
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_webhook_event(&self, event: &WebhookEvent) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (job_id, event_type, payload, signature_valid, received_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.job_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.signature_valid)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn webhook_events_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<WebhookEvent>, IntakeError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, event_type, payload, signature_valid, received_at
              FROM webhook_events
             WHERE job_id = $1
             ORDER BY received_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WebhookEvent {
                job_id: row.try_get("job_id")?,
                event_type: row.try_get("event_type")?,
                payload: row.try_get("payload")?,
                signature_valid: row.try_get("signature_valid")?,
                received_at: row.try_get("received_at")?,
            });
        }
        Ok(out)
    }
}

/// Development-only synchronous completion outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulateOutcome {
    Ok,
    Fail,
}

impl SimulateOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Some(SimulateOutcome::Ok),
            "fail" => Some(SimulateOutcome::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub database_url: Option<String>,
    pub documents_dir: PathBuf,
    pub webhook_secret: Option<String>,
    pub webhook_url: Option<String>,
    pub enforce_signatures: bool,
    pub auto_simulate: Option<SimulateOutcome>,
    pub parser_url: Option<String>,
    pub web_port: u16,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            documents_dir: PathBuf::from("./documents"),
            webhook_secret: None,
            webhook_url: None,
            enforce_signatures: false,
            auto_simulate: None,
            parser_url: None,
            web_port: 8000,
        }
    }
}

impl IntakeConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            documents_dir: std::env::var("DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./documents")),
            webhook_secret: std::env::var("PROPDESK_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            webhook_url: std::env::var("PROPDESK_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            enforce_signatures: std::env::var("PROPDESK_ENFORCE_SIGNATURES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            auto_simulate: std::env::var("PROPDESK_AUTO_SIMULATE")
                .ok()
                .as_deref()
                .and_then(SimulateOutcome::parse),
            parser_url: std::env::var("PARSER_URL").ok().filter(|s| !s.is_empty()),
            web_port: std::env::var("PROPDESK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsedSource {
    Run,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: Uuid,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: IntakeStatus,
}

impl From<&IntakeRun> for RunSummary {
    fn from(run: &IntakeRun) -> Self {
        Self {
            id: run.id,
            filename: run.filename.clone(),
            uploaded_at: run.created_at,
            finished_at: run.finished_at,
            status: run.status.clone(),
        }
    }
}

/// Full reconciliation snapshot for one object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeState {
    pub active_intake_run_id: Option<Uuid>,
    pub used_source: UsedSource,
    pub raw: JsonMap<String, Value>,
    pub overrides: JsonMap<String, Value>,
    pub merged: JsonMap<String, Value>,
    pub provenance: BTreeMap<String, FieldSource>,
    pub runs: Vec<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideView {
    pub overrides: JsonMap<String, Value>,
    pub merged: JsonMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSwitchView {
    pub active_intake_id: Uuid,
    pub raw: JsonMap<String, Value>,
    pub overrides: JsonMap<String, Value>,
    pub merged: JsonMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorView {
    pub raw: JsonMap<String, Value>,
    pub draft: JsonMap<String, Value>,
    pub merged: JsonMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct WebhookOutcome {
    pub applied_status: IntakeStatus,
    pub idempotent: bool,
}

/// Dataset injected by the development simulate path; flows through the
/// normal webhook contract so the state machine is exercised identically.
pub fn simulated_extraction() -> Value {
    serde_json::json!({
        "schemaVersion": "v1",
        "address": "Main St 1",
        "area": 50,
        "rooms": 3,
        "yearBuilt": 1998,
        "energyRating": "B",
    })
}

fn merge_maps(
    base: &JsonMap<String, Value>,
    patch: &JsonMap<String, Value>,
) -> JsonMap<String, Value> {
    match merge(
        &Value::Object(base.clone()),
        &Value::Object(patch.clone()),
    ) {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Request-scoped entry point for the reconciliation engine; injected into
/// every handler instead of living behind a global connection.
pub struct IntakeService {
    store: Arc<dyn IntakeStore>,
    documents: DocumentStore,
    parser: Option<Arc<ParserClient>>,
    config: IntakeConfig,
}

impl IntakeService {
    pub fn new(store: Arc<dyn IntakeStore>, documents: DocumentStore, config: IntakeConfig) -> Self {
        let parser = config
            .parser_url
            .as_ref()
            .and_then(|url| ParserClient::new(url.clone(), Duration::from_secs(20)).ok())
            .map(Arc::new);
        Self {
            store,
            documents,
            parser,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn IntakeStore> {
        &self.store
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    fn webhook_target(&self, origin: Option<&str>) -> String {
        if let Some(url) = &self.config.webhook_url {
            return url.clone();
        }
        match origin {
            Some(host) if !host.is_empty() => format!("http://{host}/webhooks/parser"),
            _ => format!("http://localhost:{}/webhooks/parser", self.config.web_port),
        }
    }

    /// Upload entry point: blob write first (nothing is queued if it fails),
    /// then run+job in `queued`, then dispatch to `processing`.
    pub async fn create_run(
        &self,
        object_id: &str,
        filename: &str,
        bytes: &[u8],
        origin: Option<&str>,
        simulate: Option<SimulateOutcome>,
    ) -> Result<IntakeRun, IntakeError> {
        if object_id.trim().is_empty() {
            return Err(IntakeError::Validation("missing objectId".to_string()));
        }
        if filename.trim().is_empty() || bytes.is_empty() {
            return Err(IntakeError::Validation("missing file".to_string()));
        }

        let now = Utc::now();
        let extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let stored = self
            .documents
            .store_bytes(now, object_id, extension, bytes)
            .await?;

        let mut run = IntakeRun {
            id: Uuid::new_v4(),
            object_id: object_id.to_string(),
            upload_storage_path: stored.relative_path.display().to_string(),
            filename: filename.to_string(),
            status: IntakeStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            error_text: None,
        };
        let mut job = IntakeJob {
            id: Uuid::new_v4(),
            intake_run_id: run.id,
            status: IntakeStatus::Queued,
            webhook_target: self.webhook_target(origin),
            started_at: None,
            finished_at: None,
            error_text: None,
        };
        self.store.insert_run(&run).await?;
        self.store.insert_job(&job).await?;

        let started = Utc::now();
        run.status = IntakeStatus::Processing;
        run.started_at = Some(started);
        job.status = IntakeStatus::Processing;
        job.started_at = Some(started);
        self.store.update_run(&run).await?;
        self.store.update_job(&job).await?;
        info!(run_id = %run.id, job_id = %job.id, object_id, "intake run dispatched");

        if let Some(outcome) = simulate.or(self.config.auto_simulate) {
            self.feed_simulated(job.id, run.id, outcome).await?;
            if let Some(updated) = self.store.run(run.id).await? {
                return Ok(updated);
            }
            return Ok(run);
        }

        if let Some(parser) = &self.parser {
            let parser = Arc::clone(parser);
            let notification = ParserNotification {
                job_id: job.id,
                intake_run_id: run.id,
                object_id: run.object_id.clone(),
                document_path: run.upload_storage_path.clone(),
                callback_url: job.webhook_target.clone(),
            };
            // Fire-and-forget: a notify failure never rolls the queued run
            // back, it only surfaces in the log.
            tokio::spawn(async move {
                if let Err(err) = parser.notify(&notification).await {
                    warn!(
                        intake_run_id = %notification.intake_run_id,
                        error = %err,
                        "parser notification failed; run stays processing until a callback arrives"
                    );
                }
            });
        } else {
            info!(run_id = %run.id, "no parser endpoint configured; awaiting webhook callback");
        }

        Ok(run)
    }

    pub async fn runs_for_object(&self, object_id: &str) -> Result<Vec<RunSummary>, IntakeError> {
        if object_id.trim().is_empty() {
            return Err(IntakeError::Validation("missing objectId".to_string()));
        }
        let runs = self.store.runs_for_object(object_id).await?;
        Ok(runs.iter().map(RunSummary::from).collect())
    }

    /// Apply one inbound parser callback. Ordering: audit write, signature
    /// evaluation, then at most one state transition. A job already terminal
    /// is reported as idempotent success so parser retries stay simple.
    pub async fn ingest_webhook(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, IntakeError> {
        let payload: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);
        let signature_valid =
            verify_signature(self.config.webhook_secret.as_deref(), raw_body, signature);
        let job_id_text = payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let event_type = payload
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        self.store
            .append_webhook_event(&WebhookEvent {
                job_id: job_id_text.clone().unwrap_or_default(),
                event_type: event_type.clone(),
                payload: payload.clone(),
                signature_valid,
                received_at: Utc::now(),
            })
            .await?;

        if !signature_valid {
            warn!(
                job_id = job_id_text.as_deref().unwrap_or(""),
                enforced = self.config.enforce_signatures,
                "webhook signature did not verify"
            );
            if self.config.enforce_signatures {
                return Err(IntakeError::SignatureRejected);
            }
        }

        let job_id_text =
            job_id_text.ok_or_else(|| IntakeError::Validation("missing job_id".to_string()))?;
        let job_id = Uuid::parse_str(&job_id_text)
            .map_err(|_| IntakeError::NotFound(format!("unknown job {job_id_text}")))?;
        let Some(mut job) = self.store.job(job_id).await? else {
            return Err(IntakeError::NotFound(format!("unknown job {job_id}")));
        };

        if job.status.is_terminal() {
            info!(%job_id, status = %job.status, "duplicate delivery for terminal job ignored");
            return Ok(WebhookOutcome {
                applied_status: job.status,
                idempotent: true,
            });
        }

        let Some(mut run) = self.store.run(job.intake_run_id).await? else {
            return Err(IntakeError::NotFound(format!(
                "run missing for job {job_id}"
            )));
        };

        let status = IntakeStatus::from(event_type.as_str());
        let now = Utc::now();
        match &status {
            IntakeStatus::Succeeded => {
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                let filtered = defined(&sanitize(&data));
                self.store
                    .upsert_extraction(&ExtractionResult {
                        intake_run_id: run.id,
                        data: filtered,
                        created_at: now,
                    })
                    .await?;
                job.status = IntakeStatus::Succeeded;
                job.finished_at = Some(now);
                job.error_text = None;
                run.status = IntakeStatus::Succeeded;
                run.finished_at = Some(now);
                run.error_text = None;
            }
            IntakeStatus::Failed => {
                let error_text = payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("parser reported failure")
                    .to_string();
                job.status = IntakeStatus::Failed;
                job.finished_at = Some(now);
                job.error_text = Some(error_text.clone());
                run.status = IntakeStatus::Failed;
                run.finished_at = Some(now);
                run.error_text = Some(error_text);
            }
            other => {
                // Vocabulary outside the known set passes through verbatim
                // as a non-terminal update.
                job.status = other.clone();
                run.status = other.clone();
            }
        }
        self.store.update_job(&job).await?;
        self.store.update_run(&run).await?;
        info!(%job_id, run_id = %run.id, status = %run.status, "webhook transition applied");

        Ok(WebhookOutcome {
            applied_status: run.status,
            idempotent: false,
        })
    }

    /// Development trigger: complete an in-flight run without the external
    /// parser, through the same webhook contract.
    pub async fn simulate(
        &self,
        run_id: Uuid,
        outcome: SimulateOutcome,
    ) -> Result<WebhookOutcome, IntakeError> {
        let Some(job) = self.store.job_for_run(run_id).await? else {
            return Err(IntakeError::NotFound(format!("no job for run {run_id}")));
        };
        self.feed_simulated(job.id, run_id, outcome).await
    }

    async fn feed_simulated(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        outcome: SimulateOutcome,
    ) -> Result<WebhookOutcome, IntakeError> {
        let payload = match outcome {
            SimulateOutcome::Ok => serde_json::json!({
                "job_id": job_id,
                "intake_id": run_id,
                "status": "succeeded",
                "data": simulated_extraction(),
                "duration_ms": 0,
                "parser_version": "simulated",
            }),
            SimulateOutcome::Fail => serde_json::json!({
                "job_id": job_id,
                "intake_id": run_id,
                "status": "failed",
                "error": "simulated parser failure",
                "parser_version": "simulated",
            }),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|err| IntakeError::Persistence(err.to_string()))?;
        let signature = self
            .config
            .webhook_secret
            .as_deref()
            .map(|secret| signature_header(secret, &body));
        self.ingest_webhook(&body, signature.as_deref()).await
    }

    async fn resolve_active(
        &self,
        object_id: &str,
        base: Option<Uuid>,
    ) -> Result<Option<(Uuid, JsonMap<String, Value>)>, IntakeError> {
        if let Some(base) = base {
            if let Some(extraction) = self.store.extraction(base).await? {
                return Ok(Some((base, extraction.data)));
            }
        }
        for run in self.store.succeeded_runs_for_object(object_id).await? {
            if let Some(extraction) = self.store.extraction(run.id).await? {
                return Ok(Some((run.id, extraction.data)));
            }
        }
        Ok(None)
    }

    /// Read contract: never errors for missing data, falls back to the
    /// placeholder dataset so the UI always renders.
    pub async fn intake_state(&self, object_id: &str) -> Result<IntakeState, IntakeError> {
        if object_id.trim().is_empty() {
            return Err(IntakeError::Validation("missing object id".to_string()));
        }
        let row = self.store.override_row(object_id).await?;
        let (base, overrides) = match row {
            Some(row) => (row.base_intake_run_id, row.data),
            None => (None, JsonMap::new()),
        };
        let active = self.resolve_active(object_id, base).await?;
        let (active_id, raw, used_source) = match active {
            Some((id, raw)) => (Some(id), raw, UsedSource::Run),
            None => (None, fallback_dataset(), UsedSource::Fallback),
        };
        let merged = merge_maps(&raw, &overrides);
        let tags = provenance(&raw, &overrides);
        let runs = self
            .store
            .succeeded_runs_for_object(object_id)
            .await?
            .iter()
            .map(RunSummary::from)
            .collect();
        Ok(IntakeState {
            active_intake_run_id: active_id,
            used_source,
            raw,
            overrides,
            merged,
            provenance: tags,
            runs,
        })
    }

    /// Write contract: sanitize, accumulate onto the existing override data,
    /// drop explicitly-cleared keys and keys that stopped diverging from the
    /// active raw value.
    pub async fn apply_override_patch(
        &self,
        object_id: &str,
        raw_patch: &Value,
    ) -> Result<OverrideView, IntakeError> {
        if object_id.trim().is_empty() {
            return Err(IntakeError::Validation("missing object id".to_string()));
        }
        let existing = self.store.override_row(object_id).await?;
        let (base, data) = match existing {
            Some(row) => (row.base_intake_run_id, row.data),
            None => (None, JsonMap::new()),
        };
        let mut data = apply_sanitized(&data, &sanitize(raw_patch));
        let active = self.resolve_active(object_id, base).await?;
        let (active_id, raw) = match active {
            Some((id, raw)) => {
                prune_matching(&mut data, &raw);
                (Some(id), raw)
            }
            None => (None, fallback_dataset()),
        };
        let row = ObjectOverride {
            object_id: object_id.to_string(),
            base_intake_run_id: base.or(active_id),
            data: data.clone(),
            updated_at: Utc::now(),
        };
        self.store.put_override(&row).await?;
        let merged = merge_maps(&raw, &data);
        Ok(OverrideView {
            overrides: data,
            merged,
        })
    }

    /// Remove the named override keys, or all of them when none are given;
    /// the active-source pointer is preserved.
    pub async fn reset_override_fields(
        &self,
        object_id: &str,
        keys: &[String],
    ) -> Result<OverrideView, IntakeError> {
        if object_id.trim().is_empty() {
            return Err(IntakeError::Validation("missing object id".to_string()));
        }
        let existing = self.store.override_row(object_id).await?;
        let (base, mut data) = match existing {
            Some(row) => (row.base_intake_run_id, row.data),
            None => (None, JsonMap::new()),
        };
        if keys.is_empty() {
            data.clear();
        } else {
            for key in keys {
                data.remove(key);
            }
        }
        let active = self.resolve_active(object_id, base).await?;
        let (active_id, raw) = match active {
            Some((id, raw)) => (Some(id), raw),
            None => (None, fallback_dataset()),
        };
        let row = ObjectOverride {
            object_id: object_id.to_string(),
            base_intake_run_id: base.or(active_id),
            data: data.clone(),
            updated_at: Utc::now(),
        };
        self.store.put_override(&row).await?;
        let merged = merge_maps(&raw, &data);
        Ok(OverrideView {
            overrides: data,
            merged,
        })
    }

    /// Rebase: make `run_id` the authoritative source for the object and
    /// prune override keys that merely duplicated the new raw values, so a
    /// stale pin cannot mask future changes to the new source.
    pub async fn select_source(
        &self,
        object_id: &str,
        run_id: Uuid,
    ) -> Result<SourceSwitchView, IntakeError> {
        let Some(run) = self.store.run(run_id).await? else {
            return Err(IntakeError::NotFound(format!("unknown intake run {run_id}")));
        };
        if run.object_id != object_id {
            return Err(IntakeError::NotFound(format!(
                "intake run {run_id} does not belong to object {object_id}"
            )));
        }
        let Some(extraction) = self.store.extraction(run_id).await? else {
            return Err(IntakeError::NotFound(format!(
                "no extraction stored for intake run {run_id}"
            )));
        };

        let mut data = self
            .store
            .override_row(object_id)
            .await?
            .map(|row| row.data)
            .unwrap_or_default();
        prune_matching(&mut data, &extraction.data);

        let row = ObjectOverride {
            object_id: object_id.to_string(),
            base_intake_run_id: Some(run_id),
            data: data.clone(),
            updated_at: Utc::now(),
        };
        self.store.put_override(&row).await?;
        info!(object_id, %run_id, "active intake source switched");

        let merged = merge_maps(&extraction.data, &data);
        Ok(SourceSwitchView {
            active_intake_id: run_id,
            raw: extraction.data,
            overrides: data,
            merged,
        })
    }

    pub async fn editor_view(&self, run_id: Uuid) -> Result<EditorView, IntakeError> {
        let Some(extraction) = self.store.extraction(run_id).await? else {
            return Err(IntakeError::NotFound(format!(
                "no extraction stored for intake run {run_id}"
            )));
        };
        let draft = self
            .store
            .draft(run_id)
            .await?
            .map(|d| d.data)
            .unwrap_or_default();
        let merged = merge_maps(&extraction.data, &draft);
        Ok(EditorView {
            raw: extraction.data,
            draft,
            merged,
        })
    }

    pub async fn save_editor_patch(
        &self,
        run_id: Uuid,
        raw_patch: &Value,
    ) -> Result<EditorView, IntakeError> {
        let Some(extraction) = self.store.extraction(run_id).await? else {
            return Err(IntakeError::NotFound(format!(
                "no extraction stored for intake run {run_id}"
            )));
        };
        let existing = self
            .store
            .draft(run_id)
            .await?
            .map(|d| d.data)
            .unwrap_or_default();
        let data = apply_sanitized(&existing, &sanitize(raw_patch));
        self.store
            .put_draft(&EditorDraft {
                intake_run_id: run_id,
                data: data.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        let merged = merge_maps(&extraction.data, &data);
        Ok(EditorView {
            raw: extraction.data,
            draft: data,
            merged,
        })
    }
}

/// Build a service from the environment: Postgres when `DATABASE_URL` is
/// set (migrations applied), in-memory otherwise.
pub async fn service_from_env() -> anyhow::Result<IntakeService> {
    let config = IntakeConfig::from_env();
    let store: Arc<dyn IntakeStore> = match &config.database_url {
        Some(url) => {
            let store = PgIntakeStore::connect(url).await?;
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => Arc::new(MemoryIntakeStore::new()),
    };
    let documents = DocumentStore::new(config.documents_dir.clone());
    Ok(IntakeService::new(store, documents, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn test_service_with(config: IntakeConfig) -> (IntakeService, TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryIntakeStore::new());
        let service = IntakeService::new(store, DocumentStore::new(dir.path()), config);
        (service, dir)
    }

    fn test_service() -> (IntakeService, TempDir) {
        test_service_with(IntakeConfig::default())
    }

    async fn upload(service: &IntakeService, object_id: &str) -> IntakeRun {
        service
            .create_run(object_id, "expose.pdf", b"%PDF-1.4 test", None, None)
            .await
            .expect("create run")
    }

    async fn deliver(service: &IntakeService, payload: Value) -> Result<WebhookOutcome, IntakeError> {
        let body = serde_json::to_vec(&payload).expect("payload bytes");
        service.ingest_webhook(&body, None).await
    }

    async fn deliver_success(service: &IntakeService, run_id: Uuid, data: Value) -> WebhookOutcome {
        let job = service
            .store()
            .job_for_run(run_id)
            .await
            .expect("store read")
            .expect("job exists");
        deliver(
            service,
            json!({"job_id": job.id, "status": "succeeded", "data": data}),
        )
        .await
        .expect("success delivery")
    }

    #[tokio::test]
    async fn upload_queues_and_dispatches_run_and_job() {
        let (service, dir) = test_service();
        let run = upload(&service, "P1").await;

        assert_eq!(run.status, IntakeStatus::Processing);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_none());
        assert!(dir.path().join(&run.upload_storage_path).exists());

        let job = service
            .store()
            .job_for_run(run.id)
            .await
            .unwrap()
            .expect("job created");
        assert_eq!(job.status, IntakeStatus::Processing);
        assert!(job.webhook_target.ends_with("/webhooks/parser"));
    }

    #[tokio::test]
    async fn upload_rejects_missing_identifiers() {
        let (service, _dir) = test_service();
        let err = service
            .create_run("", "a.pdf", b"x", None, None)
            .await
            .expect_err("missing object id");
        assert!(matches!(err, IntakeError::Validation(_)));

        let err = service
            .create_run("P1", "a.pdf", b"", None, None)
            .await
            .expect_err("missing file");
        assert!(matches!(err, IntakeError::Validation(_)));
    }

    #[tokio::test]
    async fn success_webhook_completes_run_and_filters_extraction() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        deliver_success(
            &service,
            run.id,
            json!({"address": "Main St 1", "area": "50", "bogusField": true}),
        )
        .await;

        let run = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, IntakeStatus::Succeeded);
        assert!(run.finished_at.is_some());

        let job = service
            .store()
            .job_for_run(run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, IntakeStatus::Succeeded);

        let extraction = service.store().extraction(run.id).await.unwrap().unwrap();
        assert_eq!(extraction.data.get("address"), Some(&json!("Main St 1")));
        assert_eq!(extraction.data.get("area"), Some(&json!(50)));
        assert!(!extraction.data.contains_key("bogusField"));
    }

    #[tokio::test]
    async fn failure_webhook_records_error_without_extraction() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();
        deliver(
            &service,
            json!({"job_id": job.id, "status": "failed", "error": "unreadable scan"}),
        )
        .await
        .expect("failure delivery");

        let run = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, IntakeStatus::Failed);
        assert_eq!(run.error_text.as_deref(), Some("unreadable scan"));
        assert!(service.store().extraction(run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_success_delivery_is_idempotent() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();
        let payload = json!({"job_id": job.id, "status": "succeeded", "data": {"area": 50}});

        let first = deliver(&service, payload.clone()).await.expect("first");
        assert!(!first.idempotent);
        let finished_at = service
            .store()
            .run(run.id)
            .await
            .unwrap()
            .unwrap()
            .finished_at;
        let created_at = service
            .store()
            .extraction(run.id)
            .await
            .unwrap()
            .unwrap()
            .created_at;

        let second = deliver(&service, payload).await.expect("second");
        assert!(second.idempotent);
        assert_eq!(second.applied_status, IntakeStatus::Succeeded);

        let run_after = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run_after.finished_at, finished_at);
        let extraction_after = service.store().extraction(run.id).await.unwrap().unwrap();
        assert_eq!(extraction_after.created_at, created_at);
    }

    #[tokio::test]
    async fn unknown_job_is_rejected_but_audited() {
        let (service, _dir) = test_service();
        let stray = Uuid::new_v4();
        let err = deliver(&service, json!({"job_id": stray, "status": "succeeded"}))
            .await
            .expect_err("unknown job");
        assert!(matches!(err, IntakeError::NotFound(_)));

        let events = service
            .store()
            .webhook_events_for_job(&stray.to_string())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].signature_valid);
    }

    #[tokio::test]
    async fn missing_job_id_is_a_validation_error() {
        let (service, _dir) = test_service();
        let err = deliver(&service, json!({"status": "succeeded"}))
            .await
            .expect_err("missing job_id");
        assert!(matches!(err, IntakeError::Validation(_)));

        let events = service.store().webhook_events_for_job("").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_passes_through_as_non_terminal() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();

        deliver(&service, json!({"job_id": job.id, "status": "ocr-started"}))
            .await
            .expect("intermediate update");
        let run_mid = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run_mid.status, IntakeStatus::Other("ocr-started".to_string()));
        assert!(run_mid.finished_at.is_none());

        deliver(
            &service,
            json!({"job_id": job.id, "status": "succeeded", "data": {"area": 42}}),
        )
        .await
        .expect("terminal update still applies");
        let run_after = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run_after.status, IntakeStatus::Succeeded);
    }

    #[tokio::test]
    async fn invalid_signature_is_logged_unless_enforced() {
        let config = IntakeConfig {
            webhook_secret: Some("s3cret".to_string()),
            ..IntakeConfig::default()
        };
        let (service, _dir) = test_service_with(config);
        let run = upload(&service, "P1").await;
        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();
        let body = serde_json::to_vec(
            &json!({"job_id": job.id, "status": "succeeded", "data": {"area": 50}}),
        )
        .unwrap();

        // Not enforced: transition applies, invalidity is only recorded.
        service
            .ingest_webhook(&body, Some("sha256=deadbeef"))
            .await
            .expect("unenforced ingest");
        let events = service
            .store()
            .webhook_events_for_job(&job.id.to_string())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].signature_valid);
        let run_after = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run_after.status, IntakeStatus::Succeeded);
    }

    #[tokio::test]
    async fn enforced_signature_rejects_before_any_transition() {
        let config = IntakeConfig {
            webhook_secret: Some("s3cret".to_string()),
            enforce_signatures: true,
            ..IntakeConfig::default()
        };
        let (service, _dir) = test_service_with(config);
        let run = upload(&service, "P1").await;
        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();
        let body = serde_json::to_vec(
            &json!({"job_id": job.id, "status": "succeeded", "data": {"area": 50}}),
        )
        .unwrap();

        let err = service
            .ingest_webhook(&body, Some("sha256=deadbeef"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, IntakeError::SignatureRejected));

        // Audit row exists, state untouched.
        let events = service
            .store()
            .webhook_events_for_job(&job.id.to_string())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let run_after = service.store().run(run.id).await.unwrap().unwrap();
        assert_eq!(run_after.status, IntakeStatus::Processing);
    }

    #[tokio::test]
    async fn simulate_funnels_through_the_webhook_contract() {
        let (service, _dir) = test_service();
        let run = service
            .create_run("P1", "expose.pdf", b"%PDF-1.4", None, Some(SimulateOutcome::Ok))
            .await
            .expect("simulated upload");
        assert_eq!(run.status, IntakeStatus::Succeeded);

        let job = service.store().job_for_run(run.id).await.unwrap().unwrap();
        let events = service
            .store()
            .webhook_events_for_job(&job.id.to_string())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let extraction = service.store().extraction(run.id).await.unwrap().unwrap();
        assert_eq!(extraction.data.get("address"), Some(&json!("Main St 1")));
        assert_eq!(extraction.data.get("area"), Some(&json!(50)));
    }

    #[tokio::test]
    async fn state_falls_back_when_object_has_no_runs() {
        let (service, _dir) = test_service();
        let state = service.intake_state("P9").await.expect("state");
        assert_eq!(state.used_source, UsedSource::Fallback);
        assert!(state.active_intake_run_id.is_none());
        assert!(state.overrides.is_empty());
        assert!(!state.raw.is_empty());
        assert!(state.runs.is_empty());
    }

    #[tokio::test]
    async fn override_patch_accumulates_and_resets() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        deliver_success(&service, run.id, json!({"address": "Main St 1", "area": 50})).await;

        let view = service
            .apply_override_patch("P1", &json!({"area": 55}))
            .await
            .expect("patch");
        assert_eq!(view.overrides.get("area"), Some(&json!(55)));
        assert_eq!(view.merged.get("area"), Some(&json!(55)));
        assert_eq!(view.merged.get("address"), Some(&json!("Main St 1")));

        let state = service.intake_state("P1").await.unwrap();
        assert_eq!(state.active_intake_run_id, Some(run.id));
        assert_eq!(state.used_source, UsedSource::Run);
        assert_eq!(state.raw.get("area"), Some(&json!(50)));
        assert_eq!(state.provenance.get("area"), Some(&FieldSource::Override));
        assert_eq!(
            state.provenance.get("address"),
            Some(&FieldSource::Raw)
        );

        // Second session accumulates instead of replacing.
        let view = service
            .apply_override_patch("P1", &json!({"rooms": 4}))
            .await
            .unwrap();
        assert_eq!(view.overrides.get("area"), Some(&json!(55)));
        assert_eq!(view.overrides.get("rooms"), Some(&json!(4)));

        let view = service
            .reset_override_fields("P1", &["area".to_string()])
            .await
            .unwrap();
        assert!(!view.overrides.contains_key("area"));
        assert_eq!(view.merged.get("area"), Some(&json!(50)));
        assert_eq!(view.overrides.get("rooms"), Some(&json!(4)));

        let view = service.reset_override_fields("P1", &[]).await.unwrap();
        assert!(view.overrides.is_empty());
    }

    #[tokio::test]
    async fn override_write_defaults_base_to_latest_succeeded_run() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        deliver_success(&service, run.id, json!({"area": 50})).await;

        service
            .apply_override_patch("P1", &json!({"area": 60}))
            .await
            .unwrap();
        let row = service
            .store()
            .override_row("P1")
            .await
            .unwrap()
            .expect("row persisted");
        assert_eq!(row.base_intake_run_id, Some(run.id));
    }

    #[tokio::test]
    async fn rebase_prunes_overrides_that_match_the_new_source() {
        let (service, _dir) = test_service();
        let run_a = upload(&service, "P1").await;
        deliver_success(&service, run_a.id, json!({"area": 80})).await;

        service
            .apply_override_patch("P1", &json!({"area": 100}))
            .await
            .unwrap();

        let run_b = upload(&service, "P1").await;
        deliver_success(&service, run_b.id, json!({"area": 100})).await;

        // Base was pinned to run A when the override was written.
        let state = service.intake_state("P1").await.unwrap();
        assert_eq!(state.active_intake_run_id, Some(run_a.id));
        assert_eq!(state.merged.get("area"), Some(&json!(100)));

        let view = service.select_source("P1", run_b.id).await.expect("switch");
        assert_eq!(view.active_intake_id, run_b.id);
        assert!(!view.overrides.contains_key("area"));
        assert_eq!(view.merged.get("area"), Some(&json!(100)));

        let state = service.intake_state("P1").await.unwrap();
        assert_eq!(state.active_intake_run_id, Some(run_b.id));
        assert!(state.overrides.is_empty());
    }

    #[tokio::test]
    async fn select_source_requires_a_stored_extraction() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        let err = service
            .select_source("P1", run.id)
            .await
            .expect_err("no extraction yet");
        assert!(matches!(err, IntakeError::NotFound(_)));

        let err = service
            .select_source("P2", run.id)
            .await
            .expect_err("wrong object");
        assert!(matches!(err, IntakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn editor_draft_is_independent_of_object_override() {
        let (service, _dir) = test_service();
        let run = upload(&service, "P1").await;
        deliver_success(&service, run.id, json!({"address": "Main St 1", "area": 50})).await;

        let view = service
            .save_editor_patch(run.id, &json!({"area": 77}))
            .await
            .expect("draft save");
        assert_eq!(view.draft.get("area"), Some(&json!(77)));
        assert_eq!(view.merged.get("area"), Some(&json!(77)));
        assert_eq!(view.raw.get("area"), Some(&json!(50)));

        // Object-level state untouched by the draft layer.
        let state = service.intake_state("P1").await.unwrap();
        assert!(state.overrides.is_empty());
        assert_eq!(state.merged.get("area"), Some(&json!(50)));

        let view = service.editor_view(run.id).await.unwrap();
        assert_eq!(view.draft.get("area"), Some(&json!(77)));
    }

    #[tokio::test]
    async fn runs_listing_is_newest_first() {
        let (service, _dir) = test_service();
        let first = upload(&service, "P1").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = upload(&service, "P1").await;

        let runs = service.runs_for_object("P1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
    }
}
