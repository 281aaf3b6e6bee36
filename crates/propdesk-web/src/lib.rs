//! JSON HTTP surface for the PropDesk intake engine.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Multipart, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use propdesk_intake::{IntakeError, IntakeService, SimulateOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "propdesk-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IntakeService>,
}

impl AppState {
    pub fn new(service: Arc<IntakeService>) -> Self {
        Self { service }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/intake/upload", post(upload_handler))
        .route("/intake/runs", get(runs_handler))
        .route("/intake/simulate", post(simulate_handler))
        .route("/intake/editor", get(editor_view_handler))
        .route("/intake/editor/save", post(editor_save_handler))
        .route("/webhooks/parser", post(webhook_handler))
        .route("/objects/{id}/intake-state", get(intake_state_handler))
        .route(
            "/objects/{id}/overrides",
            post(override_patch_handler).delete(override_reset_handler),
        )
        .route("/objects/{id}/intake-source", post(select_source_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let service = propdesk_intake::service_from_env().await?;
    let port = service.config().web_port;
    let state = AppState::new(Arc::new(service));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "propdesk web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct UploadQuery {
    #[serde(rename = "objectId")]
    object_id: Option<String>,
    simulate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ObjectQuery {
    #[serde(rename = "objectId")]
    object_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeysQuery {
    keys: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    #[serde(rename = "runId")]
    run_id: Uuid,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    #[serde(default)]
    patch: Value,
}

#[derive(Debug, Deserialize)]
struct SelectSourceRequest {
    #[serde(rename = "intakeId")]
    intake_id: Uuid,
}

#[derive(Debug, Deserialize, Default)]
struct EditorQuery {
    #[serde(rename = "intakeId")]
    intake_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct EditorSaveRequest {
    #[serde(rename = "intakeId")]
    intake_id: Uuid,
    #[serde(default)]
    patch: Value,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut object_id = query.object_id.clone();
    let mut file: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(_) => {
                return error_response(IntakeError::Validation(
                    "malformed multipart body".to_string(),
                ))
            }
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, bytes.to_vec())),
                    Err(_) => {
                        return error_response(IntakeError::Validation(
                            "unreadable file field".to_string(),
                        ))
                    }
                }
            }
            Some("objectId") => {
                if object_id.is_none() {
                    object_id = field.text().await.ok();
                }
            }
            _ => {}
        }
    }

    let Some(object_id) = object_id.filter(|s| !s.trim().is_empty()) else {
        return error_response(IntakeError::Validation("missing objectId".to_string()));
    };
    let Some((filename, bytes)) = file else {
        return error_response(IntakeError::Validation("missing file".to_string()));
    };

    let simulate = query.simulate.as_deref().and_then(SimulateOutcome::parse);
    let origin = headers.get(header::HOST).and_then(|v| v.to_str().ok());

    match state
        .service
        .create_run(&object_id, &filename, &bytes, origin, simulate)
        .await
    {
        Ok(run) => ok_body(&serde_json::json!({ "run": run })),
        Err(err) => error_response(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    let Some(object_id) = query.object_id.filter(|s| !s.trim().is_empty()) else {
        return error_response(IntakeError::Validation("missing objectId".to_string()));
    };
    match state.service.runs_for_object(&object_id).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get("x-signature").and_then(|v| v.to_str().ok());
    match state.service.ingest_webhook(&body, signature).await {
        Ok(outcome) => Json(serde_json::json!({
            "ok": true,
            "status": outcome.applied_status,
            "idempotent": outcome.idempotent,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn simulate_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SimulateRequest>,
) -> Response {
    let Some(outcome) = SimulateOutcome::parse(&req.outcome) else {
        return error_response(IntakeError::Validation(format!(
            "unknown outcome {}",
            req.outcome
        )));
    };
    match state.service.simulate(req.run_id, outcome).await {
        Ok(result) => Json(serde_json::json!({
            "ok": true,
            "status": result.applied_status,
            "idempotent": result.idempotent,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn intake_state_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(object_id): AxumPath<String>,
) -> Response {
    match state.service.intake_state(&object_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

async fn override_patch_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(object_id): AxumPath<String>,
    Json(req): Json<OverrideRequest>,
) -> Response {
    match state
        .service
        .apply_override_patch(&object_id, &req.patch)
        .await
    {
        Ok(view) => ok_body(&view),
        Err(err) => error_response(err),
    }
}

async fn override_reset_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(object_id): AxumPath<String>,
    Query(query): Query<KeysQuery>,
) -> Response {
    let keys: Vec<String> = query
        .keys
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    match state.service.reset_override_fields(&object_id, &keys).await {
        Ok(view) => ok_body(&view),
        Err(err) => error_response(err),
    }
}

async fn select_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(object_id): AxumPath<String>,
    Json(req): Json<SelectSourceRequest>,
) -> Response {
    match state.service.select_source(&object_id, req.intake_id).await {
        Ok(view) => ok_body(&view),
        Err(err) => error_response(err),
    }
}

async fn editor_view_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EditorQuery>,
) -> Response {
    let Some(intake_id) = query.intake_id else {
        return error_response(IntakeError::Validation("missing intakeId".to_string()));
    };
    match state.service.editor_view(intake_id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

async fn editor_save_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditorSaveRequest>,
) -> Response {
    match state
        .service
        .save_editor_patch(req.intake_id, &req.patch)
        .await
    {
        Ok(view) => Json(serde_json::json!({
            "ok": true,
            "draft": view.draft,
            "merged": view.merged,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

fn ok_body<T: Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Json(Value::Object(map)).into_response()
        }
        Ok(other) => Json(other).into_response(),
        Err(err) => error_response(IntakeError::Persistence(err.to_string())),
    }
}

fn error_response(err: IntakeError) -> Response {
    let status = match &err {
        IntakeError::Validation(_) => StatusCode::BAD_REQUEST,
        IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
        IntakeError::SignatureRejected => StatusCode::UNAUTHORIZED,
        IntakeError::Storage(_) | IntakeError::Persistence(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
