//! Machine Spec Extractor - scenario-driven filling of machine-tool
//! specification templates from uploaded technical documents.

mod config;
mod convert;
mod error;
mod llm;
mod openai;
mod pipeline;
mod prompt;
mod render;
mod scenario;
mod sheet_import;
mod status;
mod tabular;
mod tree;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::{AppConfig, ALLOWED_EXTENSIONS};
use convert::{DefaultConverter, DocumentConverter};
use error::Error;
use llm::LlmClient;
use openai::OpenAiClient;
use pipeline::{PipelineResult, ScenarioPipeline};
use scenario::{Scenario, ScenarioStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sheet_import::{import_to_files, import_workbook, ImportOptions};
use status::{StatusStore, TaskStatus, TaskTracker};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Finished tasks are forgotten after this long.
const TASK_RETENTION: Duration = Duration::from_secs(10 * 60);

const SHEET_EXTENSIONS: [&str; 2] = ["xls", "xlsx"];

type ApiError = (StatusCode, String);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    scenarios: Arc<ScenarioStore>,
    tasks: StatusStore,
    results: Arc<RwLock<HashMap<String, PipelineResult>>>,
    llm: Arc<dyn LlmClient>,
    converter: Arc<dyn DocumentConverter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "machine_spec_extractor=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    std::fs::create_dir_all(&config.results_dir)?;
    std::fs::create_dir_all(&config.upload_dir)?;

    let scenarios = ScenarioStore::open(&config.scenarios_dir, &config.base_dir, &config.data_dir)?;
    info!(
        "Loaded {} scenarios from {}",
        scenarios.list().len(),
        config.scenarios_dir.display()
    );

    let llm = OpenAiClient::from_config(&config.llm)?;
    info!("LLM client initialized: {} at {}", llm.model_name(), config.llm.base_url);

    let bind_addr = config.bind_addr;
    let max_upload_bytes = config.max_upload_bytes;

    let state = AppState {
        config: Arc::new(config),
        scenarios: Arc::new(scenarios),
        tasks: StatusStore::new(),
        results: Arc::new(RwLock::new(HashMap::new())),
        llm: Arc::new(llm),
        converter: Arc::new(DefaultConverter),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/scenarios", get(list_scenarios).post(create_scenario))
        .route(
            "/scenarios/:id",
            get(get_scenario).put(update_scenario).delete(delete_scenario),
        )
        .route("/resources", get(list_resources))
        .route("/process", post(process_document))
        .route("/status/:task_id", get(get_status))
        .route("/status/:task_id/cancel", post(cancel_task))
        .route("/templates/import", post(import_template))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

async fn list_scenarios(State(state): State<AppState>) -> Json<Vec<Scenario>> {
    Json(state.scenarios.list())
}

async fn get_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scenario>, StatusCode> {
    state.scenarios.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn create_scenario(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Scenario>), ApiError> {
    let scenario = Scenario::from_value(body).map_err(error_response)?;
    let created = state.scenarios.create(scenario).map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<Scenario>, ApiError> {
    state
        .scenarios
        .update(&id, patch)
        .map_err(error_response)?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown scenario: {}", id)))
}

async fn delete_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.scenarios.delete(&id).map_err(error_response)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err((StatusCode::NOT_FOUND, format!("Unknown scenario: {}", id))),
    }
}

#[derive(Deserialize)]
struct ResourcesQuery {
    machine_type: Option<String>,
}

/// Prompt files, templates and glossaries a scenario can reference.
async fn list_resources(
    State(state): State<AppState>,
    Query(query): Query<ResourcesQuery>,
) -> Json<Value> {
    let scenarios = &state.scenarios;
    Json(json!({
        "prompts": scenarios.available_prompts(query.machine_type.as_deref()),
        "templates": scenarios.available_templates(),
        "glossaries": scenarios.available_glossaries(),
    }))
}

#[derive(Deserialize)]
struct ProcessQuery {
    scenario: String,
    prefix: Option<String>,
}

/// Upload a document and start the scenario pipeline in the background.
async fn process_document(
    State(state): State<AppState>,
    Query(query): Query<ProcessQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let scenario = state.scenarios.get(&query.scenario).ok_or_else(|| {
        (StatusCode::NOT_FOUND, format!("Unknown scenario: {}", query.scenario))
    })?;

    let upload = read_upload(multipart).await?;
    let extension = allowed_extension(&upload.filename, &ALLOWED_EXTENSIONS)?;

    let task_id = Uuid::new_v4().to_string();
    let upload_path = state.config.upload_dir.join(format!("{}.{}", task_id, extension));
    tokio::fs::write(&upload_path, &upload.data).await.map_err(|e| {
        error!("Failed to store upload: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to store upload: {}", e))
    })?;
    info!(
        "Received file: {} ({} bytes) for scenario: {}",
        upload.filename,
        upload.data.len(),
        scenario.id
    );

    let converter = state.converter.clone();
    let text = tokio::task::spawn_blocking(move || converter.convert(&upload_path))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Conversion task failed: {}", e)))?
        .map_err(error_response)?;

    if text.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Could not extract text from document".to_string(),
        ));
    }

    let prefix = match query.prefix.as_deref().and_then(sanitize_name) {
        Some(prefix) => format!("{}_{}", prefix, &task_id[..8]),
        None => task_id.clone(),
    };

    let removed = state.tasks.cleanup_older_than(TASK_RETENTION);
    if removed > 0 {
        info!("Dropped {} finished tasks", removed);
        let tasks = state.tasks.clone();
        state.results.write().unwrap().retain(|id, _| tasks.get(id).is_some());
    }

    state.tasks.create(&task_id);
    tokio::spawn(run_task(state.clone(), scenario, text, prefix, task_id.clone()));

    Ok(Json(json!({ "task_id": task_id, "status": "pending" })))
}

async fn run_task(state: AppState, scenario: Scenario, text: String, prefix: String, task_id: String) {
    let tracker = TaskTracker::new(state.tasks.clone(), task_id.clone());

    let result = ScenarioPipeline::new(
        &scenario,
        state.llm.as_ref(),
        &state.config.base_dir,
        &state.config.results_dir,
    )
    .with_progress(&tracker)
    .with_cancellation(&tracker)
    .execute(&text, &prefix)
    .await;

    for failure in &result.errors {
        tracker.add_error(failure.to_string());
    }
    if let Some(main) = result.main_output() {
        info!(
            "Task {} filled template: {} ({} bytes)",
            tracker.task_id(),
            main.json_file,
            main.json_size
        );
    }
    info!(
        "Task {} finished as {:?} ({} steps, {} errors)",
        tracker.task_id(),
        result.state,
        result.results.len(),
        result.errors.len()
    );

    state.results.write().unwrap().insert(task_id, result);
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<PipelineResult>,
}

async fn get_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let status = state.tasks.get(&task_id).ok_or(StatusCode::NOT_FOUND)?;
    let result = state.results.read().unwrap().get(&task_id).cloned();
    Ok(Json(StatusResponse { status, result }))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.tasks.get(&task_id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Unknown task: {}", task_id)));
    }
    if !state.tasks.cancel(&task_id) {
        return Err((StatusCode::CONFLICT, "Task has already finished".to_string()));
    }
    info!("Task {} cancelled", task_id);
    Ok(Json(json!({ "task_id": task_id, "status": "cancelled" })))
}

#[derive(Deserialize)]
struct ImportQuery {
    /// When set, write `TZ_<save>.json` and `glossary_<save>.json` to the data
    /// directory instead of returning the trees.
    save: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

/// Build a JSON template and glossary from an uploaded worksheet.
async fn import_template(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload = read_upload(multipart).await?;
    let extension = allowed_extension(&upload.filename, &SHEET_EXTENSIONS)?;

    let existing = match upload.fields.get("existing") {
        Some(text) if !text.trim().is_empty() => Some(serde_json::from_str::<Value>(text).map_err(|e| {
            (StatusCode::BAD_REQUEST, format!("Field 'existing' is not valid JSON: {}", e))
        })?),
        _ => None,
    };

    let sheet_path = state
        .config
        .upload_dir
        .join(format!("{}.{}", Uuid::new_v4(), extension));
    tokio::fs::write(&sheet_path, &upload.data)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to store upload: {}", e)))?;
    info!("Importing template from {}", upload.filename);

    let config = state.config.clone();
    let save = query.save.as_deref().and_then(sanitize_name);
    let dry_run = query.dry_run;
    let path = sheet_path.clone();

    let outcome = tokio::task::spawn_blocking(move || -> error::Result<Value> {
        match save {
            Some(name) => {
                let template_path = config.data_dir.join(format!("TZ_{}.json", name));
                let glossary_path = config.data_dir.join(format!("glossary_{}.json", name));
                let stats = import_to_files(
                    &path,
                    &template_path,
                    &glossary_path,
                    ImportOptions {
                        dry_run,
                        ..ImportOptions::default()
                    },
                )?;
                Ok(json!({
                    "stats": stats,
                    "template_file": template_path,
                    "glossary_file": glossary_path,
                    "dry_run": dry_run,
                }))
            }
            None => Ok(serde_json::to_value(import_workbook(&path, existing.as_ref())?)?),
        }
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Import task failed: {}", e)))?;

    if let Err(e) = tokio::fs::remove_file(&sheet_path).await {
        warn!("Could not remove {}: {}", sheet_path.display(), e);
    }

    outcome.map(Json).map_err(error_response)
}

// ============================================================================
// Helper functions
// ============================================================================

struct Upload {
    filename: String,
    data: Vec<u8>,
    /// Non-file text fields.
    fields: HashMap<String, String>,
}

/// Read the `file` part and any text fields of a multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut upload = Upload {
        filename: String::new(),
        data: Vec::new(),
        fields: HashMap::new(),
    };

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            upload.filename = field.file_name().unwrap_or("document").to_string();
            upload.data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?.to_vec();
        } else {
            let text = field.text().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read field {}: {}", name, e))
            })?;
            upload.fields.insert(name, text);
        }
    }

    if upload.data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }
    Ok(upload)
}

fn allowed_extension(filename: &str, allowed: &[&str]) -> Result<String, ApiError> {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if allowed.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            format!("Unsupported file type '{}'. Allowed: {}", filename, allowed.join(", ")),
        ))
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize_name(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        Error::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Provider(_) => StatusCode::BAD_GATEWAY,
        Error::Conversion { .. } | Error::Serialization(_) | Error::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("{}", e);
    }
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" станок 16К20/../x "), Some("станок16К20x".to_string()));
        assert_eq!(sanitize_name("../"), None);
    }

    #[test]
    fn test_allowed_extension() {
        assert_eq!(allowed_extension("ТЗ.PDF", &ALLOWED_EXTENSIONS).unwrap(), "pdf");
        assert_eq!(
            allowed_extension("table.csv", &SHEET_EXTENSIONS).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
        assert!(allowed_extension("noext", &ALLOWED_EXTENSIONS).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(Error::Validation("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(Error::UnsupportedFormat("doc".into())).0,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            error_response(Error::Provider("down".into())).0,
            StatusCode::BAD_GATEWAY
        );
    }
}
