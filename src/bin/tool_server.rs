// HTTP tool surface for `ToolRegistry`, gated behind the `tool-server`
// feature. Routing shape is grounded on the Axum `Router`/`with_state`
// pattern of the Streamable HTTP transport, collapsed to the plain
// JSON-over-HTTP contract this crate needs instead of the full MCP
// session/SSE protocol (`spec.md` leaves the transport's wire format
// unspecified).

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use hybridrag::registry::{Registry, SharedRegistry};
use hybridrag::types::DatabaseName;
use hybridrag::{BackendFactory, HybridRagConfig, HybridRagError, ToolRegistry};

#[derive(Clone)]
struct ServerState {
    tools: Arc<ToolRegistry>,
}

struct ApiError(HybridRagError);

impl From<HybridRagError> for ApiError {
    fn from(e: HybridRagError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            hybridrag::ErrorKind::InputInvalid => StatusCode::BAD_REQUEST,
            hybridrag::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            hybridrag::ErrorKind::Conflict => StatusCode::CONFLICT,
            hybridrag::ErrorKind::Busy | hybridrag::ErrorKind::DeadlineExceeded => StatusCode::TOO_MANY_REQUESTS,
            hybridrag::ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            hybridrag::ErrorKind::VerificationFailed
            | hybridrag::ErrorKind::EngineTransient
            | hybridrag::ErrorKind::EnginePermanent
            | hybridrag::ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
struct DispatchRequest {
    database: String,
    text: String,
    top_k: Option<usize>,
    context_seeds: Option<Vec<String>>,
}

async fn list_tools() -> Json<serde_json::Value> {
    let tools: Vec<_> = hybridrag::dispatcher::known_tools()
        .iter()
        .map(|t| serde_json::json!({ "name": t.name, "tier": t.tier, "kind": format!("{:?}", t.kind) }))
        .collect();
    Json(serde_json::json!({ "tools": tools }))
}

async fn call_tool(
    State(state): State<ServerState>,
    AxumPath(tool_name): AxumPath<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<hybridrag::DispatchResponse>, ApiError> {
    let database = DatabaseName::new(req.database)?;
    let response = state
        .tools
        .dispatch(&tool_name, &database, &req.text, req.top_k, req.context_seeds)
        .await?;
    Ok(Json(response))
}

async fn poll_task(
    State(state): State<ServerState>,
    AxumPath(task_id): AxumPath<Uuid>,
) -> Result<Json<hybridrag::TaskProgress>, ApiError> {
    Ok(Json(state.tools.poll_task(task_id)?))
}

async fn cancel_task(
    State(state): State<ServerState>,
    AxumPath(task_id): AxumPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.tools.cancel_task(task_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/:tool_name", post(call_tool))
        .route("/tasks/:task_id", get(poll_task).delete(cancel_task))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hybridrag::init_logging()?;

    let config = HybridRagConfig::resolve(None);
    let registry: SharedRegistry = Arc::new(Registry::open(config.registry_path())?);
    let backend_factory = Arc::new(BackendFactory::new());
    let tools = Arc::new(ToolRegistry::new(registry, backend_factory));

    let addr = std::env::var("HYBRIDRAG_TOOL_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "tool server listening");
    axum::serve(listener, router(ServerState { tools })).await?;
    Ok(())
}
