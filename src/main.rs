//! Shared Text Sync node
//!
//! A peer of a shared-editing mesh:
//! - Owns documents it shares and orders every edit made to them
//! - Keeps replicas of documents owned elsewhere in step through patches
//! - Talks to other peers with binary frames over `POST /sync`
//! - Exposes a small local API standing in for an editor UI

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use shared_text_sync::{
    editor::{EditorCommand, EditorView, HeadlessEditor},
    sync::{
        controller::DocumentSnapshot,
        protocol::{SyncProtocol, MAX_MESSAGE_SIZE, PROTOCOL_VERSION},
        SyncNode,
    },
    transport::HttpCommunication,
    NodeConfig,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// The peer itself
    node: Arc<SyncNode>,
    /// Local view of open documents
    editor: Arc<HeadlessEditor>,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    member: String,
    host: String,
    uptime_seconds: u64,
    owned_documents: usize,
    replica_documents: usize,
    pending_requests: usize,
}

#[derive(Debug, Deserialize)]
struct CreateDocumentRequest {
    id: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EditDocumentRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSnapshot>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct DocumentResponse {
    id: String,
    /// What the local view shows
    text: Option<String>,
    editor_count: Option<usize>,
    owner_unreachable: bool,
    /// Synchronized state, absent while the document is being fetched
    document: Option<DocumentSnapshot>,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.node.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        member: stats.member,
        host: stats.host,
        uptime_seconds: stats.uptime_seconds,
        owned_documents: stats.owned_documents,
        replica_documents: stats.replica_documents,
        pending_requests: stats.pending_requests,
    })
}

/// Inbound frame from another peer
async fn receive_frame(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let message = SyncProtocol::decode(&body).map_err(|e| {
        warn!("Rejected frame: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    state.node.receive(message);
    Ok(StatusCode::ACCEPTED)
}

/// List all registered documents
async fn list_documents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let documents = state.node.controller().list();
    let total = documents.len();
    Json(DocumentListResponse { documents, total })
}

/// Share a new document
async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if payload.id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Document id is empty".to_string()));
    }
    if state.node.controller().snapshot(&payload.id).is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("Document {} already exists", payload.id),
        ));
    }

    info!("Sharing document {}", payload.id);
    state.editor.open(&payload.id, &payload.text);
    state
        .node
        .command(EditorCommand::CreateDocument { id: payload.id });
    Ok(StatusCode::ACCEPTED)
}

/// Get the local view and synchronized state of a document
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, StatusCode> {
    let text = state.editor.get_text(&id);
    let document = state.node.controller().snapshot(&id);
    if text.is_none() && document.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(DocumentResponse {
        editor_count: state.editor.editor_count(&id),
        owner_unreachable: state.editor.is_unreachable(&id),
        id,
        text,
        document,
    }))
}

/// Type into a document
async fn edit_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<EditDocumentRequest>,
) -> Result<StatusCode, StatusCode> {
    if state.node.controller().snapshot(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    state.editor.type_text(&id, &payload.text);
    state.node.command(EditorCommand::UpdateDocument {
        id,
        new_text: payload.text,
    });
    Ok(StatusCode::ACCEPTED)
}

/// Close a document
async fn remove_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.editor.close_document(&id);
    state.node.command(EditorCommand::RemoveDocument { id });
    StatusCode::ACCEPTED
}

/// Ask the mesh for a document
async fn find_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.node.command(EditorCommand::FindDocumentRequest { id });
    StatusCode::ACCEPTED
}

/// Become the owner of a document
async fn take_ownership(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    if state.node.controller().snapshot(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    state.node.command(EditorCommand::TakeOwnership { id });
    Ok(StatusCode::ACCEPTED)
}

/// Build the HTTP router
fn router(state: Arc<AppState>) -> Router {
    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Peer endpoint
        .route(
            "/sync",
            post(receive_frame).layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE)),
        )
        // Local editor API
        .route("/api/documents", get(list_documents).post(create_document))
        .route(
            "/api/documents/:id",
            get(get_document).put(edit_document).delete(remove_document),
        )
        .route("/api/documents/:id/find", post(find_document))
        .route("/api/documents/:id/takeover", post(take_ownership))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared_text_sync=info,tower_http=info".into()),
        )
        .init();

    let config = NodeConfig::from_env()?;
    let addr = config.socket_addr()?;

    let communication = Arc::new(HttpCommunication::new(config.request_timeout)?);
    let editor = Arc::new(HeadlessEditor::new());
    let node = SyncNode::new(
        config.member_name.clone(),
        config.public_host.clone(),
        config.peers.clone(),
        config.sync.clone(),
        editor.clone(),
        communication,
    );
    let handles = node.clone().start_background_tasks();

    let state = Arc::new(AppState {
        node: node.clone(),
        editor,
    });

    let app = router(state);

    info!("Shared text sync v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Member: {}", config.member_name);
    info!("   Public host: {}", config.public_host);
    info!("   Peers: {}", config.peers.join(", "));
    info!("   Listening on: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    node.shutdown();
    handles.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use shared_text_sync::sync::{protocol::PeerMessage, SyncConfig};
    use shared_text_sync::transport::MemoryNetwork;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let editor = Arc::new(HeadlessEditor::new());
        let node = SyncNode::new(
            "max",
            "http://max",
            Vec::new(),
            SyncConfig::default(),
            editor.clone(),
            MemoryNetwork::new(),
        );
        Arc::new(AppState { node, editor })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["member"], "max");
    }

    #[tokio::test]
    async fn test_sync_route_decodes_frames() {
        let app = router(test_state());

        let frame = SyncProtocol::encode(&PeerMessage::Reload {
            document_id: "notes".to_string(),
            host: "http://anna".to_string(),
        })
        .unwrap();
        let response = app
            .clone()
            .oneshot(Request::post("/sync").body(Body::from(frame)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(Request::post("/sync").body(Body::from("garbage")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_route_takes_frames_above_default_body_limit() {
        let frame = SyncProtocol::encode(&PeerMessage::Reload {
            document_id: "x".repeat(3 * 1024 * 1024),
            host: "http://anna".to_string(),
        })
        .unwrap();
        assert!(frame.len() > 2 * 1024 * 1024);

        let response = router(test_state())
            .oneshot(Request::post("/sync").body(Body::from(frame)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_create_then_read_document() {
        let state = test_state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/documents")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"notes","text":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .clone()
            .oneshot(Request::get("/api/documents/notes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["text"], "hello");

        let response = app
            .oneshot(
                Request::put("/api/documents/missing")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
