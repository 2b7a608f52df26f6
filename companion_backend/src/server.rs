use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::agent::{Agent, TurnError, TurnRequest, TurnResponse};
use crate::database::{ChatDatabase, ChatSummary, ChatTranscript};
use crate::embedding::Embedder;
use crate::llm_client::ChatMessage;
use crate::memory::{remember, revise, MemoryRecord, MemoryStore};
use crate::personas::{Persona, PersonaStore};
use crate::profile::{Profile, ProfileStore};
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<Agent>,
    pub chats: Arc<ChatDatabase>,
    pub personas: Arc<PersonaStore>,
    pub profile: Arc<ProfileStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
}

impl ServerState {
    pub fn from_runtime(runtime: &BackendRuntime) -> Self {
        Self {
            agent: runtime.agent.clone(),
            chats: runtime.chats.clone(),
            personas: runtime.services.personas.clone(),
            profile: runtime.services.profile.clone(),
            memory: runtime.services.memory.clone(),
            embedder: runtime.services.embedder.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct SaveChatRequest {
    title: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    persona_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    persona_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemoryTextRequest {
    text: String,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_address
        .parse::<SocketAddr>()
        .context("Invalid bind_address (expected host:port)")?;

    let state = Arc::new(ServerState::from_runtime(&runtime));
    let app = build_router(state, &runtime.config.cors_origins);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Companion backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/personas", get(get_personas).put(update_personas))
        .route("/api/profile", get(get_profile).put(update_profile))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/:id",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/api/memories", get(list_memories).post(add_memory))
        .route("/api/memories/:id", put(update_memory).delete(delete_memory))
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    match state.agent.process_turn(request).await {
        Ok(response) => Ok(Json(response)),
        Err(error) => {
            if let Some(turn_error) = error.downcast_ref::<TurnError>() {
                return Err(bad_request(turn_error.to_string()));
            }
            Err(internal_error(error))
        }
    }
}

async fn get_personas(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Persona>>, (StatusCode, String)> {
    state.personas.list().map(Json).map_err(internal_error)
}

async fn update_personas(
    State(state): State<Arc<ServerState>>,
    Json(personas): Json<Vec<Persona>>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    state.personas.replace(&personas).map_err(internal_error)?;
    Ok(Json(MessageResponse {
        message: "Personas updated",
    }))
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Profile>, (StatusCode, String)> {
    state.profile.load().map(Json).map_err(internal_error)
}

async fn update_profile(
    State(state): State<Arc<ServerState>>,
    Json(profile): Json<Profile>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    state.profile.replace(&profile).map_err(internal_error)?;
    Ok(Json(MessageResponse {
        message: "Profile updated",
    }))
}

async fn list_chats(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<ChatSummary>>, (StatusCode, String)> {
    state.chats.list_chats().map(Json).map_err(internal_error)
}

async fn create_chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SaveChatRequest>,
) -> Result<Json<ChatSummary>, (StatusCode, String)> {
    let id = state
        .chats
        .create_chat(&request.title, &request.messages, request.persona_id.as_deref())
        .map_err(internal_error)?;
    Ok(Json(ChatSummary {
        id,
        title: request.title,
    }))
}

async fn get_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<i64>,
) -> Result<Json<ChatTranscript>, (StatusCode, String)> {
    match state.chats.get_chat(chat_id).map_err(internal_error)? {
        Some(chat) => Ok(Json(chat)),
        None => Err(not_found("Chat not found".to_string())),
    }
}

async fn update_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<i64>,
    Json(request): Json<UpdateChatRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let updated = state
        .chats
        .update_chat(chat_id, &request.messages, request.persona_id.as_deref())
        .map_err(internal_error)?;
    if !updated {
        return Err(not_found("Chat not found".to_string()));
    }
    Ok(Json(MessageResponse {
        message: "Chat updated successfully",
    }))
}

async fn delete_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<i64>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if !state.chats.delete_chat(chat_id).map_err(internal_error)? {
        return Err(not_found("Chat not found".to_string()));
    }
    Ok(Json(MessageResponse {
        message: "Chat deleted successfully",
    }))
}

async fn list_memories(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<MemoryRecord>>, (StatusCode, String)> {
    state.memory.list().await.map(Json).map_err(internal_error)
}

async fn add_memory(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<MemoryTextRequest>,
) -> Result<Json<MemoryRecord>, (StatusCode, String)> {
    let text = non_empty_text(&request.text)?;
    let id = remember(state.memory.as_ref(), state.embedder.as_ref(), text)
        .await
        .map_err(internal_error)?;
    tracing::info!("Memory added ({}) via admin API", id);
    match state.memory.get(&id).await.map_err(internal_error)? {
        Some(record) => Ok(Json(record)),
        None => Err(internal_error(anyhow::anyhow!(
            "memory '{}' vanished after insert",
            id
        ))),
    }
}

async fn update_memory(
    State(state): State<Arc<ServerState>>,
    Path(memory_id): Path<String>,
    Json(request): Json<MemoryTextRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let text = non_empty_text(&request.text)?;
    // Check first so an unknown id is a 404 without an embedding call
    if state
        .memory
        .get(&memory_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(format!("memory '{}' not found", memory_id)));
    }
    let updated = revise(
        state.memory.as_ref(),
        state.embedder.as_ref(),
        &memory_id,
        text,
    )
    .await
    .map_err(internal_error)?;
    if !updated {
        return Err(not_found(format!("memory '{}' not found", memory_id)));
    }
    Ok(Json(MessageResponse {
        message: "Memory updated",
    }))
}

async fn delete_memory(
    State(state): State<Arc<ServerState>>,
    Path(memory_id): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if !state
        .memory
        .delete(&memory_id)
        .await
        .map_err(internal_error)?
    {
        return Err(not_found(format!("memory '{}' not found", memory_id)));
    }
    Ok(Json(MessageResponse {
        message: "Memory deleted",
    }))
}

fn non_empty_text(text: &str) -> Result<&str, (StatusCode, String)> {
    let text = text.trim();
    if text.is_empty() {
        return Err(bad_request("memory text must not be empty".to_string()));
    }
    Ok(text)
}

fn bad_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Request failed: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::llm_client::ChatModel;
    use crate::runtime::BackendRuntimeBuilder;
    use crate::tools::web_search::{SearchProvider, WebSearch};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct QueueModel {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl ChatModel for QueueModel {
        async fn complete(&self, _messages: &[ChatMessage], _temperature: Option<f32>) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted reply"))
        }
    }

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct CannedSearch;

    #[async_trait]
    impl WebSearch for CannedSearch {
        async fn search(&self, _query: &str, _provider: SearchProvider) -> String {
            "canned result".to_string()
        }
    }

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    fn test_app(replies: &[&str]) -> TestApp {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BackendConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..BackendConfig::default()
        };
        let cors_origins = config.cors_origins.clone();
        let runtime = BackendRuntimeBuilder::new(config)
            .with_chat_model(Arc::new(QueueModel {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            }))
            .with_embedder(Arc::new(LengthEmbedder))
            .with_web_search(Arc::new(CannedSearch))
            .build()
            .expect("runtime");
        let state = Arc::new(ServerState::from_runtime(&runtime));
        TestApp {
            router: build_router(state, &cors_origins),
            _dir: dir,
        }
    }

    struct JsonResponse {
        status: StatusCode,
        body: Value,
        text: String,
    }

    async fn send(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> JsonResponse {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = app
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("request should succeed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should read");
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
        JsonResponse { status, body, text }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app(&[]);
        let response = send(&app, Method::GET, "/health", None).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn chat_returns_search_confirmation() {
        let app = test_app(&[r#"{"tool_name": "web_search", "query": "X"}"#]);
        let response = send(
            &app,
            Method::POST,
            "/api/chat",
            Some(json!({
                "history": [{"role": "system", "content": ""}, {"role": "user", "content": "Hi"}],
                "settings": {"provider": "brave", "webSearchEnabled": true},
                "persona_id": "assistant"
            })),
        )
        .await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["confirmation"], json!({"type": "search", "query": "X"}));
        assert_eq!(response.body["history"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn chat_resumes_approved_search() {
        let app = test_app(&["Here is what I found.", "No new key information"]);
        let response = send(
            &app,
            Method::POST,
            "/api/chat",
            Some(json!({
                "history": [{"role": "system", "content": "ctx"}, {"role": "user", "content": "Hi"}],
                "continuation": {"action": "approved_search", "query": "X"}
            })),
        )
        .await;

        assert_eq!(response.status, StatusCode::OK);
        let history = response.body["history"].as_array().unwrap();
        assert_eq!(history[2]["role"], "tool");
        assert!(history[2]["content"].as_str().unwrap().contains("canned result"));
        assert_eq!(history[3]["content"], "Here is what I found.");
        assert!(response.body.get("confirmation").is_none());
    }

    #[tokio::test]
    async fn chat_with_empty_history_is_bad_request() {
        let app = test_app(&[]);
        let response = send(&app, Method::POST, "/api/chat", Some(json!({"history": []}))).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn personas_round_trip() {
        let app = test_app(&[]);
        let listed = send(&app, Method::GET, "/api/personas", None).await;
        assert_eq!(listed.body.as_array().unwrap().len(), 3);
        assert_eq!(listed.body[0]["title"], "Assistant");

        let updated = send(
            &app,
            Method::PUT,
            "/api/personas",
            Some(json!([{
                "id": "coach", "name": "Coach", "avatar": "/c.png",
                "personality": "Be tough.", "greeting": "Go!"
            }])),
        )
        .await;
        assert_eq!(updated.body, json!({"message": "Personas updated"}));

        let listed = send(&app, Method::GET, "/api/personas", None).await;
        assert_eq!(listed.body[0]["id"], "coach");
        assert_eq!(listed.body[0]["title"], "Assistant");
    }

    #[tokio::test]
    async fn profile_get_after_put_returns_submitted_fields() {
        let app = test_app(&[]);
        let submitted = json!({
            "name": "Ada",
            "key_facts": ["Writes Rust"],
            "main_goals": ["Finish the book", "Run a marathon"]
        });
        let updated = send(&app, Method::PUT, "/api/profile", Some(submitted.clone())).await;
        assert_eq!(updated.body, json!({"message": "Profile updated"}));

        let fetched = send(&app, Method::GET, "/api/profile", None).await;
        assert_eq!(fetched.body, submitted);
    }

    #[tokio::test]
    async fn chat_transcript_crud() {
        let app = test_app(&[]);
        let created = send(
            &app,
            Method::POST,
            "/api/chats",
            Some(json!({
                "title": "Trip planning",
                "messages": [{"role": "user", "content": "Plan a trip"}],
                "persona_id": "friend"
            })),
        )
        .await;
        assert_eq!(created.status, StatusCode::OK);
        let id = created.body["id"].as_i64().unwrap();
        assert_eq!(created.body["title"], "Trip planning");

        let listed = send(&app, Method::GET, "/api/chats", None).await;
        assert_eq!(listed.body, json!([{"id": id, "title": "Trip planning"}]));

        let fetched = send(&app, Method::GET, &format!("/api/chats/{}", id), None).await;
        assert_eq!(fetched.body["persona_id"], "friend");
        assert_eq!(fetched.body["messages"][0]["content"], "Plan a trip");

        let updated = send(
            &app,
            Method::PUT,
            &format!("/api/chats/{}", id),
            Some(json!({"messages": [], "persona_id": "lover"})),
        )
        .await;
        assert_eq!(updated.body, json!({"message": "Chat updated successfully"}));

        let deleted = send(&app, Method::DELETE, &format!("/api/chats/{}", id), None).await;
        assert_eq!(deleted.body, json!({"message": "Chat deleted successfully"}));

        let missing = send(&app, Method::GET, &format!("/api/chats/{}", id), None).await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.text, "Chat not found");
    }

    #[tokio::test]
    async fn missing_chat_update_and_delete_are_not_found() {
        let app = test_app(&[]);
        let updated = send(
            &app,
            Method::PUT,
            "/api/chats/999",
            Some(json!({"messages": [], "persona_id": "assistant"})),
        )
        .await;
        assert_eq!(updated.status, StatusCode::NOT_FOUND);

        let deleted = send(&app, Method::DELETE, "/api/chats/999", None).await;
        assert_eq!(deleted.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn memory_admin_lifecycle() {
        let app = test_app(&[]);

        let rejected = send(&app, Method::POST, "/api/memories", Some(json!({"text": "  "}))).await;
        assert_eq!(rejected.status, StatusCode::BAD_REQUEST);

        let added = send(
            &app,
            Method::POST,
            "/api/memories",
            Some(json!({"text": "User's cat is named Miso."})),
        )
        .await;
        assert_eq!(added.status, StatusCode::OK);
        let id = added.body["id"].as_str().unwrap().to_string();

        let listed = send(&app, Method::GET, "/api/memories", None).await;
        assert_eq!(listed.body[0]["text"], "User's cat is named Miso.");

        let edited = send(
            &app,
            Method::PUT,
            &format!("/api/memories/{}", id),
            Some(json!({"text": "User's cat is named Mochi."})),
        )
        .await;
        assert_eq!(edited.status, StatusCode::OK);
        let listed = send(&app, Method::GET, "/api/memories", None).await;
        assert_eq!(listed.body[0]["text"], "User's cat is named Mochi.");

        let deleted = send(&app, Method::DELETE, &format!("/api/memories/{}", id), None).await;
        assert_eq!(deleted.status, StatusCode::OK);
        let again = send(&app, Method::DELETE, &format!("/api/memories/{}", id), None).await;
        assert_eq!(again.status, StatusCode::NOT_FOUND);

        let missing = send(
            &app,
            Method::PUT,
            "/api/memories/nope",
            Some(json!({"text": "x"})),
        )
        .await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let app = test_app(&[]);
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/profile")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
            .body(Body::empty())
            .unwrap();

        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://localhost:5173"
        );
    }
}
