//! HTTP gateway: OpenAI-compatible surface over the model router.
//!
//! Translates `/v1/responses` and `/v1/chat/completions` into router calls,
//! persists results and usage, manages API keys, and passes tunnel admin
//! calls through. Every failure maps to structured `{error:{message}}` JSON.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header::AUTHORIZATION};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use nanoid::nanoid;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::agent::{ChatTurn, GENERATION_TIMEOUT};
use crate::error::RelayError;
use crate::router::{ModelRouter, list_models};
use crate::store::{ApiKeyRecord, ResponseStatus, Store, StoredResponse, Usage};
use crate::tunnel::TunnelManager;

const DEFAULT_LIST_LIMIT: usize = 50;

/// Process-root-owned services injected into every handler.
pub struct AppState {
    pub router: ModelRouter,
    pub store: Store,
    pub tunnel: Arc<TunnelManager>,
    pub master_key: Option<String>,
    pub port: u16,
    pub db_path: String,
}

/// Who authorized the request; attached as a request extension by the auth
/// middleware so handlers can meter usage per key.
#[derive(Clone)]
enum AuthContext {
    /// No master key configured; the gateway is open.
    Open,
    Master,
    Key(ApiKeyRecord),
}

impl AuthContext {
    fn key_id(&self) -> Option<&str> {
        match self {
            AuthContext::Key(record) => Some(&record.id),
            _ => None,
        }
    }
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": { "message": message.into() } })),
    )
        .into_response()
}

fn map_error(err: &RelayError) -> Response {
    match err {
        RelayError::NotFound(what) => {
            error_json(StatusCode::NOT_FOUND, format!("{what} not found"))
        }
        RelayError::AuthInvalid => error_json(StatusCode::UNAUTHORIZED, "Invalid API key"),
        _ => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Character-length heuristic (~4 chars per token); the CLIs report no real
/// token accounting in single-shot mode.
fn estimate_tokens(text: &str) -> i64 {
    text.len().div_ceil(4) as i64
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Pass-through when no master key is configured; otherwise the bearer must
/// equal the master key or hash-match an active, non-expired stored key.
async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(master) = state.master_key.as_deref() else {
        request.extensions_mut().insert(AuthContext::Open);
        return next.run(request).await;
    };

    let Some(token) = bearer_token(&request) else {
        return error_json(StatusCode::UNAUTHORIZED, "Missing API key");
    };

    if token == master {
        request.extensions_mut().insert(AuthContext::Master);
        return next.run(request).await;
    }

    match state.store.verify_key(&token).await {
        Ok(Some(record)) => {
            request.extensions_mut().insert(AuthContext::Key(record));
            next.run(request).await
        }
        Ok(None) => error_json(StatusCode::UNAUTHORIZED, "Invalid API key"),
        Err(err) => {
            error!(%err, "key verification failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "auth store unavailable")
        }
    }
}

// ----- health & models -----

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let code = state.router.code_status(false).await;
    let chat = state.router.chat_status(false).await;
    let tunnel = state.tunnel.status().await;

    let storage = match (
        state.store.response_count().await,
        state.store.key_count().await,
    ) {
        (Ok(responses), Ok(keys)) => json!({
            "ok": true,
            "path": state.db_path,
            "responses": responses,
            "api_keys": keys,
        }),
        _ => json!({ "ok": false, "path": state.db_path }),
    };

    Json(json!({
        "status": "ok",
        "agents": { "codex": code, "gemini": chat },
        "tunnel": tunnel,
        "config": {
            "port": state.port,
            "master_key_configured": state.master_key.is_some(),
        },
        "storage": storage,
    }))
    .into_response()
}

async fn models() -> Response {
    let data: Vec<Value> = list_models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "display_name": model.display_name,
                "owned_by": model.provider.as_str(),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

// ----- /v1/responses -----

#[derive(Debug, Deserialize)]
struct CreateResponseRequest {
    model: Option<String>,
    input: Option<Value>,
    instructions: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

fn flatten_input(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn build_prompt(instructions: Option<&str>, input: &Value) -> String {
    let body = flatten_input(input);
    match instructions {
        Some(instructions) if !instructions.trim().is_empty() => {
            format!("{instructions}\n\n{body}")
        }
        _ => body,
    }
}

fn response_payload(response: &StoredResponse) -> Value {
    let output: Value =
        serde_json::from_str(&response.output).unwrap_or_else(|_| Value::Array(vec![]));
    json!({
        "id": response.id,
        "object": "response",
        "created_at": response.created_at,
        "status": response.status,
        "model": response.model,
        "output": output,
        "output_text": response.output_text,
        "usage": {
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.total_tokens,
        },
        "metadata": response.metadata,
    })
}

async fn create_response(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateResponseRequest>,
) -> Response {
    let Some(input) = payload.input else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: 'input'",
        );
    };
    let model = payload.model.unwrap_or_else(|| "gpt-5-codex".to_owned());
    let prompt = build_prompt(payload.instructions.as_deref(), &input);

    let routed = match state
        .router
        .run_prompt(&model, &prompt, GENERATION_TIMEOUT)
        .await
    {
        Ok(routed) => routed,
        Err(err) => {
            error!(%err, %model, "generation failed");
            // Failed generations are never persisted.
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "id": format!("resp_{}", nanoid!(16)),
                    "object": "response",
                    "status": ResponseStatus::Failed.as_str(),
                    "model": model,
                    "error": { "message": err.to_string() },
                })),
            )
                .into_response();
        }
    };

    let output_text = routed.output;
    let usage = Usage {
        input_tokens: estimate_tokens(&prompt),
        output_tokens: estimate_tokens(&output_text),
        total_tokens: estimate_tokens(&prompt) + estimate_tokens(&output_text),
    };
    let output_items = json!([{
        "type": "message",
        "id": format!("msg_{}", nanoid!(16)),
        "role": "assistant",
        "status": "completed",
        "content": [{ "type": "output_text", "text": output_text, "annotations": [] }],
    }]);

    let response = StoredResponse {
        id: format!("resp_{}", nanoid!(16)),
        model: model.clone(),
        status: ResponseStatus::Completed.as_str().to_owned(),
        input: input.to_string(),
        output: output_items.to_string(),
        output_text,
        usage,
        created_at: Utc::now().timestamp(),
        metadata: payload
            .metadata
            .unwrap_or_else(|| json!({ "provider": routed.provider.as_str() })),
    };

    if let Err(err) = state.store.insert_response(&response).await {
        error!(%err, "failed to persist response");
        return map_error(&err);
    }
    if let Some(key_id) = auth.key_id() {
        if let Err(err) = state
            .store
            .log_usage(key_id, "/v1/responses", &model, usage)
            .await
        {
            error!(%err, "failed to log usage");
        }
    }

    Json(response_payload(&response)).into_response()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_responses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state
        .store
        .list_responses(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
    {
        Ok(responses) => {
            let data: Vec<Value> = responses.iter().map(response_payload).collect();
            Json(json!({ "object": "list", "data": data })).into_response()
        }
        Err(err) => map_error(&err),
    }
}

async fn get_response(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get_response(&id).await {
        Ok(Some(response)) => Json(response_payload(&response)).into_response(),
        Ok(None) => map_error(&RelayError::NotFound("Response".into())),
        Err(err) => map_error(&err),
    }
}

async fn delete_response(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.delete_response(&id).await {
        Ok(true) => {
            Json(json!({ "id": id, "object": "response", "deleted": true })).into_response()
        }
        Ok(false) => map_error(&RelayError::NotFound("Response".into())),
        Err(err) => map_error(&err),
    }
}

// ----- /v1/chat/completions -----

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: Option<String>,
    messages: Option<Vec<ChatMessage>>,
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ChatCompletionRequest>,
) -> Response {
    let Some(messages) = payload.messages.filter(|m| !m.is_empty()) else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: 'messages'",
        );
    };
    let model = payload
        .model
        .unwrap_or_else(|| "gemini-2.5-flash".to_owned());

    let turns: Vec<ChatTurn> = messages
        .iter()
        .map(|message| ChatTurn {
            role: message.role.clone(),
            content: flatten_input(&message.content),
        })
        .collect();

    let routed = match state
        .router
        .run_with_history(&model, &turns, GENERATION_TIMEOUT)
        .await
    {
        Ok(routed) => routed,
        Err(err) => {
            error!(%err, %model, "chat generation failed");
            return map_error(&err);
        }
    };

    let prompt_tokens: i64 = turns
        .iter()
        .map(|turn| estimate_tokens(&turn.content))
        .sum();
    let completion_tokens = estimate_tokens(&routed.output);
    let usage = Usage {
        input_tokens: prompt_tokens,
        output_tokens: completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    };

    let id = format!("chatcmpl-{}", nanoid!(16));
    let created = Utc::now().timestamp();

    // Rows are tagged with the originating endpoint so the two histories
    // stay distinguishable in one table.
    let stored = StoredResponse {
        id: id.clone(),
        model: model.clone(),
        status: ResponseStatus::Completed.as_str().to_owned(),
        input: serde_json::to_string(
            &turns
                .iter()
                .map(|turn| json!({ "role": turn.role, "content": turn.content }))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_owned()),
        output: json!([{ "role": "assistant", "content": routed.output }]).to_string(),
        output_text: routed.output.clone(),
        usage,
        created_at: created,
        metadata: json!({ "endpoint": "chat.completions", "provider": routed.provider.as_str() }),
    };
    if let Err(err) = state.store.insert_response(&stored).await {
        error!(%err, "failed to persist chat completion");
    }
    if let Some(key_id) = auth.key_id() {
        if let Err(err) = state
            .store
            .log_usage(key_id, "/v1/chat/completions", &model, usage)
            .await
        {
            error!(%err, "failed to log usage");
        }
    }

    Json(json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": routed.output },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        },
    }))
    .into_response()
}

// ----- /v1/api-keys -----

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: Option<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    rate_limit: Option<i64>,
    expires_at: Option<i64>,
}

/// Redacted view: everything except the plaintext, which exists only in the
/// issuance response.
fn key_view(record: &ApiKeyRecord) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "key": format!("{}...", record.key_prefix),
        "key_prefix": record.key_prefix,
        "scopes": record.scopes,
        "is_active": record.is_active,
        "rate_limit": record.rate_limit,
        "expires_at": record.expires_at,
        "created_at": record.created_at,
        "last_used_at": record.last_used_at,
    })
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Response {
    let Some(name) = payload
        .name
        .map(|n| n.trim().to_owned())
        .filter(|n| !n.is_empty())
    else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: 'name'",
        );
    };

    match state
        .store
        .issue_key(
            &name,
            payload.scopes.unwrap_or_default(),
            payload.rate_limit,
            payload.expires_at,
        )
        .await
    {
        Ok(issued) => {
            info!(id = %issued.record.id, name = %issued.record.name, "issued api key");
            Json(json!({
                "id": issued.record.id,
                "name": issued.record.name,
                "key": issued.plaintext,
                "key_prefix": issued.record.key_prefix,
                "scopes": issued.record.scopes,
                "is_active": true,
                "rate_limit": issued.record.rate_limit,
                "expires_at": issued.record.expires_at,
                "created_at": issued.record.created_at,
            }))
            .into_response()
        }
        Err(err) => map_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ListKeysQuery {
    #[serde(default)]
    include_inactive: bool,
}

async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> Response {
    match state.store.list_keys(query.include_inactive).await {
        Ok(records) => {
            let data: Vec<Value> = records.iter().map(key_view).collect();
            Json(json!({ "object": "list", "data": data })).into_response()
        }
        Err(err) => map_error(&err),
    }
}

async fn get_api_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get_key(&id).await {
        Ok(Some(record)) => Json(key_view(&record)).into_response(),
        Ok(None) => map_error(&RelayError::NotFound("API key".into())),
        Err(err) => map_error(&err),
    }
}

async fn revoke_api_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.revoke_key(&id).await {
        Ok(true) => Json(json!({ "id": id, "is_active": false })).into_response(),
        Ok(false) => map_error(&RelayError::NotFound("API key".into())),
        Err(err) => map_error(&err),
    }
}

async fn delete_api_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.delete_key(&id).await {
        Ok(true) => Json(json!({ "id": id, "deleted": true })).into_response(),
        Ok(false) => map_error(&RelayError::NotFound("API key".into())),
        Err(err) => map_error(&err),
    }
}

// ----- /admin/tunnel -----

async fn tunnel_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.tunnel.status().await).into_response()
}

async fn tunnel_start(State(state): State<Arc<AppState>>) -> Response {
    Json(state.tunnel.start().await).into_response()
}

async fn tunnel_stop(State(state): State<Arc<AppState>>) -> Response {
    Json(state.tunnel.stop().await).into_response()
}

// ----- wiring -----

pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/responses", post(create_response).get(list_responses))
        .route(
            "/v1/responses/:id",
            get(get_response).delete(delete_response),
        )
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/api-keys", post(create_api_key).get(list_api_keys))
        .route("/v1/api-keys/:id", get(get_api_key).delete(delete_api_key))
        .route("/v1/api-keys/:id/revoke", post(revoke_api_key))
        .route(
            "/admin/tunnel/status",
            get(tunnel_status).post(tunnel_status),
        )
        .route("/admin/tunnel/start", get(tunnel_start).post(tunnel_start))
        .route("/admin/tunnel/stop", get(tunnel_stop).post(tunnel_stop))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .with_state(state)
}

/// Bind and serve until ctrl-c. A taken port maps to the startup-only
/// [`RelayError::PortInUse`] instead of a generic io failure.
pub async fn serve(state: Arc<AppState>) -> Result<(), RelayError> {
    let port = state.port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                RelayError::PortInUse(port)
            } else {
                RelayError::Io(err)
            }
        })?;
    let bound = listener.local_addr()?;
    info!(%bound, "relay listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, AuthMethod};
    use crate::router::PromptBackend;
    use crate::tunnel::TunnelMode;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, header::CONTENT_TYPE};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct StubBackend {
        reply: Option<String>,
        error: Option<String>,
    }

    impl StubBackend {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply.to_owned()),
                error: None,
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                error: Some(message.to_owned()),
            })
        }

        fn result(&self) -> Result<String, RelayError> {
            match (&self.reply, &self.error) {
                (Some(reply), _) => Ok(reply.clone()),
                (None, Some(message)) => Err(RelayError::ExecutableNotFound(message.clone())),
                (None, None) => unreachable!(),
            }
        }
    }

    #[async_trait]
    impl PromptBackend for StubBackend {
        async fn run_prompt(
            &self,
            _prompt: &str,
            _model: &str,
            _timeout: Duration,
        ) -> Result<String, RelayError> {
            self.result()
        }

        async fn run_with_history(
            &self,
            _turns: &[ChatTurn],
            _model: &str,
            _timeout: Duration,
        ) -> Result<String, RelayError> {
            self.result()
        }

        async fn spawn_stream(
            &self,
            _prompt: &str,
            _model: &str,
        ) -> Result<(String, tokio::sync::mpsc::Receiver<crate::agent::StreamEvent>), RelayError>
        {
            use crate::agent::StreamEvent;
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let reply = self.result()?;
            let _ = tx.send(StreamEvent::Data(reply)).await;
            let _ = tx.send(StreamEvent::End { exit_code: Some(0) }).await;
            Ok(("proc_stub".into(), rx))
        }

        async fn status(&self, _force_refresh: bool) -> AgentStatus {
            AgentStatus {
                installed: true,
                version: Some("1.0.0".into()),
                authenticated: true,
                auth_method: AuthMethod::ApiKey,
                message: None,
            }
        }
    }

    async fn test_state(
        master_key: Option<&str>,
        code: Arc<StubBackend>,
        chat: Arc<StubBackend>,
    ) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("relay.db").to_str().unwrap().to_owned();
        let store = Store::open(&db_path).await.unwrap();
        let state = Arc::new(AppState {
            router: ModelRouter::new(code, chat),
            store,
            tunnel: Arc::new(TunnelManager::new(8080, TunnelMode::Quick, None)),
            master_key: master_key.map(str::to_owned),
            port: 8080,
            db_path,
        });
        (dir, state)
    }

    fn post_json(uri: &str, body: Value, bearer: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::post(uri).header(CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, bearer: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::get(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn responses_happy_path_persists_and_echoes() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("chat-hi"),
        )
        .await;
        let app = build_router(state.clone());

        let response = app
            .oneshot(post_json("/v1/responses", json!({ "input": "hello" }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        assert_eq!(body["status"], "completed");
        assert_eq!(body["output_text"], "hi");
        assert_eq!(body["usage"]["input_tokens"], 2); // "hello" rounds up to 2

        let id = body["id"].as_str().unwrap();
        let row = state.store.get_response(id).await.unwrap().unwrap();
        assert_eq!(row.output_text, "hi");
        assert_eq!(row.status, "completed");
    }

    #[tokio::test]
    async fn gemini_models_dispatch_to_chat_backend() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("code-hi"),
            StubBackend::replying("chat-hi"),
        )
        .await;
        let app = build_router(state);

        let response = app
            .oneshot(post_json(
                "/v1/responses",
                json!({ "input": "hello", "model": "gemini-2.5-flash" }),
                None,
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["output_text"], "chat-hi");
        assert_eq!(body["metadata"]["provider"], "gemini");
    }

    #[tokio::test]
    async fn missing_input_is_a_structured_400() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        let response = app
            .oneshot(post_json("/v1/responses", json!({ "model": "gpt-5" }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(
            body["error"]["message"],
            "Missing required parameter: 'input'"
        );
    }

    #[tokio::test]
    async fn provider_failure_returns_500_and_persists_nothing() {
        let (_dir, state) = test_state(
            None,
            StubBackend::failing("codex"),
            StubBackend::failing("gemini"),
        )
        .await;
        let app = build_router(state.clone());

        let response = app
            .oneshot(post_json("/v1/responses", json!({ "input": "hello" }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "failed");
        assert!(body["error"]["message"].as_str().unwrap().contains("codex"));
        assert_eq!(state.store.response_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn response_lookup_404s_on_unknown_id() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(get_req("/v1/responses/resp_missing", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                HttpRequest::delete("/v1/responses/resp_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_completions_flattens_history() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("code"),
            StubBackend::replying("chat answer"),
        )
        .await;
        let app = build_router(state.clone());

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-pro",
                    "messages": [
                        { "role": "system", "content": "be brief" },
                        { "role": "user", "content": "hi" },
                    ],
                }),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "chat answer");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");

        let rows = state.store.list_responses(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata["endpoint"], "chat.completions");
    }

    #[tokio::test]
    async fn chat_completions_requires_messages() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "model": "x" }),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn master_key_scenario_issue_use_and_reject() {
        let (_dir, state) = test_state(
            Some("msk_ABC"),
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state.clone());

        // Issue a key using the master key.
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/api-keys",
                json!({ "name": "test" }),
                Some("msk_ABC"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let plaintext = body["key"].as_str().unwrap().to_owned();
        assert!(plaintext.starts_with("cdx_"));
        assert_eq!(body["key_prefix"], plaintext[..8]);

        // The issued key authenticates a generation call.
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/responses",
                json!({ "input": "hello" }),
                Some(&plaintext),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The key-authenticated call was metered.
        assert_eq!(state.store.usage_count().await.unwrap(), 1);

        // An unrelated random token is rejected.
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/responses",
                json!({ "input": "hello" }),
                Some("cdx_totally_made_up_token"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "Invalid API key");

        // No bearer at all.
        let response = app
            .oneshot(post_json("/v1/responses", json!({ "input": "hello" }), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "Missing API key");
    }

    #[tokio::test]
    async fn key_reads_never_reveal_plaintext() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/v1/api-keys", json!({ "name": "ci" }), None))
            .await
            .unwrap();
        let issued = body_json(response).await;
        let plaintext = issued["key"].as_str().unwrap().to_owned();
        let id = issued["id"].as_str().unwrap().to_owned();

        let response = app
            .clone()
            .oneshot(get_req("/v1/api-keys", None))
            .await
            .unwrap();
        let listed = body_json(response).await;
        let shown = listed["data"][0]["key"].as_str().unwrap();
        assert_ne!(shown, plaintext);
        assert_eq!(shown, format!("{}...", &plaintext[..8]));

        let response = app
            .oneshot(get_req(&format!("/v1/api-keys/{id}"), None))
            .await
            .unwrap();
        let fetched = body_json(response).await;
        assert_eq!(fetched["key"], format!("{}...", &plaintext[..8]));
    }

    #[tokio::test]
    async fn revoke_then_delete_key_lifecycle() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state.clone());

        let issued = body_json(
            app.clone()
                .oneshot(post_json("/v1/api-keys", json!({ "name": "temp" }), None))
                .await
                .unwrap(),
        )
        .await;
        let id = issued["id"].as_str().unwrap().to_owned();

        let revoked = body_json(
            app.clone()
                .oneshot(post_json(
                    &format!("/v1/api-keys/{id}/revoke"),
                    json!({}),
                    None,
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(revoked["is_active"], false);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::delete(format!("/v1/api-keys/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get_key(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_reports_agents_tunnel_and_storage() {
        let (_dir, state) = test_state(
            Some("msk_ABC"),
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        // Health stays reachable without credentials.
        let response = app.oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"]["codex"]["installed"], true);
        assert_eq!(body["tunnel"]["active"], false);
        assert_eq!(body["config"]["master_key_configured"], true);
        assert_eq!(body["storage"]["ok"], true);
    }

    #[tokio::test]
    async fn models_list_covers_both_providers() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        let body = body_json(app.oneshot(get_req("/v1/models", None)).await.unwrap()).await;
        let data = body["data"].as_array().unwrap();
        assert!(data.iter().any(|m| m["owned_by"] == "codex"));
        assert!(data.iter().any(|m| m["owned_by"] == "gemini"));
    }

    #[tokio::test]
    async fn tunnel_admin_status_passes_through() {
        let (_dir, state) = test_state(
            None,
            StubBackend::replying("hi"),
            StubBackend::replying("hi"),
        )
        .await;
        let app = build_router(state);

        let body = body_json(
            app.clone()
                .oneshot(get_req("/admin/tunnel/status", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["active"], false);
        assert_eq!(body["url"], Value::Null);

        // stop on a stopped tunnel stays a no-op through the HTTP surface.
        let body = body_json(
            app.oneshot(post_json("/admin/tunnel/stop", json!({}), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["active"], false);
        assert_eq!(body["url"], Value::Null);
    }
}
