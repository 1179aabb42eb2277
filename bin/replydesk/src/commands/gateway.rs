use replydesk_bot::{BotEvent, BotRuntime, RuleClassifier, RuleSet, RuleStore};
use replydesk_browser::CdpDriver;
use replydesk_core::{Config, Credentials, Error, Paths};
use replydesk_storage::{SessionCipher, SessionSecret, SessionStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use axum::{
    async_trait,
    body::Body,
    extract::{
        rejection::JsonRejection,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        FromRequest, State,
    },
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

// ---------------------------------------------------------------------------
// Shared state passed to HTTP/WS handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct GatewayState {
    runtime: Arc<BotRuntime>,
    api_token: Option<String>,
    started: Instant,
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn url_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn token_from_query<B>(req: &Request<B>) -> Option<String> {
    let q = req.uri().query()?;
    q.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .and_then(|(_, v)| url_decode(v))
}

fn request_authorized<B>(req: &Request<B>, token: &str) -> bool {
    let from_header = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(h) if h.starts_with("Bearer ") => secure_eq(&h[7..], token),
        _ => false,
    };
    from_header
        || token_from_query(req)
            .map(|v| secure_eq(&v, token))
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Bearer token authentication middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<GatewayState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let token = match &state.api_token {
        Some(t) if !t.is_empty() => t,
        _ => return next.run(req).await,
    };

    // The WS handler validates itself so it can close with 4401.
    if req.uri().path() == "/v1/health" || req.uri().path() == "/v1/ws" {
        return next.run(req).await;
    }

    if request_authorized(&req, token) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "ok": false,
                "error": "Unauthorized: invalid or missing Bearer token",
                "kind": "unauthorized",
            })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Authentication(_) | Error::CodeVerification(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::AttemptExpired(_) => StatusCode::GONE,
        Error::NotConnected(_) | Error::Decryption => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Automation(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, "Request rejected");
        }
        (
            status,
            Json(json!({
                "ok": false,
                "error": self.0.user_message(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

/// `Json<T>` whose rejection goes through the `{ok: false}` envelope.
struct JsonBody<T>(T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(error = %rejection.body_text(), "Rejected request body");
                Err(ApiError(Error::Validation(rejection_message(&rejection).to_string())))
            }
        }
    }
}

fn rejection_message(rejection: &JsonRejection) -> &'static str {
    match rejection {
        JsonRejection::MissingJsonContentType(_) => "expected a JSON body (Content-Type: application/json)",
        JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
        JsonRejection::JsonDataError(_) => "request body has missing or invalid fields",
        _ => "could not read request body",
    }
}

/// `{ok: true}` merged with the fields of `body`.
fn ok_with(body: impl Serialize) -> ApiResult {
    let mut value = serde_json::to_value(body).map_err(Error::from)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Ok(Json(value))
        }
        None => Ok(Json(json!({ "ok": true, "data": value }))),
    }
}

// ---------------------------------------------------------------------------
// HTTP request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginStartRequest {
    #[serde(default)]
    identity: Option<String>,
    credentials: Credentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginVerifyRequest {
    #[serde(alias = "attempt_id")]
    attempt_id: String,
    code: String,
}

#[derive(Deserialize, Default)]
struct LogoutRequest {
    #[serde(default)]
    identity: Option<String>,
}

#[derive(Deserialize)]
struct SendRequest {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn identity_or_default(state: &GatewayState, identity: Option<String>) -> String {
    identity
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| state.runtime.config.portal.identity.clone())
}

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn handle_login_start(
    State(state): State<GatewayState>,
    JsonBody(req): JsonBody<LoginStartRequest>,
) -> ApiResult {
    let identity = identity_or_default(&state, req.identity);
    let outcome = state.runtime.login.start(&identity, &req.credentials).await?;
    ok_with(outcome)
}

async fn handle_login_verify(
    State(state): State<GatewayState>,
    JsonBody(req): JsonBody<LoginVerifyRequest>,
) -> ApiResult {
    let outcome = state.runtime.login.verify(&req.attempt_id, &req.code).await?;
    ok_with(outcome)
}

async fn handle_logout(
    State(state): State<GatewayState>,
    body: Option<Json<LogoutRequest>>,
) -> ApiResult {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let identity = identity_or_default(&state, req.identity);
    if identity == state.runtime.config.portal.identity {
        state.runtime.supervisor.stop().await;
    }
    let removed = state.runtime.login.logout(&identity).await?;
    ok_with(json!({ "removed": removed }))
}

async fn handle_bot_start(State(state): State<GatewayState>) -> ApiResult {
    let status = state.runtime.supervisor.start().await?;
    ok_with(status)
}

async fn handle_bot_stop(State(state): State<GatewayState>) -> ApiResult {
    let status = state.runtime.supervisor.stop().await;
    ok_with(status)
}

async fn handle_status(State(state): State<GatewayState>) -> ApiResult {
    ok_with(state.runtime.status())
}

async fn handle_action_send(
    State(state): State<GatewayState>,
    JsonBody(req): JsonBody<SendRequest>,
) -> ApiResult {
    state.runtime.supervisor.manual_send(&req.text).await?;
    ok_with(json!({}))
}

async fn handle_action_skip(State(state): State<GatewayState>) -> ApiResult {
    let dismissed = state.runtime.supervisor.manual_skip().await?;
    ok_with(json!({ "dismissed": dismissed }))
}

async fn handle_rules_get(State(state): State<GatewayState>) -> ApiResult {
    let rules = state.runtime.rules.load()?;
    ok_with(rules)
}

async fn handle_rules_update(
    State(state): State<GatewayState>,
    JsonBody(rules): JsonBody<RuleSet>,
) -> ApiResult {
    state.runtime.rules.save(&rules)?;
    state
        .runtime
        .hub
        .info(format!("Rules updated ({} rules)", rules.rules.len()));
    ok_with(rules)
}

// ---------------------------------------------------------------------------
// WebSocket push channel
// ---------------------------------------------------------------------------

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    req: Request<axum::body::Body>,
) -> impl IntoResponse {
    let token_valid = match &state.api_token {
        Some(t) if !t.is_empty() => request_authorized(&req, t),
        _ => true,
    };

    ws.on_upgrade(move |socket| async move {
        if !token_valid {
            let mut socket = socket;
            let _ = socket
                .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: 4401,
                    reason: std::borrow::Cow::Borrowed("Unauthorized"),
                })))
                .await;
            return;
        }
        handle_ws_connection(socket, state).await;
    })
}

fn encode_event(event: &BotEvent) -> Option<WsMessage> {
    serde_json::to_string(event).ok().map(WsMessage::Text)
}

async fn handle_ws_connection(socket: WebSocket, state: GatewayState) {
    use futures::{SinkExt, StreamExt};

    info!("WebSocket observer connected");
    let hub = state.runtime.hub.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Subscribe before taking the hello so nothing falls in between.
    let mut events = hub.subscribe();
    if let Some(hello) = encode_event(&hub.hello()) {
        if ws_sender.send(hello).await.is_err() {
            return;
        }
    }

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket observer lagged, resending hello");
                    hub.hello()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(msg) = encode_event(&event) else {
                continue;
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Observers only listen; drain until the client goes away.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    send_task.abort();
    info!("WebSocket observer disconnected");
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn build_cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .gateway
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o.trim()).ok())
        .collect();
    if origins.is_empty() {
        return CorsLayer::permissive().allow_credentials(false);
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn build_router(state: GatewayState) -> Router {
    let cors = build_cors_layer(&state.runtime.config);
    Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/status", get(handle_status))
        .route("/v1/login/start", post(handle_login_start))
        .route("/v1/login/verify", post(handle_login_verify))
        .route("/v1/logout", post(handle_logout))
        .route("/v1/bot/start", post(handle_bot_start))
        .route("/v1/bot/stop", post(handle_bot_stop))
        .route("/v1/action/send", post(handle_action_send))
        .route("/v1/action/skip", post(handle_action_skip))
        .route("/v1/rules", get(handle_rules_get).post(handle_rules_update))
        .route("/v1/ws", get(handle_ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(cli_host: Option<String>, cli_port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;

    let host = cli_host.unwrap_or_else(|| config.gateway.host.clone());
    let port = cli_port.unwrap_or(config.gateway.port);

    let secret = SessionSecret::from_env();
    let store = Arc::new(SessionStore::new(paths.clone(), SessionCipher::new(secret)));
    let rules = Arc::new(RuleStore::new(paths.rules_file()));
    let classifier = Arc::new(RuleClassifier::new(rules.clone()));
    let driver = Arc::new(CdpDriver::new(
        config.browser.clone(),
        config.selectors.clone(),
        config.profile_root(&paths),
    ));

    let api_token = config.api_token();
    let is_exposed = host != "127.0.0.1" && host != "localhost" && host != "::1";
    if api_token.is_none() {
        if is_exposed {
            warn!(%host, "Gateway is bound to a non-loopback address without an API token");
        } else {
            info!("No API token configured, control surface is open on loopback");
        }
    }

    let runtime = Arc::new(BotRuntime::new(
        config,
        &paths,
        store,
        driver,
        classifier,
        rules,
    ));
    if runtime.hub.snapshot().secret_misconfigured {
        runtime
            .hub
            .warn("REPLYDESK_SESSION_SECRET is missing or weak; stored sessions are not protected");
    }

    let state = GatewayState {
        runtime: runtime.clone(),
        api_token,
        started: Instant::now(),
    };
    let app = build_router(state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Gateway listening");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown_rx.recv().await;
            })
            .await
            .ok();
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    runtime.shutdown().await;

    match tokio::time::timeout(std::time::Duration::from_secs(10), http_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not exit in time"),
    }

    info!("Gateway stopped");
    Ok(())
}
