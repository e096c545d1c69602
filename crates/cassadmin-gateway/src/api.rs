use crate::dispatcher::{CallContext, Dispatcher, InvocationRequest};
use crate::error::{DispatchError, ErrorKind};
use crate::health::{health_document, HealthMonitor};
use crate::protocol::{lift_target_host, Envelope, OperationBody, Response as WireResponse};
use crate::registry::OperationDescriptor;
use crate::security::AuthRateLimiter;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const AUTH_REALM: &str = r#"Bearer realm="cassadmin""#;
const BUSY_RETRY_AFTER_SECS: &str = "5";
const LOCKOUT_RETRY_AFTER_SECS: &str = "60";
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct GatewayApi {
    dispatcher: Arc<Dispatcher>,
    health: HealthMonitor,
    rate_limiter: Arc<AuthRateLimiter>,
    trusted_proxies: Vec<IpAddr>,
    drain_timeout: Duration,
    /// Fired once the shutdown drain deadline passes.
    abort: CancellationToken,
}

impl GatewayApi {
    pub fn new(dispatcher: Arc<Dispatcher>, health: HealthMonitor) -> Self {
        Self {
            dispatcher,
            health,
            rate_limiter: Arc::new(AuthRateLimiter::new()),
            trusted_proxies: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            abort: CancellationToken::new(),
        }
    }

    /// Peers whose `X-Forwarded-For` header names the real client.
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// How long shutdown waits for in-flight calls before cancelling them.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/v1/operations", get(operations_handler))
            .route("/api/v1/operations/:name", post(invoke_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .layer(axum::middleware::from_fn(
                crate::security::security_headers_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve until `shutdown` fires.
    ///
    /// New connections stop at once. In-flight calls get `drain_timeout` to
    /// finish; after that their dispatch futures are dropped, which kills
    /// their processes, and the callers receive a `Busy` error.
    pub async fn serve_on(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let limiter = self.rate_limiter.clone();
        let prune_stop = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = prune_stop.cancelled() => break,
                    _ = ticker.tick() => limiter.prune(),
                }
            }
        });

        let abort = self.abort.clone();
        let drain_timeout = self.drain_timeout;
        let drain_start = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => return,
                _ = drain_start.cancelled() => {}
            }
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = tokio::time::sleep(drain_timeout) => {
                    tracing::warn!(
                        drain_timeout_ms = drain_timeout.as_millis() as u64,
                        "drain deadline passed, cancelling in-flight calls"
                    );
                    abort.cancel();
                }
            }
        });

        let abort = self.abort.clone();
        let addr = listener.local_addr()?;
        let router = Arc::new(self).router();
        tracing::info!(%addr, "gateway API listening");

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        abort.cancel();
        served?;
        Ok(())
    }
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

async fn operations_handler(State(state): State<Arc<GatewayApi>>) -> Json<Vec<OperationDescriptor>> {
    Json(state.dispatcher.registry().describe())
}

async fn health_handler(State(state): State<Arc<GatewayApi>>) -> Response {
    let health = state.health.state().await;
    let gate = state.dispatcher.gate();
    let extra = HashMap::from([
        ("inFlight", serde_json::json!(gate.in_flight())),
        ("maxConcurrentProcesses", serde_json::json!(gate.capacity())),
    ]);
    let code = if health.status.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health_document(&health, extra))).into_response()
}

async fn invoke_handler(
    State(state): State<Arc<GatewayApi>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client = client_id(
        &headers,
        connect.map(|ConnectInfo(addr)| addr),
        &state.trusted_proxies,
    );

    if state.rate_limiter.is_rate_limited(&client) {
        tracing::warn!(
            target: "cassadmin::security",
            client = %client,
            "request refused: client locked out"
        );
        return error_response(None, &DispatchError::RateLimited);
    }

    let body = if body.is_empty() {
        OperationBody::default()
    } else {
        match serde_json::from_slice::<OperationBody>(&body) {
            Ok(body) => body,
            Err(e) => {
                return error_response(None, &DispatchError::MalformedRequest(e.to_string()));
            }
        }
    };

    let mut arguments = body.arguments;
    let target_host = lift_target_host(&mut arguments, body.target_host);
    let request = InvocationRequest {
        operation: name,
        arguments,
        credential: credential(&headers),
        target_host,
    };

    let ctx = CallContext::new(client.clone());
    let result = tokio::select! {
        result = state.dispatcher.dispatch(request, &ctx) => result,
        _ = state.abort.cancelled() => {
            tracing::warn!(
                target: "cassadmin::dispatch",
                request_id = %ctx.request_id,
                client = %ctx.client,
                "call cancelled at shutdown"
            );
            let err = DispatchError::ShuttingDown;
            let envelope = Envelope {
                id: None,
                request_id: Some(ctx.request_id),
                response: WireResponse::error(&err),
            };
            return error_response(Some(envelope), &err);
        }
    };

    match result.outcome {
        Err(ref err) if err.kind() == ErrorKind::Unauthenticated => {
            state.rate_limiter.record_failure(&client);
        }
        _ => state.rate_limiter.record_success(&client),
    }

    match result.outcome {
        Ok(_) => (StatusCode::OK, Json(Envelope::new(None, &result))).into_response(),
        Err(ref err) => error_response(Some(Envelope::new(None, &result)), err),
    }
}

/// Credential from `Authorization: Bearer` or `X-API-Key`.
fn credential(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    bearer
        .filter(|v| !v.is_empty())
        .or(api_key)
        .map(str::to_string)
}

/// Key for the failed-auth limiter. The peer address, unless the peer is a
/// trusted proxy, in which case the nearest untrusted `X-Forwarded-For` hop.
fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .find(|hop| !trusted_proxies.contains(hop))
        .unwrap_or(peer)
        .to_string()
}

pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::MissingCredential => StatusCode::UNAUTHORIZED,
        DispatchError::InvalidCredential => StatusCode::FORBIDDEN,
        DispatchError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        DispatchError::InvalidArguments { .. } | DispatchError::MalformedRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::ExecutionFailed { .. } | DispatchError::LaunchFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        DispatchError::Busy | DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(envelope: Option<Envelope>, err: &DispatchError) -> Response {
    let envelope = envelope.unwrap_or_else(|| Envelope {
        id: None,
        request_id: None,
        response: WireResponse::error(err),
    });
    let mut response = (status_for(err), Json(envelope)).into_response();
    let headers = response.headers_mut();
    match err {
        DispatchError::MissingCredential => {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
        }
        DispatchError::Busy => {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(BUSY_RETRY_AFTER_SECS),
            );
        }
        DispatchError::RateLimited => {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(LOCKOUT_RETRY_AFTER_SECS),
            );
        }
        _ => {}
    }
    response
}
