//! HTTP boundary interceptor
//!
//! [`http_audit_middleware`] wraps every inbound exchange. For each request it
//! resolves the trace id, buffers the request body, runs the rest of the stack
//! inside a [`CorrelationContext`], buffers the response, writes one INBOUND and
//! one OUTBOUND record, and finally forwards the response untouched.
//!
//! The middleware is installed by [`IoLogger::layer_router`](crate::IoLogger::layer_router);
//! it can also be added by hand:
//!
//! ```rust,ignore
//! Router::new()
//!     .route("/accounts/{id}", get(get_account))
//!     .layer(axum::middleware::from_fn_with_state(auditor, http_audit_middleware))
//! ```

use axum::{
    extract::{OriginalUri, Request, State},
    http::{header::AUTHORIZATION, HeaderName, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::body::{self, capture_request, CapturedResponse};
use crate::config::IoLoggerConfig;
use crate::correlation::{self, CorrelationContext, Credential, TRACE_ID_HEADER};
use crate::recorder::{outbound_timestamp, AuditRecorder, Capture, Channel, Direction};

/// State of the HTTP audit middleware
#[derive(Clone)]
pub struct HttpAuditor {
    recorder: AuditRecorder,
    settings: Arc<HttpAuditSettings>,
}

struct HttpAuditSettings {
    enabled: bool,
    trace_header: HeaderName,
    excluded_routes: Vec<String>,
    max_body_bytes: usize,
}

impl HttpAuditor {
    pub fn new(recorder: AuditRecorder, config: &IoLoggerConfig) -> Self {
        let trace_header = HeaderName::from_bytes(config.trace_header.to_ascii_lowercase().as_bytes())
            .unwrap_or_else(|_| {
                tracing::warn!(
                    header = %config.trace_header,
                    "IOLogger: invalid trace header name, using {}",
                    TRACE_ID_HEADER
                );
                HeaderName::from_static("traceid")
            });

        Self {
            recorder,
            settings: Arc::new(HttpAuditSettings {
                enabled: config.enabled,
                trace_header,
                excluded_routes: config.excluded_routes.clone(),
                max_body_bytes: config.max_body_bytes,
            }),
        }
    }

    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    /// Whether a request to `path` is audited
    pub fn should_audit(&self, path: &str) -> bool {
        self.settings.enabled && !path_matches_patterns(path, &self.settings.excluded_routes)
    }

    /// Everything between context entry and context exit
    ///
    /// A handler panic is returned as `Err` so the caller can resume it once the
    /// context scope has ended.
    async fn exchange(
        &self,
        ctx: &CorrelationContext,
        request: Request,
        next: Next,
    ) -> Result<Response, Box<dyn Any + Send>> {
        let trace_id = ctx.trace_id();
        let resource = resource_descriptor(request.method(), effective_uri(&request));
        let request_headers = self.recorder.http_headers(request.headers());

        let (inbound_body, handled) =
            match capture_request(request, self.settings.max_body_bytes).await {
                Ok((request, body)) => {
                    let handled = AssertUnwindSafe(next.run(request)).catch_unwind().await;
                    (body, handled)
                }
                Err((_, err)) => {
                    tracing::warn!(
                        trace_id,
                        resource = %resource,
                        reason = %err.reason,
                        "IOLogger: failed to read request body"
                    );
                    (err.captured, Ok(StatusCode::BAD_REQUEST.into_response()))
                }
            };

        let captured = match handled {
            Ok(response) => Ok(CapturedResponse::capture(response).await),
            Err(panic) => Err(panic),
        };

        if let Ok(response) = &captured {
            tracing::debug!(
                trace_id,
                resource = %resource,
                req_len = inbound_body.len(),
                resp_len = response.body().len(),
                "IOLogger: exchange captured"
            );
        }

        self.recorder
            .record(Capture {
                trace_id,
                resource: &resource,
                direction: Direction::Inbound,
                channel: Channel::Http,
                headers: Some(request_headers),
                payload: inbound_body.to_text(),
                status_code: None,
                timestamp: ctx.started_at(),
            })
            .await;

        match captured {
            Ok(response) => {
                self.recorder
                    .record(Capture {
                        trace_id,
                        resource: &resource,
                        direction: Direction::Outbound,
                        channel: Channel::Http,
                        headers: Some(self.recorder.http_headers(response.headers())),
                        payload: response.body_text(),
                        status_code: Some(response.status().as_u16()),
                        timestamp: outbound_timestamp(ctx.started_at()),
                    })
                    .await;
                Ok(response.into_response())
            }
            Err(panic) => {
                tracing::error!(
                    trace_id,
                    resource = %resource,
                    "IOLogger: handler panicked before producing a response, outbound record omitted"
                );
                Err(panic)
            }
        }
    }
}

/// Audit middleware function
///
/// Use with `axum::middleware::from_fn_with_state`. Requests to excluded routes,
/// or every request when auditing is disabled, pass straight through.
pub async fn http_audit_middleware(
    State(auditor): State<HttpAuditor>,
    request: Request,
    next: Next,
) -> Response {
    if !auditor.should_audit(request.uri().path()) {
        if body::is_unreadable(&request) {
            return StatusCode::BAD_REQUEST.into_response();
        }
        return next.run(request).await;
    }

    let trace_id = correlation::resolve(
        request
            .headers()
            .get(&auditor.settings.trace_header)
            .and_then(|v| v.to_str().ok()),
    );
    let credential = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(Credential::new);
    let ctx = CorrelationContext::new(trace_id).with_credential(credential);

    let outcome = ctx
        .clone()
        .scope(async { auditor.exchange(&ctx, request, next).await })
        .await;

    match outcome {
        Ok(response) => response,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// `"<METHOD> <path>"`, with `"?<query>"` appended when a query string is present
pub fn resource_descriptor(method: &Method, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{} {}?{}", method, uri.path(), query),
        None => format!("{} {}", method, uri.path()),
    }
}

/// The URI as the client sent it, before any router nesting stripped a prefix
fn effective_uri(request: &Request) -> &Uri {
    request
        .extensions()
        .get::<OriginalUri>()
        .map(|original| &original.0)
        .unwrap_or_else(|| request.uri())
}

/// Check if a path matches any of the given glob patterns
///
/// Supports simple wildcard matching:
/// - `*` matches within a single pattern position
/// - trailing `/*` matches one or more further characters, `/**` any suffix
pub fn path_matches_patterns(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| path_matches_glob(path, pattern))
}

fn path_matches_glob(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }

    // Prefixes keep their trailing `/` so `/internal/*` leaves `/internals` alone
    if let Some(base) = pattern.strip_suffix("/**") {
        let prefix = &pattern[..pattern.len() - 2];
        return path == base || path.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix('*').filter(|p| p.ends_with('/')) {
        return path.starts_with(prefix) && path.len() > prefix.len();
    }

    if let Some((head, tail)) = pattern.split_once('*') {
        if !tail.contains('*') {
            return path.len() >= head.len() + tail.len()
                && path.starts_with(head)
                && path.ends_with(tail);
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{eager_body_layer, BodyLimit};
    use crate::correlation::{current_trace_id, TRACE_ID_LEN};
    use crate::error::{Error, Result};
    use crate::recorder::AuditLogEntry;
    use crate::store::{AuditStore, InMemoryAuditStore};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        routing::{get, post},
        Json, Router,
    };
    use tower::ServiceExt;

    struct FailingStore;

    #[async_trait]
    impl AuditStore for FailingStore {
        async fn save(&self, _entry: &AuditLogEntry) -> Result<i64> {
            Err(Error::Storage("database unreachable".to_string()))
        }

        async fn find_by_trace_id(&self, _trace_id: &str) -> Result<Vec<AuditLogEntry>> {
            Err(Error::Storage("database unreachable".to_string()))
        }
    }

    fn router(store: Arc<dyn AuditStore>) -> Router {
        let recorder = AuditRecorder::new(store, "account-service");
        let auditor = HttpAuditor::new(recorder, &IoLoggerConfig::default());

        Router::new()
            .route(
                "/accounts/{id}",
                get(|| async { Json(serde_json::json!({"id": 42})) }),
            )
            .route("/accounts", post(|body: String| async move { body }))
            .route(
                "/trace",
                get(|| async { current_trace_id().unwrap_or_default() }),
            )
            .route("/health", get(|| async { "ok" }))
            .route(
                "/teapot",
                get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
            )
            .layer(axum::middleware::from_fn_with_state(
                auditor,
                http_audit_middleware,
            ))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_get_with_trace_header_produces_ordered_pair() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = router(store.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/accounts/42")
                    .header("traceId", "ABC1234567")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"id":42}"#);

        let records = store.find_by_trace_id("ABC1234567").await.unwrap();
        assert_eq!(records.len(), 2);

        let (inbound, outbound) = (&records[0], &records[1]);
        assert_eq!(inbound.direction, Direction::Inbound);
        assert_eq!(inbound.resource, "GET /accounts/42");
        assert_eq!(inbound.channel, Channel::Http);
        assert!(inbound.payload.is_none());
        assert!(inbound.status_code.is_none());
        assert_eq!(inbound.source_application, "account-service");

        assert_eq!(outbound.direction, Direction::Outbound);
        assert_eq!(outbound.resource, "GET /accounts/42");
        assert_eq!(outbound.status_code, Some(200));
        assert_eq!(outbound.payload.as_deref(), Some(r#"{"id":42}"#));
        assert!(inbound.timestamp < outbound.timestamp);
    }

    #[tokio::test]
    async fn test_missing_trace_header_generates_id() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = router(store.clone());

        let response = app
            .oneshot(Request::builder().uri("/trace").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let seen_by_handler = body_string(response).await;

        assert_eq!(seen_by_handler.len(), TRACE_ID_LEN);
        let records = store.entries();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.trace_id == seen_by_handler));
    }

    #[tokio::test]
    async fn test_trace_header_is_case_insensitive() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = router(store.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/trace")
                    .header("TRACEID", "CASE000001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_string(response).await, "CASE000001");
        assert_eq!(store.find_by_trace_id("CASE000001").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_post_body_reaches_handler_and_record() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = router(store.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/accounts?branch=7")
                    .header("traceId", "POST000001")
                    .body(Body::from(r#"{"owner":"jo"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_string(response).await, r#"{"owner":"jo"}"#);

        let records = store.find_by_trace_id("POST000001").await.unwrap();
        assert_eq!(records[0].resource, "POST /accounts?branch=7");
        assert_eq!(records[0].payload.as_deref(), Some(r#"{"owner":"jo"}"#));
        assert_eq!(records[1].payload.as_deref(), Some(r#"{"owner":"jo"}"#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_recorded() {
        let store = Arc::new(InMemoryAuditStore::new());
        let response = router(store.clone())
            .oneshot(
                Request::builder()
                    .uri("/teapot")
                    .header("traceId", "TEAPOT0001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let records = store.find_by_trace_id("TEAPOT0001").await.unwrap();
        assert_eq!(records[1].status_code, Some(418));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_affect_exchange() {
        let response = router(Arc::new(FailingStore))
            .oneshot(
                Request::builder()
                    .uri("/accounts/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"id":42}"#);
    }

    #[tokio::test]
    async fn test_excluded_route_is_not_audited() {
        let store = Arc::new(InMemoryAuditStore::new());
        let response = router(store.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_context_absent_after_exchange() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = router(store.clone());

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/trace")
                    .header("traceId", "FIRST00001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(first).await, "FIRST00001");
        assert!(current_trace_id().is_none());

        let second = app
            .oneshot(Request::builder().uri("/trace").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(body_string(second).await, "FIRST00001");
    }

    #[tokio::test]
    async fn test_handler_panic_records_inbound_and_propagates() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone(), "account-service");
        let auditor = HttpAuditor::new(recorder, &IoLoggerConfig::default());
        async fn boom() -> &'static str {
            panic!("ledger unavailable")
        }

        let app = Router::new()
            .route("/boom", get(boom))
            .layer(axum::middleware::from_fn_with_state(
                auditor,
                http_audit_middleware,
            ));

        let joined = tokio::spawn(app.oneshot(
            Request::builder()
                .uri("/boom")
                .header("traceId", "PANIC00001")
                .body(Body::empty())
                .unwrap(),
        ))
        .await;

        assert!(joined.unwrap_err().is_panic());
        let records = store.find_by_trace_id("PANIC00001").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Inbound);
        assert!(current_trace_id().is_none());
    }

    fn limited_auditor(store: Arc<dyn AuditStore>, max_body_bytes: usize) -> HttpAuditor {
        let config = IoLoggerConfig {
            max_body_bytes,
            ..IoLoggerConfig::default()
        };
        HttpAuditor::new(AuditRecorder::new(store, "transfer-service"), &config)
    }

    fn post_transfer(trace_id: &str, body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/transfers")
            .header("traceId", trace_id)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_oversized_body_answers_400_and_records_pair() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = Router::new()
            .route("/transfers", post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn_with_state(
                limited_auditor(store.clone(), 4),
                http_audit_middleware,
            ));

        let response = app
            .oneshot(post_transfer("LIMIT00001", "0123456789"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let records = store.find_by_trace_id("LIMIT00001").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Inbound);
        assert!(records[0].payload.is_none());
        assert_eq!(records[1].status_code, Some(400));
    }

    #[tokio::test]
    async fn test_eager_read_survives_a_draining_layer() {
        async fn drain(request: Request, next: Next) -> Response {
            let (parts, body) = request.into_parts();
            let _ = axum::body::to_bytes(body, usize::MAX).await;
            next.run(Request::from_parts(parts, Body::empty())).await
        }

        let store = Arc::new(InMemoryAuditStore::new());
        let app = Router::new()
            .route("/transfers", post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn_with_state(
                limited_auditor(store.clone(), 1024),
                http_audit_middleware,
            ))
            .layer(axum::middleware::from_fn(drain))
            .layer(axum::middleware::from_fn_with_state(
                BodyLimit(1024),
                eager_body_layer,
            ));

        let response = app
            .oneshot(post_transfer("EAGER00001", r#"{"amount":100.10}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"amount":100.10}"#);

        let records = store.find_by_trace_id("EAGER00001").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload.as_deref(), Some(r#"{"amount":100.10}"#));
        assert_eq!(records[1].payload.as_deref(), Some(r#"{"amount":100.10}"#));
    }

    #[tokio::test]
    async fn test_eager_read_enforces_its_limit() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = Router::new()
            .route("/transfers", post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn_with_state(
                limited_auditor(store.clone(), 1024),
                http_audit_middleware,
            ))
            .layer(axum::middleware::from_fn_with_state(
                BodyLimit(4),
                eager_body_layer,
            ));

        let response = app
            .oneshot(post_transfer("EAGER00002", "0123456789"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let records = store.find_by_trace_id("EAGER00002").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].payload.is_none());
        assert_eq!(records[1].status_code, Some(400));
    }

    #[tokio::test]
    async fn test_eager_read_failure_on_excluded_route() {
        let store = Arc::new(InMemoryAuditStore::new());
        let config = IoLoggerConfig {
            excluded_routes: vec!["/transfers".to_string()],
            ..IoLoggerConfig::default()
        };
        let auditor = HttpAuditor::new(AuditRecorder::new(store.clone(), "svc"), &config);
        let app = Router::new()
            .route("/transfers", post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn_with_state(
                auditor,
                http_audit_middleware,
            ))
            .layer(axum::middleware::from_fn_with_state(
                BodyLimit(4),
                eager_body_layer,
            ));

        let response = app
            .oneshot(post_transfer("EAGER00003", "0123456789"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_reaches_client_and_is_recorded() {
        let store = Arc::new(InMemoryAuditStore::new());
        let app = Router::new()
            .route(
                "/balances/stream",
                get(|| async {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        "data: 42\n\n",
                    )
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                limited_auditor(store.clone(), 1024),
                http_audit_middleware,
            ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/balances/stream")
                    .header("traceId", "STREAM0001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "data: 42\n\n");

        let records = store.find_by_trace_id("STREAM0001").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status_code, Some(200));
        assert!(records[1].payload.is_none());
    }

    #[test]
    fn test_resource_descriptor() {
        let uri: Uri = "/accounts/42".parse().unwrap();
        assert_eq!(resource_descriptor(&Method::GET, &uri), "GET /accounts/42");

        let uri: Uri = "/accounts?page=2&size=10".parse().unwrap();
        assert_eq!(
            resource_descriptor(&Method::GET, &uri),
            "GET /accounts?page=2&size=10"
        );
    }

    #[test]
    fn test_path_matches_patterns() {
        let patterns = vec![
            "/health".to_string(),
            "/internal/*".to_string(),
            "/static/**".to_string(),
            "/accounts/*/statements".to_string(),
        ];

        assert!(path_matches_patterns("/health", &patterns));
        assert!(path_matches_patterns("/internal/metrics", &patterns));
        assert!(!path_matches_patterns("/internal", &patterns));
        assert!(path_matches_patterns("/static", &patterns));
        assert!(path_matches_patterns("/static/css/app.css", &patterns));
        assert!(path_matches_patterns("/accounts/42/statements", &patterns));
        assert!(!path_matches_patterns("/accounts/42", &patterns));
    }

    #[test]
    fn test_prefix_patterns_stop_at_segment_boundary() {
        let patterns = vec!["/internal/*".to_string(), "/static/**".to_string()];

        assert!(!path_matches_patterns("/internals", &patterns));
        assert!(!path_matches_patterns("/internal-admin", &patterns));
        assert!(!path_matches_patterns("/statics", &patterns));
        assert!(!path_matches_patterns("/static-files/app.css", &patterns));
        assert!(path_matches_patterns("/internal/x", &patterns));
        assert!(path_matches_patterns("/static/", &patterns));
    }
}
