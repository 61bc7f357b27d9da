//! Replayable request bodies and buffered responses
//!
//! An HTTP body is a stream that can be drained exactly once. The audit layer
//! needs the same bytes the handler sees, so the request body is read once into a
//! [`CapturedBody`] and the request is rebuilt from that buffer. On the way out the
//! handler's response is split and buffered into a [`CapturedResponse`], inspected,
//! and rebuilt by [`CapturedResponse::into_response`], which consumes it.
//! Server-sent event streams are the exception: they are forwarded unbuffered and
//! recorded without a payload.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, response::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

/// Request body read once and cached
///
/// Cloning is cheap and every accessor returns the same bytes, however many
/// times it is called. Installed in the request extensions by [`capture_request`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBody(Bytes);

impl CapturedBody {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Cached content
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cached content as a shared buffer
    pub fn bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Body decoded as UTF-8 (lossy), or `None` when there is no body
    pub fn to_text(&self) -> Option<String> {
        body_text(&self.0)
    }

    /// A fresh body stream over the cached bytes
    pub fn replay(&self) -> Body {
        Body::from(self.0.clone())
    }
}

/// Reading the request body failed before the handler could run
#[derive(Debug)]
pub struct BodyReadError {
    /// Bytes received before the failure (usually empty)
    pub captured: CapturedBody,
    pub reason: String,
}

/// Largest request body, in bytes, that [`eager_body_layer`] will buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimit(pub usize);

/// Left in the extensions by [`eager_body_layer`] when the body could not be read
#[derive(Debug, Clone)]
struct UnreadableBody(String);

/// Whether an earlier [`eager_body_layer`] failed to read this request's body
pub(crate) fn is_unreadable(request: &Request) -> bool {
    request.extensions().get::<UnreadableBody>().is_some()
}

/// Read the request body once and hand back a request that replays it
///
/// If an earlier layer already captured the body, its buffer is reused rather than
/// draining a stream that may already be exhausted. A read that already failed in
/// that layer is reported again here.
pub async fn capture_request(
    request: Request,
    limit: usize,
) -> Result<(Request, CapturedBody), (Request, BodyReadError)> {
    if let Some(UnreadableBody(reason)) = request.extensions().get::<UnreadableBody>().cloned() {
        return Err((
            request,
            BodyReadError {
                captured: CapturedBody::default(),
                reason,
            },
        ));
    }

    if let Some(captured) = request.extensions().get::<CapturedBody>().cloned() {
        let (parts, _) = request.into_parts();
        return Ok((
            Request::from_parts(parts, captured.replay()),
            captured,
        ));
    }

    let (mut parts, body) = request.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => {
            let captured = CapturedBody::new(bytes);
            parts.extensions.insert(captured.clone());
            Ok((Request::from_parts(parts, captured.replay()), captured))
        }
        Err(err) => {
            let captured = CapturedBody::default();
            parts.extensions.insert(captured.clone());
            Err((
                Request::from_parts(parts, Body::empty()),
                BodyReadError {
                    captured,
                    reason: err.to_string(),
                },
            ))
        }
    }
}

/// Response produced by the handler, with its body buffered for inspection
///
/// Must be released with [`into_response`](Self::into_response), which forwards
/// the buffered bytes to the caller. It consumes the value, so the body is
/// forwarded exactly once.
#[derive(Debug)]
pub struct CapturedResponse {
    parts: Parts,
    body: Bytes,
    /// Unbuffered body of an event stream
    stream: Option<Body>,
}

impl CapturedResponse {
    /// Buffer the body of `response`
    ///
    /// A body stream that fails mid-way is replaced by an empty body; the head is
    /// kept so the caller still receives the handler's status and headers.
    /// `text/event-stream` bodies never end, so they are kept as a stream and
    /// only the head is inspected.
    pub async fn capture(response: Response) -> Self {
        let (parts, body) = response.into_parts();
        if is_event_stream(&parts.headers) {
            tracing::debug!("IOLogger: event stream forwarded without buffering");
            return Self {
                parts,
                body: Bytes::new(),
                stream: Some(body),
            };
        }

        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "IOLogger: failed to buffer response body");
                Bytes::new()
            }
        };
        Self {
            parts,
            body,
            stream: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Whether the body was left unbuffered
    pub fn is_streamed(&self) -> bool {
        self.stream.is_some()
    }

    /// Buffered body bytes, empty for an event stream
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8 (lossy), or `None` when there is no body
    pub fn body_text(&self) -> Option<String> {
        body_text(&self.body)
    }

    /// Forward the buffered response to the caller
    pub fn into_response(self) -> Response {
        let body = match self.stream {
            Some(stream) => stream,
            None => Body::from(self.body),
        };
        Response::from_parts(self.parts, body)
    }
}

/// Middleware that reads the request body eagerly, ahead of the rest of the chain
///
/// Use with `axum::middleware::from_fn_with_state` and a [`BodyLimit`], outside
/// the audit layer, when some layer in between consumes the body itself; the audit
/// layer then reuses the cached buffer. A body over the limit, or one that fails
/// to arrive, is not answered here: the audit layer answers it with 400 and still
/// records the exchange.
pub async fn eager_body_layer(
    State(limit): State<BodyLimit>,
    request: Request,
    next: Next,
) -> Response {
    match capture_request(request, limit.0).await {
        Ok((request, _)) => next.run(request).await,
        Err((mut request, err)) => {
            tracing::warn!(reason = %err.reason, "IOLogger: failed to read request body");
            request.extensions_mut().insert(UnreadableBody(err.reason));
            next.run(request).await
        }
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

pub(crate) fn body_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}
