//! Trace id generation and the per-invocation correlation context
//!
//! Every boundary invocation (one HTTP exchange, one message delivery) runs
//! inside a [`CorrelationContext`] scope. The context lives in a tokio task-local,
//! so concurrent invocations never observe each other's trace ids and a reused
//! worker starts every invocation with no context at all.

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use uuid::Uuid;

/// Header carrying the trace id across service and broker boundaries
pub const TRACE_ID_HEADER: &str = "traceId";

/// Length of generated trace ids
pub const TRACE_ID_LEN: usize = 10;

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// Generate a new trace id
///
/// Ten upper-case alphanumeric characters taken from a random UUIDv4.
///
/// Example: `3F9A0C11BE`
pub fn generate() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(TRACE_ID_LEN);
    id.make_ascii_uppercase();
    id
}

/// Return `candidate` when it is non-empty, otherwise a freshly generated id
///
/// Externally supplied ids are accepted verbatim.
pub fn resolve(candidate: Option<&str>) -> String {
    match candidate {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate(),
    }
}

/// Identity credential of the current invocation, forwarded to downstream calls
///
/// Holds the raw `Authorization` header value. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw header value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Ambient state of one boundary invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    trace_id: String,
    started_at: DateTime<Utc>,
    credential: Option<Credential>,
}

impl CorrelationContext {
    /// Create a context for an invocation starting now
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self::starting_at(trace_id, Utc::now())
    }

    /// Create a context with an explicit start timestamp
    pub fn starting_at(trace_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            trace_id: trace_id.into(),
            started_at,
            credential: None,
        }
    }

    /// Attach the invocation's identity credential
    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// The context of the running invocation, or `None` outside any boundary
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Run `fut` with this context active
    ///
    /// The context is removed when the future completes, is dropped, or unwinds.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }

    /// Run blocking code with this context active
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT.sync_scope(self, f)
    }
}

/// Trace id of the running invocation, if any
pub fn current_trace_id() -> Option<String> {
    CURRENT.try_with(|ctx| ctx.trace_id.clone()).ok()
}
