//! Audit record assembly and best-effort persistence
//!
//! [`AuditRecorder`] turns captured exchange fields into [`AuditLogEntry`] values and
//! hands them to an [`AuditStore`]. Nothing here ever fails the caller: rendering
//! falls back to placeholder text and store failures are logged and dropped.

use chrono::{DateTime, Duration, Utc};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{btree_map::Entry, BTreeMap};
use std::fmt;
use std::sync::Arc;

use crate::store::AuditStore;

/// Milliseconds added to an exchange's start time to stamp its OUTBOUND record
///
/// Pairs stay ordered under a timestamp sort even when their writes interleave.
pub const OUTBOUND_TIMESTAMP_STEP_MS: i64 = 1;

/// Headers whose values are replaced before storage when masking is enabled
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

const REDACTED: &str = "[REDACTED]";
const EMPTY_OBJECT: &str = "{}";

/// Side of the exchange a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "INBOUND",
            Self::Outbound => "OUTBOUND",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport family of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Http,
    Message,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Message => "MESSAGE",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record: one direction of one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Assigned by the store on save
    pub id: Option<i64>,
    pub trace_id: String,
    pub source_application: String,
    /// Canonical descriptor of what was exchanged, e.g. `GET /accounts/42`
    pub resource: String,
    pub direction: Direction,
    pub channel: Channel,
    /// Serialized header map
    pub headers: Option<String>,
    /// Body as text; `None` when there was no body
    pub payload: Option<String>,
    /// HTTP status, HTTP channel only
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

/// Captured fields of one side of an exchange, before assembly
#[derive(Debug, Clone)]
pub struct Capture<'a> {
    pub trace_id: &'a str,
    pub resource: &'a str,
    pub direction: Direction,
    pub channel: Channel,
    pub headers: Option<String>,
    pub payload: Option<String>,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

/// Builds and persists audit records for one service instance
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    source_application: String,
    mask_sensitive_headers: bool,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, source_application: impl Into<String>) -> Self {
        Self {
            store,
            source_application: source_application.into(),
            mask_sensitive_headers: true,
        }
    }

    /// Store header values verbatim instead of redacting credentials
    pub fn with_header_masking(mut self, enabled: bool) -> Self {
        self.mask_sensitive_headers = enabled;
        self
    }

    pub fn source_application(&self) -> &str {
        &self.source_application
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Assemble a record from captured fields
    pub fn build_record(&self, capture: Capture<'_>) -> AuditLogEntry {
        AuditLogEntry {
            id: None,
            trace_id: capture.trace_id.to_string(),
            source_application: self.source_application.clone(),
            resource: capture.resource.to_string(),
            direction: capture.direction,
            channel: capture.channel,
            headers: capture.headers,
            payload: capture.payload,
            status_code: capture.status_code,
            timestamp: capture.timestamp,
        }
    }

    /// Save a record, logging and dropping it on failure
    ///
    /// Returns the store-assigned id when the save succeeded.
    pub async fn persist(&self, entry: AuditLogEntry) -> Option<i64> {
        match self.store.save(&entry).await {
            Ok(id) => {
                tracing::debug!(
                    trace_id = %entry.trace_id,
                    resource = %entry.resource,
                    direction = %entry.direction,
                    id,
                    "IOLogger: audit record saved"
                );
                Some(id)
            }
            Err(e) => {
                tracing::error!(
                    trace_id = %entry.trace_id,
                    resource = %entry.resource,
                    direction = %entry.direction,
                    channel = %entry.channel,
                    error = %e,
                    "IOLogger: failed to persist audit record, dropping it"
                );
                None
            }
        }
    }

    /// Build and persist in one step
    pub async fn record(&self, capture: Capture<'_>) -> Option<i64> {
        let entry = self.build_record(capture);
        self.persist(entry).await
    }

    /// Serialize an HTTP header map
    pub fn http_headers(&self, headers: &HeaderMap) -> String {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match map.entry(name.as_str().to_string()) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
        self.string_headers(map)
    }

    /// Serialize a string header map such as broker message headers
    ///
    /// Names are lower-cased; of two names differing only in case the later wins.
    pub fn string_headers<I, K, V>(&self, headers: I) -> String
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map: BTreeMap<String, String> = headers
            .into_iter()
            .map(|(name, value)| {
                let name = name.as_ref();
                let value = if self.mask_sensitive_headers && is_sensitive(name) {
                    REDACTED
                } else {
                    value.as_ref()
                };
                (name.to_ascii_lowercase(), value.to_string())
            })
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "IOLogger: could not serialize headers");
            EMPTY_OBJECT.to_string()
        })
    }
}

/// Timestamp of the OUTBOUND record of an exchange that started at `started_at`
pub fn outbound_timestamp(started_at: DateTime<Utc>) -> DateTime<Utc> {
    started_at + Duration::milliseconds(OUTBOUND_TIMESTAMP_STEP_MS)
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
}

/// Render a message payload for storage
///
/// JSON payloads are pretty-printed with field order and number literals kept as
/// received; anything else is kept as decoded text.
/// Empty payloads yield `None`.
pub fn pretty_payload(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let raw = String::from_utf8_lossy(bytes);
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => Some(serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string())),
        Err(_) => Some(raw.into_owned()),
    }
}
