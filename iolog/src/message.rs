//! Message boundary interceptors
//!
//! The broker is reached through two narrow seams: [`MessagePublisher`] for
//! outbound sends and [`MessageHandler`] for deliveries. [`AuditedPublisher`] and
//! [`AuditedConsumer`] wrap any implementation of those traits and add the audit
//! record and trace id handling around each call.

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;

use crate::correlation::{self, CorrelationContext, TRACE_ID_HEADER};
use crate::error::Result;
use crate::recorder::{pretty_payload, AuditRecorder, Capture, Channel, Direction};

/// Message handed to a publisher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// JSON-encode `value` as the payload
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload).with_header("content-type", "application/json"))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Value of the trace header, matched case-insensitively
    pub fn trace_id(&self) -> Option<&str> {
        header_value(&self.headers, TRACE_ID_HEADER)
    }
}

/// Message received from a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Name of the queue (or subscription) the message arrived on
    pub queue: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            queue: queue.into(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Value of the trace header, matched case-insensitively
    pub fn trace_id(&self) -> Option<&str> {
        header_value(&self.headers, TRACE_ID_HEADER)
    }
}

/// Outbound seam: send a message to an exchange with a routing key
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()>;

    /// Broadcast-style send with an empty routing key
    async fn publish_event(&self, exchange: &str, message: OutboundMessage) -> Result<()> {
        self.publish(exchange, "", message).await
    }
}

/// Inbound seam: process one delivered message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: Send;

    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), Self::Error>;
}

/// `"Exchange: <exchange> : RoutingKey: <routingKey>"`
pub fn publish_resource(exchange: &str, routing_key: &str) -> String {
    format!("Exchange: {} : RoutingKey: {}", exchange, routing_key)
}

/// `"Queue: <queueName>"`
pub fn consume_resource(queue: &str) -> String {
    format!("Queue: {}", queue)
}

/// Publisher that audits every send before it is issued
///
/// The trace id is taken from the active [`CorrelationContext`], then from a
/// `traceId` header already on the message, and generated otherwise. It is written
/// into the message headers, the OUTBOUND record is persisted, and only then does
/// the inner publisher run.
pub struct AuditedPublisher<P> {
    inner: P,
    recorder: AuditRecorder,
}

impl<P> AuditedPublisher<P> {
    pub fn new(inner: P, recorder: AuditRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: MessagePublisher> MessagePublisher for AuditedPublisher<P> {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut message: OutboundMessage,
    ) -> Result<()> {
        let trace_id = correlation::current_trace_id()
            .or_else(|| message.trace_id().filter(|id| !id.is_empty()).map(String::from))
            .unwrap_or_else(correlation::generate);

        message
            .headers
            .retain(|name, _| !name.eq_ignore_ascii_case(TRACE_ID_HEADER));
        message
            .headers
            .insert(TRACE_ID_HEADER.to_string(), trace_id.clone());

        let resource = publish_resource(exchange, routing_key);
        self.recorder
            .record(Capture {
                trace_id: &trace_id,
                resource: &resource,
                direction: Direction::Outbound,
                channel: Channel::Message,
                headers: Some(self.recorder.string_headers(&message.headers)),
                payload: crate::body::body_text(&message.payload),
                status_code: None,
                timestamp: Utc::now(),
            })
            .await;

        let result = self.inner.publish(exchange, routing_key, message).await;
        if let Err(e) = &result {
            tracing::warn!(
                trace_id = %trace_id,
                resource = %resource,
                error = %e,
                "IOLogger: publish failed after the outbound record was written"
            );
        }
        result
    }
}

/// Handler wrapper that audits every delivery and scopes the handler in its trace
pub struct AuditedConsumer<H> {
    inner: H,
    recorder: AuditRecorder,
}

impl<H> AuditedConsumer<H> {
    pub fn new(inner: H, recorder: AuditRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for AuditedConsumer<H> {
    type Error = H::Error;

    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), Self::Error> {
        let trace_id = correlation::resolve(delivery.trace_id());
        let resource = consume_resource(&delivery.queue);
        let ctx = CorrelationContext::new(trace_id);

        self.recorder
            .record(Capture {
                trace_id: ctx.trace_id(),
                resource: &resource,
                direction: Direction::Inbound,
                channel: Channel::Message,
                headers: Some(self.recorder.string_headers(&delivery.headers)),
                payload: pretty_payload(&delivery.payload),
                status_code: None,
                timestamp: ctx.started_at(),
            })
            .await;

        ctx.scope(self.inner.handle(delivery)).await
    }
}

fn header_value<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
