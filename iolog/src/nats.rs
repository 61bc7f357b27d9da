//! NATS binding for the message boundary
//!
//! Exchanges and routing keys map onto subjects: a publish to `orders.x` with
//! routing key `created` goes to subject `orders.x.created`, and a publish with an
//! empty routing key goes to `orders.x`. Message headers travel as NATS headers.

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::NatsConfig;
use crate::error::{Error, Result};
use crate::message::{AuditedConsumer, Delivery, MessageHandler, MessagePublisher, OutboundMessage};

/// Connect to NATS, retrying with exponential backoff
pub async fn connect(config: &NatsConfig) -> Result<Client> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_connect(config).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(
                        "NATS connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!("NATS client connected to {}", config.url);
                }
                return Ok(client);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to NATS after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "NATS connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_connect(config: &NatsConfig) -> Result<Client> {
    let mut opts = async_nats::ConnectOptions::new();

    if let Some(name) = &config.name {
        opts = opts.name(name);
    }

    opts.max_reconnects(Some(config.max_reconnects))
        .connect(&config.url)
        .await
        .map_err(|e| {
            Error::Nats(format!(
                "Failed to connect to NATS server at '{}' (client name: {}): {}",
                config.url,
                config.name.as_deref().unwrap_or("<none>"),
                e
            ))
        })
}

/// Subject a publish to `exchange` with `routing_key` is sent on
pub fn subject_for(exchange: &str, routing_key: &str) -> String {
    if routing_key.is_empty() {
        exchange.to_string()
    } else {
        format!("{}.{}", exchange, routing_key)
    }
}

/// [`MessagePublisher`] sending through a NATS client
#[derive(Clone)]
pub struct NatsPublisher {
    client: Client,
}

impl NatsPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl MessagePublisher for NatsPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let subject = subject_for(exchange, routing_key);
        self.client
            .publish_with_headers(
                subject.clone(),
                to_nats_headers(&message.headers),
                message.payload,
            )
            .await
            .map_err(|e| Error::Nats(format!("Failed to publish to {}: {}", subject, e)))
    }
}

/// Feed every message on `subject` through `consumer` until the subscription ends
///
/// With a queue group, deliveries are load-balanced across members and the group
/// name is reported as the queue; otherwise the subject is. Handler errors are
/// logged and the loop moves on to the next message.
pub async fn consume<H>(
    client: &Client,
    subject: &str,
    queue_group: Option<&str>,
    consumer: &AuditedConsumer<H>,
) -> Result<()>
where
    H: MessageHandler,
    H::Error: std::fmt::Display,
{
    let mut subscriber = match queue_group {
        Some(group) => client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await,
        None => client.subscribe(subject.to_string()).await,
    }
    .map_err(|e| Error::Nats(format!("Failed to subscribe to {}: {}", subject, e)))?;

    let queue = queue_group.unwrap_or(subject);
    tracing::info!(subject = %subject, queue = %queue, "IOLogger: consuming");

    while let Some(message) = subscriber.next().await {
        let delivery = to_delivery(queue, message.headers.as_ref(), message.payload);
        if let Err(e) = consumer.handle(delivery).await {
            tracing::warn!(queue = %queue, error = %e, "Message handler failed");
        }
    }

    tracing::info!(subject = %subject, "IOLogger: subscription closed");
    Ok(())
}

fn to_nats_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

/// Repeated header values are joined with `", "`
fn to_delivery(queue: &str, headers: Option<&HeaderMap>, payload: Bytes) -> Delivery {
    let headers: BTreeMap<String, String> = headers
        .map(|map| {
            map.iter()
                .map(|(name, values)| {
                    let joined = values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    (name.to_string(), joined)
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        queue: queue.to_string(),
        headers,
        payload,
    }
}
