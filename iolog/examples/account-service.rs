//! Example: Auditing an account service
//!
//! Every request to `/accounts` is recorded as an INBOUND/OUTBOUND pair. Opening
//! an account also publishes an `accounts.events` message through an audited
//! publisher, so its OUTBOUND message record carries the same trace id as the HTTP
//! exchange. `/audit/{trace_id}` returns the records of one trace.
//!
//! Run with: cargo run --example account-service
//!
//! ```bash
//! curl -H 'traceId: DEMO000001' -d '{"owner":"ada"}' \
//!     -H 'content-type: application/json' localhost:8080/accounts
//! curl localhost:8080/audit/DEMO000001
//! ```

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use iolog::prelude::*;
use serde::Deserialize;
use std::sync::Arc;

/// Stand-in for a broker connection
struct LoggingPublisher;

#[async_trait]
impl MessagePublisher for LoggingPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        tracing::info!(
            exchange,
            routing_key,
            bytes = message.payload.len(),
            "message sent"
        );
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    iolog: IoLogger,
    publisher: Arc<AuditedPublisher<LoggingPublisher>>,
}

#[derive(Deserialize)]
struct OpenAccount {
    owner: String,
}

async fn open_account(
    State(state): State<AppState>,
    Json(body): Json<OpenAccount>,
) -> Json<serde_json::Value> {
    let event = serde_json::json!({ "event": "opened", "owner": body.owner });
    match OutboundMessage::json(&event) {
        Ok(message) => {
            if let Err(e) = state
                .publisher
                .publish("accounts.events", "opened", message)
                .await
            {
                tracing::warn!(error = %e, "could not publish account event");
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not encode account event"),
    }

    Json(serde_json::json!({
        "id": 42,
        "owner": body.owner,
        "traceId": current_trace_id(),
    }))
}

async fn audit_trail(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Json<Vec<AuditLogEntry>> {
    let records = state
        .iolog
        .store()
        .find_by_trace_id(&trace_id)
        .await
        .unwrap_or_default();
    Json(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load_for_service("account-service")?;
    config.service.name = "account-service".to_string();
    config.iologger.excluded_routes.push("/audit/*".to_string());

    init_tracing(&config)?;

    let iolog = IoLogger::connect(&config).await?;
    let state = AppState {
        publisher: Arc::new(iolog.publisher(LoggingPublisher)),
        iolog: iolog.clone(),
    };

    let app = iolog.layer_router(
        Router::new()
            .route("/accounts", post(open_account))
            .route("/audit/{trace_id}", get(audit_trail))
            .with_state(state),
    );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    shutdown_tracing();
    Ok(())
}
