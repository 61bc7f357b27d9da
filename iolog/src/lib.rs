//! # iolog
//!
//! I/O audit trail for banking microservices. Every exchange crossing a service
//! boundary, over HTTP or through the message broker, is written to an audit store
//! as an INBOUND and an OUTBOUND record sharing one trace id.
//!
//! ## Features
//!
//! - **Trace correlation**: `traceId` header extracted or generated, scoped to the
//!   task handling the exchange and cleared when it ends
//! - **HTTP boundary**: axum middleware capturing request and response bodies
//!   without disturbing what the handler or the caller sees
//! - **Message boundary**: audited publisher and consumer wrappers
//! - **Storage**: in-memory store, PostgreSQL via sqlx (`database` feature)
//! - **Broker binding**: NATS publisher and consumer loop (`events` feature)
//! - **Downstream propagation**: `traceId` and credential forwarded on reqwest calls
//!
//! ## Example
//!
//! ```rust,no_run
//! use iolog::prelude::*;
//! use axum::{routing::get, Router};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load_for_service("account-service")?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Build the audit trail
//!     let iolog = IoLogger::connect(&config).await?;
//!
//!     // Wrap the router
//!     let app = iolog.layer_router(
//!         Router::new().route("/accounts/{id}", get(|| async { "{\"id\":42}" })),
//!     );
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http;
pub mod logger;
pub mod message;
pub mod observability;
pub mod propagation;
pub mod recorder;
pub mod store;

#[cfg(feature = "events")]
pub mod nats;

pub use logger::IoLogger;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::body::{eager_body_layer, BodyLimit, CapturedBody, CapturedResponse};
    pub use crate::config::{Config, IoLoggerConfig};
    pub use crate::correlation::{current_trace_id, CorrelationContext, Credential, TRACE_ID_HEADER};
    pub use crate::error::{Error, Result};
    pub use crate::http::{http_audit_middleware, HttpAuditor};
    pub use crate::logger::IoLogger;
    pub use crate::message::{
        AuditedConsumer, AuditedPublisher, Delivery, MessageHandler, MessagePublisher,
        OutboundMessage,
    };
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::propagation::PropagateTrace;
    pub use crate::recorder::{AuditLogEntry, AuditRecorder, Channel, Direction};
    pub use crate::store::{AuditStore, InMemoryAuditStore};

    #[cfg(feature = "database")]
    pub use crate::store::pg::PgAuditStore;

    #[cfg(feature = "events")]
    pub use crate::nats::{consume, NatsPublisher};
}
