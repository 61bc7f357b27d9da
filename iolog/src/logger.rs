//! Composition root for the audit interceptors
//!
//! An [`IoLogger`] is built once at startup. It owns the [`AuditRecorder`] and
//! hands out the boundary interceptors: the HTTP layers applied to a router, and
//! the audited wrappers around a broker publisher or a message handler.

use axum::Router;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;

use crate::body::{eager_body_layer, BodyLimit};
use crate::config::{Config, IoLoggerConfig};
use crate::error::Result;
use crate::http::{http_audit_middleware, HttpAuditor};
use crate::message::{AuditedConsumer, AuditedPublisher};
use crate::recorder::AuditRecorder;
use crate::store::{AuditStore, InMemoryAuditStore};

/// Audit trail entry point for one service
#[derive(Clone)]
pub struct IoLogger {
    config: Arc<IoLoggerConfig>,
    recorder: AuditRecorder,
}

impl IoLogger {
    /// Build around an existing store
    pub fn new(config: &Config, store: Arc<dyn AuditStore>) -> Self {
        let recorder = AuditRecorder::new(store, config.source_application())
            .with_header_masking(config.iologger.mask_sensitive_headers);

        Self {
            config: Arc::new(config.iologger.clone()),
            recorder,
        }
    }

    /// Build with an in-memory store sized by `iologger.memory_capacity`
    pub fn in_memory(config: &Config) -> Self {
        let store = InMemoryAuditStore::with_capacity(config.iologger.memory_capacity);
        Self::new(config, Arc::new(store))
    }

    /// Build with the store selected by configuration
    ///
    /// A `[database]` section selects PostgreSQL when the `database` feature is
    /// enabled; otherwise records stay in memory.
    pub async fn connect(config: &Config) -> Result<Self> {
        #[cfg(feature = "database")]
        if let Some(db_config) = &config.database {
            let store = crate::store::pg::PgAuditStore::connect(db_config).await?;
            tracing::info!(
                service = %config.source_application(),
                "IOLogger: recording to PostgreSQL"
            );
            return Ok(Self::new(config, Arc::new(store)));
        }

        if config.database.is_some() {
            tracing::warn!(
                "IOLogger: [database] is configured but the `database` feature is disabled; recording in memory"
            );
        } else {
            tracing::info!(
                service = %config.source_application(),
                "IOLogger: recording in memory"
            );
        }
        Ok(Self::in_memory(config))
    }

    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        self.recorder.store()
    }

    pub fn config(&self) -> &IoLoggerConfig {
        &self.config
    }

    /// State for [`http_audit_middleware`]
    pub fn http_auditor(&self) -> HttpAuditor {
        HttpAuditor::new(self.recorder.clone(), &self.config)
    }

    /// Wrap a router in the audit layer
    ///
    /// Layers are applied in reverse order (bottom layer is innermost/first):
    /// the audit layer sees every exchange, and with `catch_panic` on a handler
    /// panic reaches it as a 500 response that is recorded like any other. With
    /// `eager_body` on, the request body is read outermost, capped at
    /// `max_body_bytes`, and reused by the audit layer.
    /// Disabled auditing returns the router untouched.
    pub fn layer_router<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if !self.config.enabled {
            tracing::info!("IOLogger: HTTP auditing disabled");
            return router;
        }

        let router = if self.config.catch_panic {
            router.layer(CatchPanicLayer::new())
        } else {
            router
        };

        let router = router.layer(axum::middleware::from_fn_with_state(
            self.http_auditor(),
            http_audit_middleware,
        ));

        if self.config.eager_body {
            router.layer(axum::middleware::from_fn_with_state(
                BodyLimit(self.config.max_body_bytes),
                eager_body_layer,
            ))
        } else {
            router
        }
    }

    /// Audit every send made through `inner`
    pub fn publisher<P>(&self, inner: P) -> AuditedPublisher<P> {
        AuditedPublisher::new(inner, self.recorder.clone())
    }

    /// Audit every delivery handled by `inner`
    pub fn consumer<H>(&self, inner: H) -> AuditedConsumer<H> {
        AuditedConsumer::new(inner, self.recorder.clone())
    }
}
