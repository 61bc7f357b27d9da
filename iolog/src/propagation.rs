//! Trace propagation for downstream HTTP calls
//!
//! Business handlers calling other services keep the trace by building requests
//! with [`PropagateTrace::propagate_trace`]:
//!
//! ```rust,no_run
//! use iolog::propagation::PropagateTrace;
//!
//! # async fn fetch(client: reqwest::Client) -> reqwest::Result<reqwest::Response> {
//! client
//!     .get("http://ledger-service/balances/42")
//!     .propagate_trace()
//!     .send()
//!     .await
//! # }
//! ```

use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;

use crate::correlation::{CorrelationContext, TRACE_ID_HEADER};

/// Attach the active trace id and caller credential to an outgoing request
pub trait PropagateTrace {
    /// Adds `traceId` and, when the inbound exchange carried one, `Authorization`
    ///
    /// Outside a correlation scope the request is returned unchanged.
    fn propagate_trace(self) -> Self;
}

impl PropagateTrace for RequestBuilder {
    fn propagate_trace(self) -> Self {
        let Some(ctx) = CorrelationContext::current() else {
            return self;
        };

        let builder = self.header(TRACE_ID_HEADER, ctx.trace_id());
        match ctx.credential() {
            Some(credential) => builder.header(AUTHORIZATION, credential.expose()),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::Credential;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[test]
    fn test_headers_attached_inside_scope() {
        let ctx = CorrelationContext::new("ABC1234567")
            .with_credential(Some(Credential::new("Bearer token-1")));

        let request = ctx
            .sync_scope(|| {
                client()
                    .get("http://ledger.local/balances/42")
                    .propagate_trace()
                    .build()
            })
            .unwrap();

        assert_eq!(request.headers()["traceid"], "ABC1234567");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer token-1");
    }

    #[test]
    fn test_no_credential_no_authorization() {
        let request = CorrelationContext::new("ABC1234567")
            .sync_scope(|| {
                client()
                    .post("http://ledger.local/transfers")
                    .propagate_trace()
                    .build()
            })
            .unwrap();

        assert!(request.headers().contains_key("traceid"));
        assert!(!request.headers().contains_key(AUTHORIZATION));
    }

    #[test]
    fn test_outside_scope_is_unchanged() {
        let request = client()
            .get("http://ledger.local/balances/42")
            .propagate_trace()
            .build()
            .unwrap();

        assert!(request.headers().is_empty());
    }

    #[tokio::test]
    async fn test_async_scope_propagates() {
        let request = CorrelationContext::new("ASYNC00001")
            .scope(async {
                client()
                    .get("http://ledger.local/balances/7")
                    .propagate_trace()
                    .build()
            })
            .await
            .unwrap();

        assert_eq!(request.headers()["traceid"], "ASYNC00001");
    }
}
