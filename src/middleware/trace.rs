//! Request tracing stage.
//!
//! Gives every request exactly one id before any consumer code runs:
//!
//! 1. An id already on the [`Request`] is kept as is.
//! 2. Otherwise a non-empty `x-request-id` header, set by an upstream
//!    proxy, is adopted.
//! 3. Otherwise a random UUID v4 is generated.
//!
//! The id is echoed back in the `x-request-id` response header, and the
//! rest of the chain runs inside a `request` span that carries it.

use http::header::{HeaderName, HeaderValue};
use tracing::Instrument;
use uuid::Uuid;

use super::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;

/// The header used to propagate request ids.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest incoming id that will be trusted.
const MAX_INCOMING_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestTracer;

impl RequestTracer {
    /// Makes sure `req` carries an id and returns it.
    pub fn assign(req: &mut Request) -> String {
        if let Some(id) = req.id() {
            return id.to_owned();
        }
        let id = req
            .header(REQUEST_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_INCOMING_LEN)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        req.set_id(id.clone());
        id
    }
}

impl Middleware for RequestTracer {
    fn name(&self) -> &'static str { "request_tracer" }

    fn handle<'a>(&'a self, mut req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        let id = Self::assign(&mut req);
        let span = tracing::info_span!("request", id = %id, method = %req.method, path = req.path());

        Box::pin(
            async move {
                let flow = next.run(req).await;
                match HeaderValue::from_str(&id) {
                    Ok(value) => flow.with_header(HeaderName::from_static(REQUEST_ID_HEADER), value),
                    Err(_) => flow,
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::BoxedMiddleware;
    use crate::middleware::testing::*;
    use crate::response::Response;
    use std::sync::Arc;

    fn echo_id() -> BoxedMiddleware {
        Arc::new(Terminal(|req: Request| {
            Flow::Respond(Response::text(req.id().unwrap_or("<none>").to_owned()))
        }))
    }

    #[tokio::test]
    async fn generates_an_id_before_downstream_runs() {
        let stages: Vec<BoxedMiddleware> = vec![Arc::new(RequestTracer), echo_id()];
        let res = respond(drive(stages, empty(request("GET", "/"))).await);

        let seen = res.text_body();
        assert!(Uuid::parse_str(&seen).is_ok());
        assert_eq!(res.headers()[REQUEST_ID_HEADER], seen.as_str());
    }

    #[tokio::test]
    async fn existing_id_is_not_overwritten() {
        let mut req = empty(request("GET", "/").header(REQUEST_ID_HEADER, "from-header"));
        req.set_id("already-here");

        let stages: Vec<BoxedMiddleware> = vec![Arc::new(RequestTracer), echo_id()];
        let res = respond(drive(stages, req).await);
        assert_eq!(res.text_body(), "already-here");
    }

    #[tokio::test]
    async fn upstream_header_is_adopted() {
        let req = empty(request("GET", "/").header(REQUEST_ID_HEADER, "edge-42"));
        let stages: Vec<BoxedMiddleware> = vec![Arc::new(RequestTracer), echo_id()];
        let res = respond(drive(stages, req).await);
        assert_eq!(res.text_body(), "edge-42");
    }

    #[test]
    fn assign_is_idempotent() {
        let mut req = empty(request("GET", "/"));
        let first = RequestTracer::assign(&mut req);
        let second = RequestTracer::assign(&mut req);
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn id_is_echoed_on_failures() {
        let failing: BoxedMiddleware = Arc::new(Terminal(|_req: Request| {
            Flow::Fail(crate::error::ResponseError::new("nope"))
        }));
        let req = empty(request("GET", "/").header(REQUEST_ID_HEADER, "abc"));
        let err = fail(drive(vec![Arc::new(RequestTracer), failing], req).await);
        assert_eq!(err.headers()[REQUEST_ID_HEADER], "abc");
    }
}
