//! Error normalization: the terminal stage of every pipeline.
//!
//! Whatever the chain hands back ends here and becomes exactly one response:
//!
//! | Flow | Result |
//! |---|---|
//! | `Respond(res)` | `res`, untouched |
//! | `Fail(err)` | logged with its cause chain, rendered as `{"message": ...}` with the error's status or `500` |
//! | `Pass(req)` | nobody answered; the chain continues into the fallback handler (`404` by default) |
//!
//! The normalizer never panics. A panic escaping the fallback is logged and
//! swallowed, and a bare `500` goes out instead.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use http::StatusCode;
use tracing::error;

use super::{Flow, panic_message};
use crate::error::ResponseError;
use crate::handler::{BoxedHandler, Handler, HandlerResult};
use crate::request::Request;
use crate::response::Response;

const INTERNAL_MESSAGE: &str = "Internal server error";

pub struct ErrorNormalizer {
    fallback: BoxedHandler,
}

impl ErrorNormalizer {
    pub fn new() -> Self {
        Self::with_fallback(not_found)
    }

    /// Use `handler` for requests no stage answered.
    pub fn with_fallback(handler: impl Handler) -> Self {
        Self { fallback: handler.into_boxed_handler() }
    }

    pub(crate) fn from_boxed(fallback: BoxedHandler) -> Self {
        Self { fallback }
    }

    /// Turns the outcome of the chain into the response sent to the client.
    pub async fn finish(&self, flow: Flow) -> Response {
        match flow {
            Flow::Respond(res) => res,
            Flow::Fail(err) => render(err),
            Flow::Pass(req) => self.pass_through(req).await,
        }
    }

    async fn pass_through(&self, mut req: Request) -> Response {
        let pending = std::mem::take(&mut req.pending_headers);

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| self.fallback.call(req))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let mut res = match outcome {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => render(err),
            Err(panic) => {
                error!(panic = %panic_message(&*panic), "fallback handler panicked");
                Response::status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        res.headers_mut().extend(pending);
        res
    }
}

impl Default for ErrorNormalizer {
    fn default() -> Self { Self::new() }
}

/// Renders a failure as the uniform JSON error body.
pub(crate) fn render(err: ResponseError) -> Response {
    let status = err
        .status()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let chain = err.chain();
    match err.backtrace() {
        Some(backtrace) => error!(
            status = status.as_u16(),
            cause = %chain,
            "{}\n{backtrace}",
            err.message()
        ),
        None => error!(status = status.as_u16(), cause = %chain, "{}", err.message()),
    }

    let (message, _, headers) = err.into_parts();
    let message = if message.is_empty() { INTERNAL_MESSAGE.to_owned() } else { message };
    let body = serde_json::json!({ "message": message }).to_string();

    Response::builder().status(status).headers(headers).json(body)
}

/// Default fallback: `404 Cannot <METHOD> <path>`.
async fn not_found(req: Request) -> HandlerResult {
    let message = format!("Cannot {} {}", req.method(), req.path());
    Ok(Response::builder().status(StatusCode::NOT_FOUND).text(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::*;
    use http::header::{HeaderName, HeaderValue};

    fn message(res: &Response) -> String {
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        body["message"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn error_without_status_is_500() {
        let res = ErrorNormalizer::new().finish(Flow::Fail(ResponseError::new("db down"))).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.content_type(), Some("application/json"));
        assert_eq!(message(&res), "db down");
    }

    #[tokio::test]
    async fn declared_status_is_kept() {
        let err = ResponseError::new("name is required").with_status(400);
        let res = ErrorNormalizer::new().finish(Flow::Fail(err)).await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(message(&res), "name is required");
    }

    #[tokio::test]
    async fn invalid_status_falls_back_to_500() {
        let err = ResponseError::new("weird").with_status(42);
        let res = ErrorNormalizer::new().finish(Flow::Fail(err)).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn empty_message_gets_a_default() {
        let res = ErrorNormalizer::new().finish(Flow::Fail(ResponseError::new(""))).await;
        assert_eq!(message(&res), INTERNAL_MESSAGE);
    }

    #[tokio::test]
    async fn source_is_never_sent_to_the_client() {
        let err = ResponseError::new("could not save")
            .with_source(std::io::Error::other("/var/lib/secret path"));
        let res = ErrorNormalizer::new().finish(Flow::Fail(err)).await;
        assert!(!res.text_body().contains("secret"));
    }

    #[tokio::test]
    async fn headers_attached_by_stages_survive() {
        let flow = Flow::Fail(ResponseError::new("x"))
            .with_header(HeaderName::from_static("x-request-id"), HeaderValue::from_static("r1"));
        let res = ErrorNormalizer::new().finish(flow).await;
        assert_eq!(res.headers()["x-request-id"], "r1");
    }

    #[tokio::test]
    async fn pass_through_reaches_the_fallback() {
        let flow = Flow::Pass(empty(request("DELETE", "/nowhere")))
            .with_header(HeaderName::from_static("x-request-id"), HeaderValue::from_static("r2"));
        let res = ErrorNormalizer::new().finish(flow).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.text_body(), "Cannot DELETE /nowhere");
        assert_eq!(res.headers()["x-request-id"], "r2");
    }

    #[tokio::test]
    async fn panicking_fallback_is_swallowed() {
        async fn broken(_req: Request) -> Response {
            panic!("fallback exploded")
        }

        let normalizer = ErrorNormalizer::with_fallback(broken);
        let res = normalizer.finish(Flow::Pass(empty(request("GET", "/")))).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn responses_are_untouched() {
        let res = ErrorNormalizer::new().finish(Flow::Respond(Response::text("fine"))).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.text_body(), "fine");
    }
}
