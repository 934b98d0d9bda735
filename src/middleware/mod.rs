//! Middleware layer.
//!
//! Every stage of the pipeline, built-in or consumer-supplied, implements
//! [`Middleware`]. A stage receives the request and a [`Next`] handle for
//! the rest of the chain, and hands back a [`Flow`]:
//!
//! - [`Flow::Respond`]: someone produced a response.
//! - [`Flow::Fail`]: someone failed; the error travels to the normalizer.
//! - [`Flow::Pass`]: the request fell off the end of the chain unanswered.
//!
//! A stage short-circuits by returning `Respond` or `Fail` without calling
//! `next`. Stages run strictly in assembly order.
//!
//! Panics are caught at every stage boundary and turned into a `500`
//! [`Flow::Fail`], so a misbehaving handler never takes the process down.
//!
//! ```rust
//! use keel::middleware::{BoxFuture, Flow, Middleware, Next};
//! use keel::Request;
//!
//! struct Timing;
//!
//! impl Middleware for Timing {
//!     fn name(&self) -> &'static str { "timing" }
//!
//!     fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
//!         Box::pin(async move {
//!             let start = std::time::Instant::now();
//!             let flow = next.run(req).await;
//!             tracing::debug!(elapsed = ?start.elapsed(), "request handled");
//!             flow
//!         })
//!     }
//! }
//! ```

pub mod body;
pub mod compress;
pub mod cookies;
pub mod cors;
pub mod errors;
pub mod trace;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use http::header::{HeaderName, HeaderValue};

use crate::error::ResponseError;
use crate::handler::HandlerResult;
use crate::request::Request;
use crate::response::Response;

/// A heap-allocated, type-erased, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A type-erased stage, shareable across connection tasks.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// The outcome of running (part of) the chain for one request.
#[derive(Debug)]
pub enum Flow {
    Respond(Response),
    Fail(ResponseError),
    Pass(Request),
}

impl Flow {
    /// Sets a header on whatever response this flow turns into.
    ///
    /// For `Respond` that is the response itself, for `Fail` the rendered
    /// error, for `Pass` the fallback response.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        match &mut self {
            Self::Respond(res) => {
                res.headers_mut().insert(name, value);
            }
            Self::Fail(err) => {
                err.headers_mut().insert(name, value);
            }
            Self::Pass(req) => {
                req.pending_headers.insert(name, value);
            }
        }
        self
    }
}

impl From<HandlerResult> for Flow {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(res) => Self::Respond(res),
            Err(err) => Self::Fail(err),
        }
    }
}

/// A pipeline stage.
pub trait Middleware: Send + Sync + 'static {
    /// Stable stage name, used in logs and [`Service::stage_names`](crate::Service::stage_names).
    fn name(&self) -> &'static str;

    /// Handles `req`, calling `next.run(req)` at most once to continue.
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow>;
}

/// The remainder of the chain after the current stage.
///
/// Consumed by [`run`](Next::run), so the rest of the chain runs at most once.
pub struct Next<'a> {
    stages: &'a [BoxedMiddleware],
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [BoxedMiddleware]) -> Self {
        Self { stages }
    }

    /// Runs the next stage, or yields [`Flow::Pass`] if none is left.
    pub fn run(self, req: Request) -> BoxFuture<'a, Flow> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Box::pin(async move { Flow::Pass(req) });
        };
        let next = Next { stages: rest };

        Box::pin(async move {
            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| stage.handle(req, next))) {
                Ok(fut) => fut,
                Err(panic) => return panicked(stage.name(), &*panic),
            };
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(flow) => flow,
                Err(panic) => panicked(stage.name(), &*panic),
            }
        })
    }
}

fn panicked(stage: &'static str, panic: &(dyn Any + Send)) -> Flow {
    let message = panic_message(panic);
    tracing::error!(stage, panic = %message, "stage panicked");
    Flow::Fail(ResponseError::new(message).with_status(500))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
