//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types in one table, so they are
//! hidden behind a trait object (`dyn ErasedHandler`) and stored uniformly:
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ routes.get("/", hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req)  at request time               ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(req).await.into_outcome() })
//! ```
//!
//! A handler may fail: anything returning `Result<impl IntoResponse, E>`
//! with `E: Into<ResponseError>` is a handler, and its `Err` goes to the
//! error normalizer instead of being rendered in place.

use std::future::Future;
use std::sync::Arc;

use http::StatusCode;

use crate::error::ResponseError;
use crate::middleware::BoxFuture;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// What a handler produces: a response, or an error for the normalizer.
pub type HandlerResult = Result<Response, ResponseError>;

// ── Internal types ────────────────────────────────────────────────────────────

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult>;
}

/// A heap-allocated, type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── IntoOutcome ───────────────────────────────────────────────────────────────

/// Conversion of a handler's return value into a [`HandlerResult`].
///
/// Implemented for everything [`IntoResponse`] covers, plus `Result`s of
/// those with any error convertible into [`ResponseError`].
pub trait IntoOutcome {
    fn into_outcome(self) -> HandlerResult;
}

impl IntoOutcome for Response {
    fn into_outcome(self) -> HandlerResult { Ok(self) }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> HandlerResult { Ok(self.into_response()) }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> HandlerResult { Ok(self.into_response()) }
}

impl IntoOutcome for StatusCode {
    fn into_outcome(self) -> HandlerResult { Ok(self.into_response()) }
}

impl IntoOutcome for (StatusCode, String) {
    fn into_outcome(self) -> HandlerResult { Ok(self.into_response()) }
}

impl IntoOutcome for serde_json::Value {
    fn into_outcome(self) -> HandlerResult { Ok(self.into_response()) }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoResponse,
    E: Into<ResponseError>,
{
    fn into_outcome(self) -> HandlerResult {
        self.map(IntoResponse::into_response).map_err(Into::into)
    }
}

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` (or closure returning a future) with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoOutcome
/// ```
///
/// The trait is **sealed**: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, HandlerResult> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}
