//! Pipeline assembly.
//!
//! A [`Service`] is built once from a [`ServiceConfig`] and then shared by
//! every connection. Stage order is fixed:
//!
//! ```text
//! body_parser → cors → compression → cookie_parser
//!   → [docs → schema_gate]        (only with a schema)
//!   → request_tracer → health
//!   → consumer stages, in registration order
//!   → error_normalizer
//! ```
//!
//! The normalizer is held outside the stage list, so nothing registered by
//! the consumer can ever run after it.

use std::fmt;
use std::sync::Arc;

use http::Method;
use tracing::info;

use crate::docs;
use crate::error::{BoxError, Error};
use crate::handler::{BoxedHandler, Handler};
use crate::health;
use crate::middleware::body::{BodyParser, DEFAULT_LIMIT};
use crate::middleware::compress::Compression;
use crate::middleware::cookies::CookieParser;
use crate::middleware::cors::Cors;
use crate::middleware::errors::ErrorNormalizer;
use crate::middleware::trace::RequestTracer;
use crate::middleware::{BoxedMiddleware, Middleware, Next};
use crate::request::Request;
use crate::response::Response;
use crate::router::{RouteStage, Router};
use crate::schema::SchemaConfig;

type Setup = Box<dyn FnOnce(&mut Routes) -> Result<(), BoxError>>;

/// Everything needed to assemble a [`Service`].
///
/// ```rust,no_run
/// use keel::{Request, Response, ServiceConfig, Service};
///
/// let config = ServiceConfig::new(|routes| {
///     routes.get("/hello-world", |_req: Request| async { "Hello World" });
///     Ok(())
/// })
/// .name("Greeter");
///
/// let service = Service::configure(config).unwrap();
/// ```
pub struct ServiceConfig {
    name: String,
    schema: Option<SchemaConfig>,
    setup: Setup,
    body_limit: usize,
    fallback: Option<BoxedHandler>,
}

impl ServiceConfig {
    /// `setup` is called exactly once during assembly to register the
    /// consumer's routes and middleware.
    pub fn new<F>(setup: F) -> Self
    where
        F: FnOnce(&mut Routes) -> Result<(), BoxError> + 'static,
    {
        Self {
            name: "Service".to_owned(),
            schema: None,
            setup: Box::new(setup),
            body_limit: DEFAULT_LIMIT,
            fallback: None,
        }
    }

    /// Display name, used by the health check. Defaults to `"Service"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn schema(mut self, schema: SchemaConfig) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Largest accepted request body in bytes. Defaults to 100 KiB.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Handler for requests no stage answered. Defaults to a `404`.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Some(handler.into_boxed_handler());
        self
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("body_limit", &self.body_limit)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// The registration handle passed to the setup function.
///
/// Routes, mounted routers and middleware join the pipeline in the order
/// they are registered. Consecutive route registrations share one routing
/// tree.
pub struct Routes {
    stages: Vec<BoxedMiddleware>,
    current: Router,
}

impl Routes {
    fn new() -> Self {
        Self { stages: Vec::new(), current: Router::new() }
    }

    /// # Panics
    ///
    /// Panics on an invalid or conflicting route pattern.
    pub fn route(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.current.insert(method, path, handler);
        self
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.route(Method::GET, path, handler) }
    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.route(Method::POST, path, handler) }
    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.route(Method::PUT, path, handler) }
    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.route(Method::PATCH, path, handler) }
    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.route(Method::DELETE, path, handler) }

    /// Mounts `router` under `prefix`; its routes see paths with the prefix
    /// removed.
    pub fn mount(&mut self, prefix: &str, router: Router) -> &mut Self {
        self.flush();
        self.stages.push(Arc::new(RouteStage::new("router", prefix, router)));
        self
    }

    /// Inserts a middleware stage at this point of the chain.
    pub fn layer(&mut self, middleware: impl Middleware) -> &mut Self {
        self.flush();
        self.stages.push(Arc::new(middleware));
        self
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let router = std::mem::take(&mut self.current);
        self.stages.push(Arc::new(RouteStage::new("routes", "/", router)));
    }

    fn into_stages(mut self) -> Vec<BoxedMiddleware> {
        self.flush();
        self.stages
    }
}

/// An assembled pipeline, ready to handle requests.
pub struct Service {
    name: String,
    body_limit: usize,
    stages: Vec<BoxedMiddleware>,
    normalizer: ErrorNormalizer,
}

impl Service {
    /// Assembles the pipeline.
    ///
    /// # Errors
    ///
    /// - [`Error::Spec`] if a schema is configured and its file cannot be
    ///   loaded.
    /// - [`Error::Setup`] if the setup function returns an error.
    ///
    /// A panic inside the setup function propagates to the caller.
    pub fn configure(config: ServiceConfig) -> Result<Self, Error> {
        let ServiceConfig { name, schema, setup, body_limit, fallback } = config;

        let mut stages: Vec<BoxedMiddleware> = vec![
            Arc::new(BodyParser::new(body_limit)),
            Arc::new(Cors::permissive()),
            Arc::new(Compression::default()),
            Arc::new(CookieParser),
        ];

        if let Some(schema) = &schema {
            let (spec, gate) = schema.build()?;
            stages.push(Arc::new(docs::stage(&spec)));
            stages.push(Arc::new(gate));
        }

        stages.push(Arc::new(RequestTracer));
        stages.push(Arc::new(health::stage(&name)));

        let mut routes = Routes::new();
        setup(&mut routes).map_err(Error::Setup)?;
        stages.extend(routes.into_stages());

        let normalizer = match fallback {
            Some(handler) => ErrorNormalizer::from_boxed(handler),
            None => ErrorNormalizer::new(),
        };

        let service = Self { name, body_limit, stages, normalizer };
        info!(name = %service.name, stages = ?service.stage_names(), "service assembled");
        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest request body the server will buffer for this service.
    pub(crate) fn body_limit(&self) -> usize {
        self.body_limit
    }

    /// Stage names in execution order; the last one is always
    /// `error_normalizer`.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .map(|stage| stage.name())
            .chain(std::iter::once("error_normalizer"))
            .collect()
    }

    /// Runs one request through the pipeline. Never fails: every error
    /// becomes a response.
    pub async fn handle(&self, req: Request) -> Response {
        let flow = Next::new(&self.stages).run(req).await;
        self.normalizer.finish(flow).await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::*;
    use crate::middleware::{BoxFuture, Flow};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(setup: impl FnOnce(&mut Routes) -> Result<(), BoxError> + 'static) -> Service {
        Service::configure(ServiceConfig::new(setup).name("Test App")).unwrap()
    }

    #[test]
    fn routes_keep_registration_order() {
        struct Marker;

        impl Middleware for Marker {
            fn name(&self) -> &'static str { "marker" }

            fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
                next.run(req)
            }
        }

        let service = service(|routes| {
            routes.get("/a", |_req: Request| async { "a" });
            routes.get("/b", |_req: Request| async { "b" });
            routes.layer(Marker);
            routes.mount("/api", Router::new().get("/c", |_req: Request| async { "c" }));
            Ok(())
        });

        assert_eq!(
            service.stage_names(),
            [
                "body_parser",
                "cors",
                "compression",
                "cookie_parser",
                "request_tracer",
                "health",
                "routes",
                "marker",
                "router",
                "error_normalizer",
            ]
        );
    }

    #[test]
    fn setup_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        service(move |_routes| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_setup_is_an_error() {
        let err = Service::configure(ServiceConfig::new(|_routes| Err("no database".into()))).unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert_eq!(err.to_string(), "route setup failed: no database");
    }

    #[test]
    #[should_panic(expected = "routes unavailable")]
    fn panicking_setup_propagates() {
        let _ = Service::configure(ServiceConfig::new(|_routes| panic!("routes unavailable")));
    }

    #[tokio::test]
    async fn default_name_is_used_by_health() {
        let service = Service::configure(ServiceConfig::new(|_routes| Ok(()))).unwrap();
        assert_eq!(service.name(), "Service");
        let res = service.handle(empty(request("GET", "/health"))).await;
        assert_eq!(res.text_body(), "Service is healthy");
    }

    #[tokio::test]
    async fn custom_fallback_answers_unmatched_requests() {
        let config = ServiceConfig::new(|_routes| Ok(()))
            .fallback(|_req: Request| async { (http::StatusCode::GONE, "gone".to_owned()) });
        let service = Service::configure(config).unwrap();
        let res = service.handle(empty(request("GET", "/missing"))).await;
        assert_eq!(res.status_code(), http::StatusCode::GONE);
        assert!(res.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn body_limit_is_applied() {
        let config = ServiceConfig::new(|routes| {
            routes.post("/echo", |_req: Request| async { "ok" });
            Ok(())
        })
        .body_limit(4);
        let service = Service::configure(config).unwrap();
        let req: Request = request("POST", "/echo")
            .body(bytes::Bytes::from_static(b"too long"))
            .unwrap()
            .into();
        let res = service.handle(req).await;
        assert_eq!(res.status_code(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
