//! Cross-origin resource sharing stage.
//!
//! Permissive by default: any origin may call the service. Preflight
//! requests (`OPTIONS` with `Access-Control-Request-Method`) are answered
//! here with `204` and never reach routing or validation.

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_LENGTH, HeaderValue,
    VARY,
};
use http::{Method, StatusCode};

use super::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;
use crate::response::Response;

const DEFAULT_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// CORS policy stage.
#[derive(Clone, Debug)]
pub struct Cors {
    origin: HeaderValue,
    methods: HeaderValue,
}

impl Cors {
    /// Allow every origin and the common methods.
    pub fn permissive() -> Self {
        Self {
            origin: HeaderValue::from_static("*"),
            methods: HeaderValue::from_static(DEFAULT_METHODS),
        }
    }

    fn is_preflight(req: &Request) -> bool {
        req.method == Method::OPTIONS && req.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn preflight(&self, req: &Request) -> Response {
        let mut res = Response::status(StatusCode::NO_CONTENT);
        let headers = res.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.methods.clone());
        // Reflect whatever the browser asked for.
        if let Some(requested) = req.headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
            headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        res
    }
}

impl Default for Cors {
    fn default() -> Self { Self::permissive() }
}

impl Middleware for Cors {
    fn name(&self) -> &'static str { "cors" }

    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            if Self::is_preflight(&req) {
                return Flow::Respond(self.preflight(&req));
            }
            next.run(req)
                .await
                .with_header(ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone())
        })
    }
}
