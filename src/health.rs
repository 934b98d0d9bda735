//! Built-in health check.
//!
//! Every service answers `GET /health` with `200 "<name> is healthy"`. The
//! stage sits after request tracing and before consumer routes, so a
//! consumer cannot shadow it.

use crate::Request;
use crate::response::Response;
use crate::router::{RouteStage, Router};

/// The fixed health check path.
pub const HEALTH_PATH: &str = "/health";

/// The health check body for a service called `name`.
pub fn message(name: &str) -> String {
    format!("{name} is healthy")
}

pub(crate) fn stage(name: &str) -> RouteStage {
    let body = message(name);
    let router = Router::new().get(HEALTH_PATH, move |_req: Request| {
        let body = body.clone();
        async move { Response::text(body) }
    });
    RouteStage::new("health", "/", router)
}
