//! Minimal keel example: JSON endpoints, a mounted router, and the
//! built-in health check.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!   RUST_LOG=info KEEL_CLUSTERED=1 KEEL_WORKERS=4 cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/health
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl http://localhost:3000/admin/stats
//!   curl http://localhost:3000/boom

use keel::{Request, Response, ResponseError, Router, RunConfig, Service, ServiceConfig, StatusCode};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct CreateUser {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), keel::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let exit = keel::supervisor::exit_hook();
    exit.report(start().await)
}

async fn start() -> Result<(), keel::Error> {
    let config = ServiceConfig::new(|routes| {
        routes
            .get("/users/{id}", get_user)
            .post("/users", create_user)
            .delete("/users/{id}", delete_user)
            .get("/boom", boom);
        routes.mount("/admin", Router::new().get("/stats", stats));
        Ok(())
    })
    .name("Basic Example");

    let service = Service::configure(config)?;
    let run = RunConfig::from_env()?
        .name("basic")
        .on_ready(|| tracing::info!("accepting connections"));

    keel::run(service, run).await
}

// GET /users/{id}
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(serde_json::json!({ "id": id, "name": "alice" }).to_string())
}

// POST /users. A missing or malformed body becomes a 400 `{"message"}`.
async fn create_user(req: Request) -> Result<Response, ResponseError> {
    let input: CreateUser = req.json()?;
    if input.name.is_empty() {
        return Err(ResponseError::new("name must not be empty").with_status(400));
    }
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(serde_json::json!({ "id": "99", "name": input.name }).to_string()))
}

// DELETE /users/{id} → 204 No Content
async fn delete_user(_req: Request) -> StatusCode {
    StatusCode::NO_CONTENT
}

// Any std error converts into a 500.
async fn boom(_req: Request) -> Result<Response, ResponseError> {
    let n: u32 = "not a number".parse()?;
    Ok(Response::text(n.to_string()))
}

async fn stats(_req: Request) -> serde_json::Value {
    serde_json::json!({ "workers": std::thread::available_parallelism().map_or(1, |n| n.get()) })
}
