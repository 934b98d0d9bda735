//! # keel
//!
//! A bootstrap layer for HTTP services: one call assembles a fixed,
//! ordered middleware pipeline, and one more runs it in one or many
//! processes on a shared port.
//!
//! ## The pipeline
//!
//! Every service gets the same stages in the same order, and the consumer
//! only adds routes and middleware in the middle:
//!
//! - Body parsing (JSON and URL-encoded forms)
//! - Permissive CORS
//! - gzip / deflate response compression
//! - Cookie parsing
//! - Optional API spec enforcement, with Swagger UI at `/api/docs`
//! - Request ids: one per request, echoed as `x-request-id`
//! - `GET /health`
//! - Your routes and middleware
//! - Error normalization: every failure becomes `{"message": ...}`
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use keel::{Request, Response, ResponseError, RunConfig, Service, ServiceConfig, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel::Error> {
//!     let config = ServiceConfig::new(|routes| {
//!         routes
//!             .get("/users/{id}", get_user)
//!             .post("/users", create_user);
//!         Ok(())
//!     })
//!     .name("Users");
//!
//!     let service = Service::configure(config)?;
//!     keel::run(service, RunConfig::new(3000).clustered(true)).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn create_user(req: Request) -> Result<Response, ResponseError> {
//!     let user: serde_json::Value = req.json()?;
//!     Ok(Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .json(user.to_string()))
//! }
//! ```

mod docs;
mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;
mod service;

pub mod health;
pub mod middleware;
pub mod schema;
pub mod supervisor;

pub use error::{BoxError, Error, ResponseError};
pub use handler::{Handler, HandlerResult, IntoOutcome};
pub use http::{Method, StatusCode};
pub use request::{Parsed, Request};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use schema::{SchemaConfig, SpecKind};
pub use server::{Listening, Server};
pub use service::{Routes, Service, ServiceConfig};
pub use supervisor::{Role, RunConfig, Supervisor, WorkerExit, WorkerProcess, run};
