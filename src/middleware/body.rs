//! Body parsing stage.
//!
//! Decodes `application/json` and `application/x-www-form-urlencoded`
//! bodies into [`Parsed`] before anything else looks at the request. Other
//! content types are left as raw bytes.

use http::header::CONTENT_TYPE;

use super::{BoxFuture, Flow, Middleware, Next};
use crate::error::ResponseError;
use crate::request::{Parsed, Request};

/// Default body size limit: 100 KiB.
pub const DEFAULT_LIMIT: usize = 100 * 1024;

/// Parses JSON and URL-encoded form bodies.
///
/// Oversized bodies fail with `413`; malformed ones with `400`.
#[derive(Clone, Debug)]
pub struct BodyParser {
    limit: usize,
}

impl BodyParser {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    fn parse(&self, req: &mut Request) -> Result<(), ResponseError> {
        if req.body.len() > self.limit {
            return Err(ResponseError::new("request entity too large").with_status(413));
        }
        if req.body.is_empty() {
            return Ok(());
        }

        match essence(req) {
            Some(essence) if essence == "application/json" => {
                let value = serde_json::from_slice(&req.body).map_err(|e| {
                    ResponseError::new(format!("invalid JSON body: {e}"))
                        .with_status(400)
                        .with_source(e)
                })?;
                req.parsed = Some(Parsed::Json(value));
            }
            Some(essence) if essence == "application/x-www-form-urlencoded" => {
                let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&req.body)
                    .map_err(|e| {
                        ResponseError::new(format!("invalid form body: {e}"))
                            .with_status(400)
                            .with_source(e)
                    })?;
                req.parsed = Some(Parsed::Form(pairs));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for BodyParser {
    fn default() -> Self { Self::new(DEFAULT_LIMIT) }
}

impl Middleware for BodyParser {
    fn name(&self) -> &'static str { "body_parser" }

    fn handle<'a>(&'a self, mut req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            if let Err(err) = self.parse(&mut req) {
                return Flow::Fail(err);
            }
            next.run(req).await
        })
    }
}

/// The media type without parameters, lowercased: `Application/JSON; charset=utf-8` → `application/json`.
fn essence(req: &Request) -> Option<String> {
    let value = req.headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    Some(essence)
}
