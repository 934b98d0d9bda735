//! Response compression stage.
//!
//! Compresses successful responses with gzip or deflate when the client
//! accepts it, the content type is worth compressing, and the body is at
//! least [`DEFAULT_MIN_SIZE`] bytes.

use std::io::Write;

use bytes::Bytes;
use flate2::Compression as Level;
use flate2::write::{DeflateEncoder, GzEncoder};
use http::header::{ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue, VARY};
use http::{Method, StatusCode};
use tracing::warn;

use super::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Bodies smaller than this are sent as is: 1 KiB.
pub const DEFAULT_MIN_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip    => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn compress(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Level::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Level::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Compression stage.
#[derive(Clone, Debug)]
pub struct Compression {
    min_size: usize,
}

impl Compression {
    pub fn new(min_size: usize) -> Self {
        Self { min_size }
    }

    /// Picks the encoding with the highest quality value the client accepts.
    /// Ties keep the client's order; `q=0` rules an encoding out.
    pub fn negotiate(accept_encoding: &str) -> Option<Encoding> {
        let mut offers: Vec<(Encoding, f32)> = Vec::new();
        let mut wildcard = None;

        for part in accept_encoding.split(',') {
            let mut pieces = part.split(';');
            let name = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
            let quality = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);

            match name.as_str() {
                "gzip" | "x-gzip" => offers.push((Encoding::Gzip, quality)),
                "deflate" => offers.push((Encoding::Deflate, quality)),
                "*" => wildcard = Some(quality),
                _ => {}
            }
        }

        if let Some(quality) = wildcard {
            if !offers.iter().any(|(e, _)| *e == Encoding::Gzip) {
                offers.push((Encoding::Gzip, quality));
            }
        }

        offers.retain(|(_, q)| *q > 0.0);
        offers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        offers.first().map(|(e, _)| *e)
    }

    fn should_compress(&self, res: &Response) -> bool {
        if res.body.len() < self.min_size
            || res.status == StatusCode::NO_CONTENT
            || res.status == StatusCode::NOT_MODIFIED
            || res.headers.contains_key(CONTENT_ENCODING)
        {
            return false;
        }
        let no_transform = res
            .headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("no-transform"));
        !no_transform && res.content_type().is_some_and(is_compressible)
    }

    fn apply(&self, mut res: Response, encoding: Option<Encoding>) -> Response {
        if !self.should_compress(&res) {
            return res;
        }
        res.headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));

        let Some(encoding) = encoding else { return res };
        match encoding.compress(&res.body) {
            Ok(compressed) => {
                res.body = Bytes::from(compressed);
                res.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
                res.headers.remove(CONTENT_LENGTH);
            }
            Err(e) => warn!(encoding = encoding.as_str(), "compression failed, sending identity: {e}"),
        }
        res
    }
}

impl Default for Compression {
    fn default() -> Self { Self::new(DEFAULT_MIN_SIZE) }
}

impl Middleware for Compression {
    fn name(&self) -> &'static str { "compression" }

    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            let encoding = if req.method == Method::HEAD {
                None
            } else {
                req.headers
                    .get(ACCEPT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .and_then(Self::negotiate)
            };

            match next.run(req).await {
                Flow::Respond(res) => Flow::Respond(self.apply(res, encoding)),
                other => other,
            }
        })
    }
}

fn is_compressible(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json" | "application/javascript" | "application/xml" | "image/svg+xml"
        )
}
