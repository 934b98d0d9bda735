//! Error types.
//!
//! Two kinds of failure exist and they never mix:
//!
//! - [`Error`]: infrastructure and assembly failures, such as a bad spec file, a
//!   route setup that refused to run, a port that cannot be bound. These
//!   surface from [`Service::configure`](crate::Service::configure),
//!   [`Server::serve`](crate::Server::serve) and [`run`](crate::run), and the
//!   service never starts.
//! - [`ResponseError`]: a runtime failure inside the pipeline. It travels
//!   down to the error normalizer and becomes a JSON `{"message": ...}`
//!   response.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::path::PathBuf;

use http::HeaderMap;

/// A boxed error, `Send + Sync` so it can cross task boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by keel's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The API specification could not be read, parsed, or is not the
    /// declared kind.
    #[error("api spec `{}`: {reason}", path.display())]
    Spec { path: PathBuf, reason: String },

    /// The consumer's route setup returned an error.
    #[error("route setup failed: {0}")]
    Setup(#[source] BoxError),

    /// The asynchronous initialisation future resolved to an error.
    #[error("initialisation failed: {0}")]
    Init(#[source] BoxError),

    #[error("invalid socket address `{0}`")]
    InvalidAddr(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// A failure raised while handling a request.
///
/// Carries a client-facing message, an optional HTTP status (absent means
/// internal error, rendered as `500`), the underlying cause for server-side
/// logs, and any response headers earlier stages attached on the way out.
///
/// Every `std::error::Error` converts into a `500` `ResponseError`, so
/// handlers can use `?` freely:
///
/// ```rust
/// use keel::{Request, ResponseError};
///
/// async fn count(req: Request) -> Result<String, ResponseError> {
///     let n: u32 = req.param("n").unwrap_or("0").parse()?;
///     Ok(format!("{n}"))
/// }
/// ```
///
/// `ResponseError` deliberately does not implement `std::error::Error`
/// itself; that is what makes the blanket conversion possible.
pub struct ResponseError {
    message: String,
    status: Option<u16>,
    source: Option<BoxError>,
    headers: HeaderMap,
    backtrace: Backtrace,
}

impl ResponseError {
    /// An error with a message and no status (renders as `500`).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            source: None,
            headers: HeaderMap::new(),
            backtrace: Backtrace::capture(),
        }
    }

    /// An internal error wrapping `source`; the message is the source's
    /// `Display` output.
    pub fn internal(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        let mut err = Self::new(source.to_string());
        err.source = Some(source);
        err
    }

    /// Attach an HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an underlying cause without changing the message.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn status(&self) -> Option<u16> { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    /// The underlying cause, if any.
    pub fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }

    /// The captured backtrace, if capturing was enabled (`RUST_BACKTRACE`).
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.backtrace.status() {
            BacktraceStatus::Captured => Some(&self.backtrace),
            _ => None,
        }
    }

    /// The cause chain rendered as `a: b: c`, for logs only.
    pub(crate) fn chain(&self) -> String {
        let mut out = String::new();
        let mut next = self.source();
        while let Some(err) = next {
            if !out.is_empty() {
                out.push_str(": ");
            }
            out.push_str(&err.to_string());
            next = err.source();
        }
        out
    }

    pub(crate) fn into_parts(self) -> (String, Option<u16>, HeaderMap) {
        (self.message, self.status, self.headers)
    }
}

impl fmt::Debug for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseError")
            .field("message", &self.message)
            .field("status", &self.status)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl<E> From<E> for ResponseError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_errors_become_internal() {
        let err: ResponseError = "x".parse::<u32>().unwrap_err().into();
        assert_eq!(err.status(), None);
        assert_eq!(err.message(), "invalid digit found in string");
        assert!(err.source().is_some());
    }

    #[test]
    fn chain_walks_sources() {
        let io = std::io::Error::other("disk on fire");
        let err = ResponseError::new("could not save").with_source(Error::Io(io));
        assert_eq!(err.chain(), "disk on fire");
    }

    #[test]
    fn display_includes_status() {
        let err = ResponseError::new("nope").with_status(403);
        assert_eq!(err.to_string(), "403: nope");
    }
}
