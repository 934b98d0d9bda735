//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.
//!
//! In clustered mode every worker process runs its own server on the shared
//! port and drains independently.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderValue, Version};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{Error, ResponseError};
use crate::middleware::errors::render;
use crate::request::Request;
use crate::service::Service;

/// Where the server gets its socket from.
enum Source {
    Addr(SocketAddr),
    Listener(std::net::TcpListener),
}

/// The HTTP server.
pub struct Server {
    source: Source,
}

impl Server {
    /// Configures the server to bind to `addr` when it starts listening.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddr`] if `addr` is not a valid `host:port` string.
    ///
    /// ```rust,no_run
    /// use keel::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::InvalidAddr(addr.to_owned()))?;
        Ok(Self { source: Source::Addr(addr) })
    }

    /// Serves on an already bound listener, e.g. one opened with
    /// `SO_REUSEPORT` by the supervisor.
    pub fn from_listener(listener: std::net::TcpListener) -> Self {
        Self { source: Source::Listener(listener) }
    }

    /// Opens the socket without accepting yet.
    pub async fn listen(self) -> Result<Listening, Error> {
        let listener = match self.source {
            Source::Addr(addr) => TcpListener::bind(addr).await?,
            Source::Listener(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
        };
        Ok(Listening { listener })
    }

    /// Binds, then serves `service` until SIGTERM or Ctrl-C and a full drain.
    pub async fn serve(self, service: Service) -> Result<(), Error> {
        self.listen().await?.serve(service).await
    }
}

/// A bound server, not yet accepting connections.
pub struct Listening {
    listener: TcpListener,
}

impl Listening {
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until SIGTERM or Ctrl-C, then drains in-flight connections.
    pub async fn serve(self, service: Service) -> Result<(), Error> {
        self.serve_with_shutdown(service, shutdown_signal()).await
    }

    /// Serves until `signal` resolves, then drains in-flight connections.
    pub async fn serve_with_shutdown<F>(self, service: Service, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = self.listener;
        let service = Arc::new(service);

        info!(addr = %listener.local_addr()?, service = service.name(), "listening");

        // Tracks every connection task so shutdown can wait for them.
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM stops accepting at once,
                // even with connections queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let service = Arc::clone(&service);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move { dispatch(service, req).await }
                        });

                        // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished tasks so the set does not grow without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("server stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Collects the body, at most [`Service::body_limit`] bytes of it, and runs
/// one request through the service.
///
/// Infallible: every failure, a broken or oversized body included, becomes a
/// response.
async fn dispatch(
    service: Arc<Service>,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let limit = service.body_limit();

    // A declared length over the limit is refused before reading anything.
    let declared = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Ok(too_large(parts.version));
    }

    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => return Ok(too_large(parts.version)),
        Err(e) => {
            let err = ResponseError::new("failed to read request body")
                .with_status(400)
                .with_source(e);
            return Ok(render(err).into_inner());
        }
    };

    let req = Request::new(parts.method, parts.uri, parts.headers, body);
    Ok(service.handle(req).await.into_inner())
}

/// `413`, closing HTTP/1 connections since the rest of the body is never read.
fn too_large(version: Version) -> http::Response<Full<Bytes>> {
    let err = ResponseError::new("request entity too large").with_status(413);
    let mut res = render(err).into_inner();
    if version < Version::HTTP_2 {
        res.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    }
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by the Kubernetes control
/// plane and by process supervisors) and **SIGINT** (Ctrl-C). A handler that
/// cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_address_is_an_error() {
        let err = Server::bind("not an address").err().unwrap();
        assert!(matches!(err, Error::InvalidAddr(addr) if addr == "not an address"));
    }

    #[tokio::test]
    async fn listens_on_an_ephemeral_port() {
        let listening = Server::bind("127.0.0.1:0").unwrap().listen().await.unwrap();
        assert_ne!(listening.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn adopts_a_std_listener() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let listening = Server::from_listener(std_listener).listen().await.unwrap();
        assert_eq!(listening.local_addr().unwrap(), addr);
    }
}
