//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. A [`Router`] is plain
//! data; it joins the pipeline as a [`RouteStage`], optionally mounted under
//! a path prefix. A request no route matches falls through to the next stage.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};
use crate::middleware::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;

/// A set of routes.
///
/// Build it once at startup and hand it to
/// [`Routes::mount`](crate::Routes::mount), or register routes directly on
/// the [`Routes`](crate::Routes) handle.
///
/// ```rust,no_run
/// # use keel::{Request, Response, Router};
/// # async fn get_user(_: Request) -> Response { Response::text("") }
/// # async fn create_user(_: Request) -> Response { Response::text("") }
/// # async fn delete_user(_: Request) -> Response { Response::text("") }
/// Router::new()
///     .delete("/users/{id}", delete_user)
///     .get("/users/{id}",    get_user)
///     .post("/users",        create_user);
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax — `req.param("name")` retrieves them.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route pattern or conflicts with an
    /// existing route. Routes are registered at startup, so this surfaces
    /// before the service accepts traffic.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.insert(method, path, handler);
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.on(Method::GET, path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.on(Method::POST, path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.on(Method::PUT, path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.on(Method::PATCH, path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.on(Method::DELETE, path, handler) }

    pub(crate) fn insert(&mut self, method: Method, path: &str, handler: impl Handler) {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = match self.routes.get(method) {
            Some(tree) => tree,
            // HEAD is answered by the GET route when there is no HEAD route.
            None if method == Method::HEAD => self.routes.get(&Method::GET)?,
            None => return None,
        };
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// A [`Router`] placed in the pipeline, optionally under a path prefix.
pub(crate) struct RouteStage {
    name: &'static str,
    prefix: String,
    router: Router,
}

impl RouteStage {
    pub(crate) fn new(name: &'static str, prefix: &str, router: Router) -> Self {
        let prefix = prefix.trim_end_matches('/').to_owned();
        Self { name, prefix, router }
    }

    /// The part of `path` below this stage's prefix, always starting with `/`.
    fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        match rest {
            "" => Some("/"),
            rest if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }
}

impl Middleware for RouteStage {
    fn name(&self) -> &'static str { self.name }

    fn handle<'a>(&'a self, mut req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        let found = self
            .strip(req.path())
            .and_then(|path| self.router.lookup(&req.method, path));

        let Some((handler, params)) = found else {
            return next.run(req);
        };
        req.params = params;
        Box::pin(async move { Flow::from(handler.call(req).await) })
    }
}
