//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;

use crate::error::ResponseError;

/// A request body decoded by the body-parsing stage.
#[derive(Clone, Debug, PartialEq)]
pub enum Parsed {
    /// `application/json`
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded`, pairs in wire order.
    Form(Vec<(String, String)>),
}

/// An incoming HTTP request as it travels through the pipeline.
///
/// Beyond the wire data, stages attach: the parsed body, parsed cookies,
/// route parameters, and the request id. The id is set at most once and
/// never overwritten.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) id: Option<String>,
    pub(crate) parsed: Option<Parsed>,
    pub(crate) cookies: HashMap<String, String>,
    /// Headers stages want on whatever response this request ends up with
    /// when nothing downstream answers it.
    pub(crate) pending_headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            params: HashMap::new(),
            id: None,
            parsed: None,
            cookies: HashMap::new(),
            pending_headers: HeaderMap::new(),
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Header lookup; `None` if absent or not valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The request id, once the tracing stage (or an earlier hop) set it.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Sets the request id unless one is already present.
    ///
    /// Returns `true` if the id was set by this call.
    pub fn set_id(&mut self, id: impl Into<String>) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(id.into());
        true
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// The decoded body, if the body-parsing stage recognised its content type.
    pub fn parsed(&self) -> Option<&Parsed> {
        self.parsed.as_ref()
    }

    /// Deserialises the JSON body into `T`. A missing or mismatched body is a
    /// `400`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let Some(Parsed::Json(value)) = &self.parsed else {
            return Err(ResponseError::new("expected a JSON body").with_status(400));
        };
        T::deserialize(value).map_err(|e| ResponseError::new(e.to_string()).with_status(400))
    }

    /// Deserialises the form body into `T`. A missing or mismatched body is a
    /// `400`.
    pub fn form<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let Some(Parsed::Form(_)) = &self.parsed else {
            return Err(ResponseError::new("expected a form body").with_status(400));
        };
        serde_urlencoded::from_bytes(&self.body)
            .map_err(|e| ResponseError::new(e.to_string()).with_status(400))
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts.method, parts.uri, parts.headers, body)
    }
}
