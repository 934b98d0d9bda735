//! The built-in validation engine.

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;
use serde_json::{Map, Value};
use tracing::warn;

use super::rules::Rules;
use super::{SchemaValidator, Spec, SpecKind};
use crate::error::ResponseError;
use crate::request::{Parsed, Request};
use crate::response::Response;

/// Validates traffic against a Swagger 2.0 or OpenAPI 3 document.
///
/// Requests on paths the document does not describe pass unchecked. A
/// described path hit with an undeclared method is a `405` under OpenAPI
/// and passes under Swagger. Swagger documents accept `null` wherever a
/// value is expected.
pub struct SpecValidator {
    kind: SpecKind,
    document: Value,
    base_path: String,
    templates: MatchitRouter<String>,
}

/// A request parameter location.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Location {
    Path,
    Query,
    Header,
    Form,
}

impl Location {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "formData" => Some(Self::Form),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "headers",
            Self::Form => "body",
        }
    }
}

/// An operation resolved for one request.
struct Operation<'s> {
    path_item: &'s Map<String, Value>,
    op: &'s Map<String, Value>,
    params: HashMap<String, String>,
}

impl SpecValidator {
    pub fn new(spec: &Spec) -> Self {
        let document = spec.document().clone();
        let base_path = base_path(&document, spec.kind());

        let mut templates = MatchitRouter::new();
        if let Some(paths) = document.get("paths").and_then(Value::as_object) {
            for template in paths.keys() {
                if let Err(e) = templates.insert(template.as_str(), template.clone()) {
                    warn!(template = %template, error = %e, "path template skipped");
                }
            }
        }

        Self { kind: spec.kind(), document, base_path, templates }
    }

    fn rules(&self) -> Rules<'_> {
        Rules::new(&self.document, self.kind == SpecKind::Swagger)
    }

    /// Finds the operation for `method` on `path`.
    ///
    /// `Ok(None)` when the path is not described (or, for Swagger, the
    /// method is not); `Err` with `405` when OpenAPI describes the path but
    /// not the method.
    fn operation(&self, method: &Method, path: &str) -> Result<Option<Operation<'_>>, ResponseError> {
        let path = match self.base_path.as_str() {
            "" => path,
            base => match path.strip_prefix(base) {
                Some("") => "/",
                Some(rest) if rest.starts_with('/') => rest,
                _ => return Ok(None),
            },
        };
        let Ok(matched) = self.templates.at(path) else {
            return Ok(None);
        };
        let template = matched.value;
        let Some(path_item) = self
            .document
            .pointer(&format!("/paths/{}", escape(template)))
            .and_then(|item| self.rules().resolve(item).ok())
            .and_then(Value::as_object)
        else {
            return Ok(None);
        };

        let key = method.as_str().to_ascii_lowercase();
        let op = path_item
            .get(&key)
            .or_else(|| if *method == Method::HEAD { path_item.get("get") } else { None })
            .and_then(Value::as_object);
        let Some(op) = op else {
            return match self.kind {
                SpecKind::OpenApi => Err(ResponseError::new(format!(
                    "{method} method not allowed for {template}"
                ))
                .with_status(405)),
                SpecKind::Swagger => Ok(None),
            };
        };

        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Ok(Some(Operation { path_item, op, params }))
    }

    /// Path-level parameters overridden by operation-level ones.
    fn parameters<'s>(&'s self, operation: &Operation<'s>) -> Vec<&'s Map<String, Value>> {
        let rules = self.rules();
        let mut merged: Vec<&Map<String, Value>> = Vec::new();
        let declared = [operation.path_item.get("parameters"), operation.op.get("parameters")];
        for list in declared.into_iter().flatten().filter_map(Value::as_array) {
            for param in list {
                let Some(param) = rules.resolve(param).ok().and_then(Value::as_object) else {
                    continue;
                };
                let id = (param.get("name"), param.get("in"));
                merged.retain(|p| (p.get("name"), p.get("in")) != id);
                merged.push(param);
            }
        }
        merged
    }

    fn check_parameter(
        &self,
        req: &Request,
        operation: &Operation<'_>,
        query: &[(String, String)],
        param: &Map<String, Value>,
    ) -> Result<(), String> {
        let Some(name) = param.get("name").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(location) = param.get("in").and_then(Value::as_str).and_then(Location::parse) else {
            return Ok(());
        };

        let raw = match location {
            Location::Path => operation.params.get(name).map(String::as_str),
            Location::Query => lookup(query, name),
            Location::Header => req.header(name),
            Location::Form => match req.parsed() {
                Some(Parsed::Form(pairs)) => lookup(pairs, name),
                _ => None,
            },
        };

        let at = format!("request/{}/{name}", location.as_str());
        let required = location == Location::Path
            || param.get("required").and_then(Value::as_bool).unwrap_or(false);
        let Some(raw) = raw else {
            return if required {
                Err(format!("request/{} must have required property '{name}'", location.as_str()))
            } else {
                Ok(())
            };
        };

        // Swagger parameters carry their schema inline; OpenAPI nests it.
        let schema = match self.kind {
            SpecKind::Swagger => Value::Object(param.clone()),
            SpecKind::OpenApi => param.get("schema").cloned().unwrap_or(Value::Null),
        };
        let schema = self.rules().resolve(&schema)?.clone();
        let value = coerce(raw, &schema).ok_or_else(|| {
            let ty = schema.get("type").and_then(Value::as_str).unwrap_or("valid");
            format!("{at} must be {ty}")
        })?;
        self.rules().check(&schema, &value, &at)
    }

    /// The declared request body schema and whether a body is required.
    fn body_schema<'s>(
        &'s self,
        operation: &Operation<'s>,
        params: &[&'s Map<String, Value>],
    ) -> Option<(&'s Value, bool)> {
        match self.kind {
            SpecKind::Swagger => params
                .iter()
                .copied()
                .find(|p| p.get("in").and_then(Value::as_str) == Some("body"))
                .and_then(|p| {
                    let required = p.get("required").and_then(Value::as_bool).unwrap_or(false);
                    p.get("schema").map(|s| (s, required))
                }),
            SpecKind::OpenApi => {
                let body = self.rules().resolve(operation.op.get("requestBody")?).ok()?;
                let required = body.get("required").and_then(Value::as_bool).unwrap_or(false);
                let schema = json_media(body.get("content")?)?.get("schema")?;
                Some((schema, required))
            }
        }
    }

    fn response_schema<'s>(&'s self, operation: &Operation<'s>, status: u16) -> Option<&'s Value> {
        let responses = operation.op.get("responses")?.as_object()?;
        let code = status.to_string();
        let range = format!("{}XX", status / 100);
        let declared = responses
            .get(&code)
            .or_else(|| responses.get(&range))
            .or_else(|| responses.get(&range.to_ascii_lowercase()))
            .or_else(|| responses.get("default"))?;
        let declared = self.rules().resolve(declared).ok()?;
        match self.kind {
            SpecKind::Swagger => declared.get("schema"),
            SpecKind::OpenApi => json_media(declared.get("content")?)?.get("schema"),
        }
    }
}

impl SchemaValidator for SpecValidator {
    fn validate_request(&self, req: &Request) -> Result<(), ResponseError> {
        let Some(operation) = self.operation(req.method(), req.path())? else {
            return Ok(());
        };
        let bad_request = |message: String| ResponseError::new(message).with_status(400);

        let query: Vec<(String, String)> = req
            .query()
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default();
        let params = self.parameters(&operation);
        for param in &params {
            self.check_parameter(req, &operation, &query, param).map_err(bad_request)?;
        }

        let Some((schema, required)) = self.body_schema(&operation, &params) else {
            return Ok(());
        };
        match req.parsed() {
            Some(Parsed::Json(value)) => self.rules().check(schema, value, "request/body").map_err(bad_request),
            Some(Parsed::Form(_)) => Ok(()),
            None if required => Err(bad_request("request/body is required".to_owned())),
            None => Ok(()),
        }
    }

    fn validate_response(&self, method: &Method, path: &str, res: &Response) -> Result<(), ResponseError> {
        // A 405 here was already reported for the request.
        let Ok(Some(operation)) = self.operation(method, path) else {
            return Ok(());
        };
        let Some(schema) = self.response_schema(&operation, res.status_code().as_u16()) else {
            return Ok(());
        };
        if !res.content_type().is_some_and(|ct| ct.contains("json")) {
            return Ok(());
        }

        let internal = |message: String| ResponseError::new(message).with_status(500);
        let value: Value = serde_json::from_slice(res.body())
            .map_err(|e| internal(format!("response/body is not valid JSON: {e}")))?;
        self.rules().check(schema, &value, "response/body").map_err(internal)
    }
}

/// The path prefix every template is relative to.
fn base_path(document: &Value, kind: SpecKind) -> String {
    let raw = match kind {
        SpecKind::Swagger => document.get("basePath").and_then(Value::as_str).unwrap_or(""),
        SpecKind::OpenApi => document
            .pointer("/servers/0/url")
            .and_then(Value::as_str)
            .map(server_path)
            .unwrap_or(""),
    };
    raw.trim_end_matches('/').to_owned()
}

/// The path component of a server url, absolute or relative.
fn server_path(url: &str) -> &str {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None if url.starts_with('/') => return url,
        None => return "",
    };
    rest.find('/').map_or("", |i| &rest[i..])
}

/// The JSON entry of a `content` map.
fn json_media(content: &Value) -> Option<&Value> {
    let content = content.as_object()?;
    content.get("application/json").or_else(|| {
        content
            .iter()
            .find(|(media, _)| media.ends_with("+json") || media.ends_with("/json"))
            .map(|(_, v)| v)
    })
}

fn lookup<'q>(pairs: &'q [(String, String)], name: &str) -> Option<&'q str> {
    pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// JSON pointer escaping for a `paths` key.
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Turns a raw parameter string into the JSON value its schema declares.
fn coerce(raw: &str, schema: &Value) -> Option<Value> {
    match schema.get("type").and_then(Value::as_str) {
        Some("integer") => raw.parse::<i64>().ok().map(Value::from),
        Some("number") => raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number),
        Some("boolean") => match raw {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Some("array") => {
            let items = schema.get("items").cloned().unwrap_or(Value::Null);
            raw.split(',').map(|item| coerce(item, &items)).collect::<Option<Vec<_>>>().map(Value::Array)
        }
        _ => Some(Value::String(raw.to_owned())),
    }
}
