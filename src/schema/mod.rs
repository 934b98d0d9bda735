//! API specification enforcement.
//!
//! When a [`SchemaConfig`] is set on the service, the spec file is loaded
//! once during assembly and every request passes the [`SchemaGate`] before
//! any consumer code runs. Responses are checked on the way back out unless
//! response validation is switched off.
//!
//! Violations never answer inline: they become a failed [`Flow`] carrying
//! `400` (request) or `500` (response) and reach the error normalizer like
//! any other failure.
//!
//! The built-in engine is [`SpecValidator`]. Another engine plugs in through
//! [`SchemaConfig::validator`]; the spec file is still loaded for the docs
//! endpoints and its declared kind still checked.

mod rules;
mod validator;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, ResponseError};
use crate::middleware::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;
use crate::response::Response;

use rules::Rules;

pub use validator::SpecValidator;

/// The dialect of an API specification document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecKind {
    /// OpenAPI 3.x (`openapi: 3.0.0`).
    OpenApi,
    /// Swagger 2.0 (`swagger: "2.0"`).
    Swagger,
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenApi => f.write_str("openapi"),
            Self::Swagger => f.write_str("swagger"),
        }
    }
}

/// Where the spec lives and how strictly to enforce it.
///
/// ```rust,no_run
/// use keel::SchemaConfig;
///
/// let schema = SchemaConfig::openapi("api/openapi.yaml").validate_responses(false);
/// ```
#[derive(Clone)]
pub struct SchemaConfig {
    spec_path: PathBuf,
    kind: SpecKind,
    validate_responses: bool,
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl SchemaConfig {
    pub fn new(spec_path: impl Into<PathBuf>, kind: SpecKind) -> Self {
        Self {
            spec_path: spec_path.into(),
            kind,
            validate_responses: true,
            validator: None,
        }
    }

    pub fn openapi(spec_path: impl Into<PathBuf>) -> Self {
        Self::new(spec_path, SpecKind::OpenApi)
    }

    pub fn swagger(spec_path: impl Into<PathBuf>) -> Self {
        Self::new(spec_path, SpecKind::Swagger)
    }

    /// Whether responses are checked too. On by default.
    pub fn validate_responses(mut self, on: bool) -> Self {
        self.validate_responses = on;
        self
    }

    /// Replaces the built-in [`SpecValidator`].
    pub fn validator(mut self, validator: impl SchemaValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn spec_path(&self) -> &Path { &self.spec_path }
    pub fn kind(&self) -> SpecKind { self.kind }
    pub fn validates_responses(&self) -> bool { self.validate_responses }

    /// Loads the spec and builds the gate.
    pub(crate) fn build(&self) -> Result<(Spec, SchemaGate), Error> {
        let spec = Spec::load(&self.spec_path, self.kind)?;
        let validator = match &self.validator {
            Some(custom) => Arc::clone(custom),
            None => Arc::new(SpecValidator::new(&spec)) as Arc<dyn SchemaValidator>,
        };
        let gate = SchemaGate::new(validator, self.validate_responses);
        Ok((spec, gate))
    }
}

impl fmt::Debug for SchemaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaConfig")
            .field("spec_path", &self.spec_path)
            .field("kind", &self.kind)
            .field("validate_responses", &self.validate_responses)
            .field("custom_validator", &self.validator.is_some())
            .finish()
    }
}

/// A loaded API specification.
#[derive(Clone, Debug)]
pub struct Spec {
    kind: SpecKind,
    document: Arc<Value>,
}

impl Spec {
    /// Reads and parses the document at `path`. YAML and JSON are both
    /// accepted.
    ///
    /// # Errors
    ///
    /// [`Error::Spec`] when the file cannot be read or parsed, does not
    /// declare `kind`'s version field, or holds a `$ref` that does not
    /// resolve.
    pub fn load(path: &Path, kind: SpecKind) -> Result<Self, Error> {
        let fail = |reason: String| Error::Spec { path: path.to_path_buf(), reason };

        let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let document: Value = serde_yaml::from_str(&text).map_err(|e| fail(e.to_string()))?;
        check_declaration(&document, kind).map_err(fail)?;
        check_references(&document, &document).map_err(fail)?;

        let operations = document
            .get("paths")
            .and_then(Value::as_object)
            .map_or(0, |paths| paths.len());
        info!(path = %path.display(), %kind, operations, "api spec loaded");
        Ok(Self::from_document(kind, document))
    }

    pub(crate) fn from_document(kind: SpecKind, document: Value) -> Self {
        Self { kind, document: Arc::new(document) }
    }

    pub fn kind(&self) -> SpecKind { self.kind }
    pub fn document(&self) -> &Value { &self.document }
}

fn check_declaration(document: &Value, kind: SpecKind) -> Result<(), String> {
    if !document.is_object() {
        return Err("document is not a mapping".to_owned());
    }
    let declared = match kind {
        SpecKind::Swagger => document.get("swagger"),
        SpecKind::OpenApi => document.get("openapi"),
    };
    let version = match declared {
        Some(Value::String(v)) => v.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(format!("missing `{kind}` version field")),
    };
    let supported = match kind {
        SpecKind::Swagger => version == "2.0" || version == "2",
        SpecKind::OpenApi => version.starts_with("3."),
    };
    if supported {
        Ok(())
    } else {
        Err(format!("unsupported {kind} version {version}"))
    }
}

/// Every `$ref` must lead somewhere, so a broken document is caught at
/// startup rather than blamed on a request.
fn check_references<'a>(root: &'a Value, node: &'a Value) -> Result<(), String> {
    match node {
        Value::Object(map) => {
            if map.contains_key("$ref") {
                Rules::new(root, false).resolve(node)?;
            }
            map.values().try_for_each(|child| check_references(root, child))
        }
        Value::Array(items) => items.iter().try_for_each(|child| check_references(root, child)),
        _ => Ok(()),
    }
}

/// A validation engine behind the [`SchemaGate`].
///
/// Errors should carry `400` for request violations and `500` for response
/// violations; the gate forwards them as they are.
pub trait SchemaValidator: Send + Sync + 'static {
    fn validate_request(&self, req: &Request) -> Result<(), ResponseError>;

    fn validate_response(&self, method: &Method, path: &str, res: &Response) -> Result<(), ResponseError>;
}

/// The pipeline stage enforcing a spec.
pub struct SchemaGate {
    validator: Arc<dyn SchemaValidator>,
    validate_responses: bool,
}

impl SchemaGate {
    pub fn new(validator: Arc<dyn SchemaValidator>, validate_responses: bool) -> Self {
        Self { validator, validate_responses }
    }
}

impl Middleware for SchemaGate {
    fn name(&self) -> &'static str { "schema_gate" }

    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            if let Err(err) = self.validator.validate_request(&req) {
                debug!(error = %err, "request rejected by api spec");
                return Flow::Fail(err);
            }
            if !self.validate_responses {
                return next.run(req).await;
            }

            let method = req.method().clone();
            let path = req.path().to_owned();
            match next.run(req).await {
                Flow::Respond(res) => match self.validator.validate_response(&method, &path, &res) {
                    Ok(()) => Flow::Respond(res),
                    Err(err) => Flow::Fail(err),
                },
                other => other,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::BoxedMiddleware;
    use crate::middleware::testing::*;
    use std::io::Write;

    fn spec_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_yaml_and_json() {
        let yaml = spec_file("openapi: 3.0.0\ninfo:\n  title: Pets\npaths: {}\n");
        let spec = Spec::load(yaml.path(), SpecKind::OpenApi).unwrap();
        assert_eq!(spec.document()["info"]["title"], "Pets");

        let json = spec_file(r#"{ "swagger": "2.0", "paths": {} }"#);
        let spec = Spec::load(json.path(), SpecKind::Swagger).unwrap();
        assert_eq!(spec.kind(), SpecKind::Swagger);
    }

    #[test]
    fn missing_file_is_a_spec_error() {
        let err = Spec::load(Path::new("/definitely/not/here.yaml"), SpecKind::OpenApi).unwrap_err();
        assert!(matches!(err, Error::Spec { .. }));
    }

    #[test]
    fn unparsable_file_is_a_spec_error() {
        let file = spec_file("openapi: [unclosed");
        let err = Spec::load(file.path(), SpecKind::OpenApi).unwrap_err();
        assert!(matches!(err, Error::Spec { .. }));
    }

    #[test]
    fn wrong_kind_is_a_spec_error() {
        let file = spec_file("swagger: '2.0'\npaths: {}\n");
        let err = Spec::load(file.path(), SpecKind::OpenApi).unwrap_err();
        let Error::Spec { reason, .. } = err else { panic!("expected a spec error") };
        assert_eq!(reason, "missing `openapi` version field");

        let file = spec_file("openapi: 2.0.0\npaths: {}\n");
        assert!(Spec::load(file.path(), SpecKind::OpenApi).is_err());
    }

    #[test]
    fn dangling_reference_is_a_spec_error() {
        let file = spec_file(concat!(
            "openapi: 3.0.0\n",
            "paths:\n",
            "  /pets:\n",
            "    post:\n",
            "      requestBody:\n",
            "        content:\n",
            "          application/json:\n",
            "            schema:\n",
            "              $ref: '#/components/schemas/Pet'\n",
        ));
        let err = Spec::load(file.path(), SpecKind::OpenApi).unwrap_err();
        let Error::Spec { reason, .. } = err else { panic!("expected a spec error") };
        assert_eq!(reason, "can't resolve reference #/components/schemas/Pet");

        let file = spec_file(concat!(
            "openapi: 3.0.0\n",
            "paths: {}\n",
            "components:\n",
            "  schemas:\n",
            "    Pet:\n",
            "      type: object\n",
            "    Pets:\n",
            "      type: array\n",
            "      items:\n",
            "        $ref: '#/components/schemas/Pet'\n",
        ));
        assert!(Spec::load(file.path(), SpecKind::OpenApi).is_ok());
    }

    struct RejectAll;

    impl SchemaValidator for RejectAll {
        fn validate_request(&self, _req: &Request) -> Result<(), ResponseError> {
            Err(ResponseError::new("nope").with_status(400))
        }

        fn validate_response(&self, _: &Method, _: &str, _: &Response) -> Result<(), ResponseError> {
            Ok(())
        }
    }

    struct RejectResponses;

    impl SchemaValidator for RejectResponses {
        fn validate_request(&self, _req: &Request) -> Result<(), ResponseError> {
            Ok(())
        }

        fn validate_response(&self, _: &Method, path: &str, _: &Response) -> Result<(), ResponseError> {
            Err(ResponseError::new(format!("bad response for {path}")).with_status(500))
        }
    }

    #[tokio::test]
    async fn request_violation_fails_before_downstream() {
        let gate: BoxedMiddleware = Arc::new(SchemaGate::new(Arc::new(RejectAll), true));
        let err = fail(drive(vec![gate, reply("unreachable")], empty(request("GET", "/"))).await);
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn response_violation_is_a_failure() {
        let gate: BoxedMiddleware = Arc::new(SchemaGate::new(Arc::new(RejectResponses), true));
        let err = fail(drive(vec![gate, reply("x")], empty(request("GET", "/pets"))).await);
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.message(), "bad response for /pets");
    }

    #[tokio::test]
    async fn response_validation_can_be_switched_off() {
        let gate: BoxedMiddleware = Arc::new(SchemaGate::new(Arc::new(RejectResponses), false));
        let res = respond(drive(vec![gate, reply("x")], empty(request("GET", "/pets"))).await);
        assert_eq!(res.text_body(), "x");
    }

    #[test]
    fn custom_validator_replaces_the_built_in_one() {
        let file = spec_file("openapi: 3.0.0\npaths: {}\n");
        let config = SchemaConfig::openapi(file.path()).validator(RejectAll);
        let (_, gate) = config.build().unwrap();
        let req = empty(request("GET", "/anything"));
        assert!(gate.validator.validate_request(&req).is_err());
    }
}
