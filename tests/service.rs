use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use keel::middleware::{BoxFuture, Flow, Middleware, Next};
use keel::{Error, Request, Response, ResponseError, Router, SchemaConfig, Service, ServiceConfig, StatusCode};

fn get(uri: &str) -> Request {
    http::Request::get(uri).body(Bytes::new()).unwrap().into()
}

fn post_json(uri: &str, body: &str) -> Request {
    http::Request::post(uri)
        .header("content-type", "application/json")
        .body(Bytes::copy_from_slice(body.as_bytes()))
        .unwrap()
        .into()
}

fn message(res: &Response) -> String {
    assert_eq!(res.content_type(), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    body["message"].as_str().unwrap().to_owned()
}

async fn hello_world(_req: Request) -> &'static str {
    "Hello World"
}

async fn fails(_req: Request) -> Result<Response, ResponseError> {
    Err(ResponseError::new("the database is on fire"))
}

async fn panics(_req: Request) -> Response {
    panic!("handler blew up")
}

fn test_app() -> Service {
    let config = ServiceConfig::new(|routes| {
        routes
            .get("/hello-world", hello_world)
            .get("/fails", fails)
            .get("/panics", panics)
            .get("/id", |req: Request| async move { req.id().unwrap_or_default().to_owned() });
        routes.mount("/", Router::new().get("/hello", hello_world));
        Ok(())
    })
    .name("Test App");
    Service::configure(config).unwrap()
}

#[tokio::test]
async fn health_check_uses_the_service_name() {
    let res = test_app().handle(get("/health")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.text_body(), "Test App is healthy");
}

#[tokio::test]
async fn registered_route_answers() {
    let res = test_app().handle(get("/hello-world")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.text_body(), "Hello World");
}

#[tokio::test]
async fn mounted_router_is_reachable() {
    let res = test_app().handle(get("/hello")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.text_body(), "Hello World");
}

#[tokio::test]
async fn failing_handler_becomes_json_500() {
    let res = test_app().handle(get("/fails")).await;
    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(message(&res), "the database is on fire");
}

#[tokio::test]
async fn panicking_handler_becomes_json_500() {
    let app = test_app();
    let res = app.handle(get("/panics")).await;
    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(message(&res), "handler blew up");

    // The service keeps serving afterwards.
    let res = app.handle(get("/hello-world")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn every_request_gets_an_id_before_handlers_run() {
    let res = test_app().handle(get("/id")).await;
    let seen = res.text_body();
    assert!(!seen.is_empty());
    assert_eq!(res.headers()["x-request-id"], seen.as_str());
}

#[tokio::test]
async fn existing_id_is_not_overwritten() {
    let mut req = get("/id");
    req.set_id("assigned-upstream");
    let res = test_app().handle(req).await;
    assert_eq!(res.text_body(), "assigned-upstream");
    assert_eq!(res.headers()["x-request-id"], "assigned-upstream");
}

#[tokio::test]
async fn unmatched_request_is_404() {
    let res = test_app().handle(get("/nope")).await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(res.text_body(), "Cannot GET /nope");
    assert!(res.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn malformed_json_is_a_400() {
    let res = test_app().handle(post_json("/hello-world", "{not json")).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    assert!(message(&res).starts_with("invalid JSON body"));
}

#[tokio::test]
async fn cors_headers_and_preflight() {
    let app = test_app();
    let res = app.handle(get("/hello-world")).await;
    assert_eq!(res.headers()["access-control-allow-origin"], "*");

    let preflight: Request = http::Request::builder()
        .method("OPTIONS")
        .uri("/hello-world")
        .header("origin", "https://example.com")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Bytes::new())
        .unwrap()
        .into();
    let res = app.handle(preflight).await;
    assert_eq!(res.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(res.headers()["access-control-allow-methods"], "GET,HEAD,PUT,PATCH,POST,DELETE");
    assert_eq!(res.headers()["access-control-allow-headers"], "content-type");
}

#[tokio::test]
async fn large_responses_are_compressed() {
    let big = "keel ".repeat(1000);
    let expected = big.clone();
    let config = ServiceConfig::new(move |routes| {
        routes.get("/big", move |_req: Request| {
            let big = big.clone();
            async move { big }
        });
        Ok(())
    });
    let app = Service::configure(config).unwrap();

    let req: Request = http::Request::get("/big")
        .header("accept-encoding", "gzip")
        .body(Bytes::new())
        .unwrap()
        .into();
    let res = app.handle(req).await;
    assert_eq!(res.headers()["content-encoding"], "gzip");

    let mut decoded = String::new();
    flate2::read::GzDecoder::new(res.body()).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, expected);
}

#[tokio::test]
async fn cookies_reach_handlers() {
    let config = ServiceConfig::new(|routes| {
        routes.get("/whoami", |req: Request| async move {
            req.cookie("user").unwrap_or("anonymous").to_owned()
        });
        Ok(())
    });
    let app = Service::configure(config).unwrap();
    let req: Request = http::Request::get("/whoami")
        .header("cookie", "theme=dark; user=ann")
        .body(Bytes::new())
        .unwrap()
        .into();
    assert_eq!(app.handle(req).await.text_body(), "ann");
}

struct Counter(Arc<AtomicUsize>);

impl Middleware for Counter {
    fn name(&self) -> &'static str { "counter" }

    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        self.0.fetch_add(1, Ordering::SeqCst);
        next.run(req)
    }
}

#[tokio::test]
async fn consumer_middleware_runs_in_registration_order() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Counter(Arc::clone(&hits));
    let config = ServiceConfig::new(move |routes| {
        routes.get("/before", hello_world);
        routes.layer(counter);
        routes.get("/after", hello_world);
        Ok(())
    });
    let app = Service::configure(config).unwrap();

    assert_eq!(
        app.stage_names(),
        [
            "body_parser",
            "cors",
            "compression",
            "cookie_parser",
            "request_tracer",
            "health",
            "routes",
            "counter",
            "routes",
            "error_normalizer",
        ]
    );

    app.handle(get("/before")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    app.handle(get("/after")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn setup_error_fails_assembly() {
    let err = Service::configure(ServiceConfig::new(|_routes| Err("missing credentials".into()))).unwrap_err();
    assert!(matches!(err, Error::Setup(_)));
}

// ── Schema enforcement ────────────────────────────────────────────────────────

const PETS_SPEC: &str = r#"
openapi: 3.0.0
info:
  title: Pets
  version: 1.0.0
paths:
  /pets:
    post:
      requestBody:
        required: true
        content:
          application/json:
            schema:
              $ref: '#/components/schemas/Pet'
      responses:
        '201':
          description: created
          content:
            application/json:
              schema:
                $ref: '#/components/schemas/Pet'
  /pets/{id}:
    get:
      parameters:
        - name: id
          in: path
          required: true
          schema:
            type: integer
      responses:
        '200':
          description: a pet
          content:
            application/json:
              schema:
                $ref: '#/components/schemas/Pet'
components:
  schemas:
    Pet:
      type: object
      required: [name]
      properties:
        name:
          type: string
"#;

fn spec_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn pets_app(spec: &tempfile::NamedTempFile) -> Service {
    let config = ServiceConfig::new(|routes| {
        routes.post("/pets", |req: Request| async move {
            let pet: serde_json::Value = req.json()?;
            Ok::<_, ResponseError>(Response::builder().status(StatusCode::CREATED).json(pet.to_string()))
        });
        routes.get("/pets/{id}", |req: Request| async move {
            match req.param("id") {
                Some("13") => Response::json(r#"{"species":"cat"}"#),
                _ => Response::json(r#"{"name":"rex"}"#),
            }
        });
        Ok(())
    })
    .name("Pets")
    .schema(SchemaConfig::openapi(spec.path()));
    Service::configure(config).unwrap()
}

#[tokio::test]
async fn schema_stages_are_placed_before_tracing() {
    let spec = spec_file(PETS_SPEC);
    let names = pets_app(&spec).stage_names();
    assert_eq!(&names[..7], ["body_parser", "cors", "compression", "cookie_parser", "docs", "schema_gate", "request_tracer"]);
}

#[tokio::test]
async fn valid_request_passes_the_gate() {
    let spec = spec_file(PETS_SPEC);
    let res = pets_app(&spec).handle(post_json("/pets", r#"{"name":"rex"}"#)).await;
    assert_eq!(res.status_code(), StatusCode::CREATED);
}

#[tokio::test]
async fn invalid_request_is_rejected_with_400() {
    let spec = spec_file(PETS_SPEC);
    let app = pets_app(&spec);

    let res = app.handle(post_json("/pets", r#"{"species":"cat"}"#)).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(message(&res), "request/body must have required property 'name'");

    let res = app.handle(get("/pets/abc")).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(message(&res), "request/path/id must be integer");
}

#[tokio::test]
async fn invalid_response_is_a_500() {
    let spec = spec_file(PETS_SPEC);
    let res = pets_app(&spec).handle(get("/pets/13")).await;
    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(message(&res), "response/body must have required property 'name'");
}

#[tokio::test]
async fn health_and_unknown_paths_bypass_the_gate() {
    let spec = spec_file(PETS_SPEC);
    let app = pets_app(&spec);
    assert_eq!(app.handle(get("/health")).await.text_body(), "Pets is healthy");
    assert_eq!(app.handle(get("/unlisted")).await.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn docs_are_served() {
    let spec = spec_file(PETS_SPEC);
    let app = pets_app(&spec);

    let page = app.handle(get("/api/docs")).await;
    assert_eq!(page.status_code(), StatusCode::OK);
    assert!(page.text_body().contains("swagger-ui"));

    let json = app.handle(get("/api/docs/spec.json")).await;
    let document: serde_json::Value = serde_json::from_slice(json.body()).unwrap();
    assert_eq!(document["info"]["title"], "Pets");
}

#[test]
fn unreadable_spec_fails_assembly() {
    let config = ServiceConfig::new(|_routes| Ok(())).schema(SchemaConfig::swagger("/no/such/spec.yaml"));
    let err = Service::configure(config).unwrap_err();
    assert!(matches!(err, Error::Spec { .. }));
}

#[test]
fn spec_of_the_wrong_kind_fails_assembly() {
    let spec = spec_file(PETS_SPEC);
    let config = ServiceConfig::new(|_routes| Ok(())).schema(SchemaConfig::swagger(spec.path()));
    let err = Service::configure(config).unwrap_err();
    assert!(matches!(err, Error::Spec { .. }));
}
