//! API documentation endpoints.
//!
//! Present only when a schema is configured, and placed before the schema
//! gate so the docs themselves are never validated:
//!
//! - `GET /api/docs`: Swagger UI page (assets from a CDN) rendering the spec.
//! - `GET /api/docs/spec.json`: the loaded spec as JSON.

use std::sync::Arc;

use crate::Request;
use crate::response::Response;
use crate::router::{RouteStage, Router};
use crate::schema::Spec;

pub const DOCS_PATH: &str = "/api/docs";

const SWAGGER_UI_VERSION: &str = "5.18.2";

pub(crate) fn stage(spec: &Spec) -> RouteStage {
    let json: Arc<str> = Arc::from(spec.document().to_string());
    let page: Arc<str> = Arc::from(html(&title(spec)));

    let router = Router::new()
        .get("/", move |_req: Request| {
            let page = Arc::clone(&page);
            async move { Response::html(page.as_ref()) }
        })
        .get("/spec.json", move |_req: Request| {
            let json = Arc::clone(&json);
            async move { Response::json(json.as_ref().to_owned()) }
        });
    RouteStage::new("docs", DOCS_PATH, router)
}

fn title(spec: &Spec) -> String {
    let name = spec
        .document()
        .pointer("/info/title")
        .and_then(|t| t.as_str())
        .unwrap_or("API");
    format!("{name} - Swagger UI")
}

fn html(title: &str) -> String {
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@{SWAGGER_UI_VERSION}/swagger-ui.css" />
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@{SWAGGER_UI_VERSION}/swagger-ui-bundle.js"></script>
    <script>
        window.onload = function() {{
            window.ui = SwaggerUIBundle({{
                url: '{DOCS_PATH}/spec.json',
                dom_id: '#swagger-ui',
                deepLinking: true,
            }});
        }};
    </script>
</body>
</html>"##
    )
}
