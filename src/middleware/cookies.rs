//! Cookie parsing stage.

use http::header::COOKIE;

use super::{BoxFuture, Flow, Middleware, Next};
use crate::request::Request;

/// Parses every `Cookie` header into [`Request::cookies`].
///
/// When a name repeats, the first occurrence wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct CookieParser;

impl CookieParser {
    fn parse(req: &mut Request) {
        for value in req.headers.get_all(COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for pair in value.split(';') {
                let Some((name, value)) = pair.split_once('=') else { continue };
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                req.cookies
                    .entry(name.to_owned())
                    .or_insert_with(|| value.to_owned());
            }
        }
    }
}

impl Middleware for CookieParser {
    fn name(&self) -> &'static str { "cookie_parser" }

    fn handle<'a>(&'a self, mut req: Request, next: Next<'a>) -> BoxFuture<'a, Flow> {
        Self::parse(&mut req);
        next.run(req)
    }
}
