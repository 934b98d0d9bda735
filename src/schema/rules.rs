//! The JSON-schema subset shared by Swagger 2.0 and OpenAPI 3 documents.
//!
//! Supported keywords: `$ref` (local only), `type`, `properties`,
//! `required`, `items`, `enum`, `minimum`/`maximum`,
//! `minLength`/`maxLength`, `additionalProperties: false`, `allOf`,
//! `nullable` and `x-nullable`. Anything else is ignored.

use serde_json::{Map, Value};

/// How deep `$ref` chains may go before the document is considered cyclic.
const MAX_DEPTH: usize = 64;

pub(crate) struct Rules<'a> {
    root: &'a Value,
    allow_null: bool,
}

impl<'a> Rules<'a> {
    /// `root` is the whole spec document, used to resolve `$ref`s.
    /// With `allow_null`, `null` satisfies every schema.
    pub(crate) fn new(root: &'a Value, allow_null: bool) -> Self {
        Self { root, allow_null }
    }

    /// Checks `value` against `schema`. `at` names the value in messages,
    /// e.g. `request/body`.
    pub(crate) fn check(&self, schema: &Value, value: &Value, at: &str) -> Result<(), String> {
        self.check_at(schema, value, at, 0)
    }

    /// Follows local `$ref`s until a concrete object is reached.
    pub(crate) fn resolve<'v>(&self, mut node: &'v Value) -> Result<&'v Value, String>
    where
        'a: 'v,
    {
        for _ in 0..MAX_DEPTH {
            let Some(reference) = node.get("$ref").and_then(Value::as_str) else {
                return Ok(node);
            };
            node = reference
                .strip_prefix('#')
                .and_then(|pointer| self.root.pointer(pointer))
                .ok_or_else(|| format!("can't resolve reference {reference}"))?;
        }
        Err("reference chain too deep".to_owned())
    }

    fn check_at(&self, schema: &Value, value: &Value, at: &str, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err(format!("{at}: schema nesting too deep"));
        }
        let schema = self.resolve(schema)?;
        let Some(schema) = schema.as_object() else {
            return Ok(());
        };

        if value.is_null() && self.nullable(schema) {
            return Ok(());
        }

        if let Some(all) = schema.get("allOf").and_then(Value::as_array) {
            for sub in all {
                self.check_at(sub, value, at, depth + 1)?;
            }
        }

        if let Some(ty) = schema.get("type") {
            let allowed: Vec<&str> = match ty {
                Value::String(t) => vec![t.as_str()],
                Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            if !allowed.is_empty() && !allowed.iter().any(|t| is_type(value, t)) {
                return Err(format!("{at} must be {}", allowed.join(",")));
            }
        }

        if let Some(options) = schema.get("enum").and_then(Value::as_array) {
            if !options.iter().any(|o| equal(o, value)) {
                return Err(format!("{at} must be equal to one of the allowed values"));
            }
        }

        match value {
            Value::Number(n) => {
                let Some(n) = n.as_f64() else { return Ok(()) };
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if n < min {
                        return Err(format!("{at} must be >= {min}"));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if n > max {
                        return Err(format!("{at} must be <= {max}"));
                    }
                }
            }
            Value::String(s) => {
                let len = s.chars().count() as u64;
                if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                    if len < min {
                        return Err(format!("{at} must NOT have fewer than {min} characters"));
                    }
                }
                if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                    if len > max {
                        return Err(format!("{at} must NOT have more than {max} characters"));
                    }
                }
            }
            Value::Array(items) => {
                if let Some(item_schema) = schema.get("items") {
                    for (i, item) in items.iter().enumerate() {
                        self.check_at(item_schema, item, &format!("{at}/{i}"), depth + 1)?;
                    }
                }
            }
            Value::Object(fields) => self.check_object(schema, fields, at, depth)?,
            _ => {}
        }
        Ok(())
    }

    fn check_object(
        &self,
        schema: &Map<String, Value>,
        fields: &Map<String, Value>,
        at: &str,
        depth: usize,
    ) -> Result<(), String> {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    return Err(format!("{at} must have required property '{name}'"));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (name, field) in fields {
            match properties.and_then(|p| p.get(name)) {
                Some(field_schema) => {
                    self.check_at(field_schema, field, &format!("{at}/{name}"), depth + 1)?;
                }
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        return Err(format!("{at} must NOT have additional properties"));
                    }
                    Some(extra @ Value::Object(_)) => {
                        self.check_at(extra, field, &format!("{at}/{name}"), depth + 1)?;
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }

    fn nullable(&self, schema: &Map<String, Value>) -> bool {
        self.allow_null
            || schema.get("nullable") == Some(&Value::Bool(true))
            || schema.get("x-nullable") == Some(&Value::Bool(true))
    }
}

fn is_type(value: &Value, ty: &str) -> bool {
    match ty {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        _ => true,
    }
}

/// Enum comparison; `1` and `1.0` are the same number.
fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
