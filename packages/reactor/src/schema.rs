//! JSON-Schema matching with the `$$links` link-graph extension.
//!
//! `$$links` maps a link verb to a schema; it is satisfied when at least one
//! contract under `value.links[verb]` matches that schema. The store is
//! responsible for populating `links` before matching.

use std::sync::OnceLock;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Whether `value` satisfies `schema`.
pub fn matches(schema: &Value, value: &Value) -> bool {
    let mut errors = Vec::new();
    check(schema, value, "", &mut errors);
    errors.is_empty()
}

/// Validate `value` against `schema`, collecting every violation.
pub fn validate(schema: &Value, value: &Value) -> Validation {
    let mut errors = Vec::new();
    check(schema, value, "", &mut errors);
    Validation {
        valid: errors.is_empty(),
        errors,
    }
}

/// Whether a schema uses the `$$links` extension at its top level.
pub fn has_links(schema: &Value) -> bool {
    schema.get("$$links").is_some()
}

fn regex_cache() -> &'static DashMap<String, Regex> {
    static CACHE: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

fn pattern_matches(pattern: &str, text: &str) -> Option<bool> {
    if let Some(regex) = regex_cache().get(pattern) {
        return Some(regex.is_match(text));
    }
    let regex = Regex::new(pattern).ok()?;
    let result = regex.is_match(text);
    regex_cache().insert(pattern.to_string(), regex);
    Some(result)
}

/// Equality that treats `1` and `1.0` as the same number.
pub(crate) fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| json_eq(a, b)))
        }
        _ => a == b,
    }
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        _ => false,
    }
}

fn child_path(path: &str, key: &str) -> String {
    format!("{}/{}", path, key.replace('~', "~0").replace('/', "~1"))
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let schema = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            errors.push(format!("{}: no value is allowed", display_path(path)));
            return;
        }
        Value::Object(schema) => schema,
        _ => return,
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(name) => type_matches(name, value),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(|name| type_matches(name, value)),
            _ => true,
        };
        if !ok {
            errors.push(format!(
                "{}: should be of type {}",
                display_path(path),
                expected
            ));
            return;
        }
    }

    if let Some(constant) = schema.get("const") {
        if !json_eq(constant, value) {
            errors.push(format!("{}: should be equal to {}", display_path(path), constant));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.iter().any(|option| json_eq(option, value)) {
            errors.push(format!(
                "{}: should be one of {}",
                display_path(path),
                Value::Array(options.clone())
            ));
        }
    }

    match value {
        Value::Object(object) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(Value::as_str) {
                    if !object.contains_key(key) {
                        errors.push(format!(
                            "{}: should have required property '{}'",
                            display_path(path),
                            key
                        ));
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (key, subschema) in properties {
                    if let Some(child) = object.get(key) {
                        check(subschema, child, &child_path(path, key), errors);
                    }
                }
            }

            if let Some(additional) = schema.get("additionalProperties") {
                for (key, child) in object {
                    if properties.is_some_and(|p| p.contains_key(key)) {
                        continue;
                    }
                    match additional {
                        Value::Bool(false) => errors.push(format!(
                            "{}: should not have additional property '{}'",
                            display_path(path),
                            key
                        )),
                        other => check(other, child, &child_path(path, key), errors),
                    }
                }
            }
        }
        Value::Array(items) => {
            match schema.get("items") {
                Some(Value::Array(tuple)) => {
                    for (index, (subschema, item)) in tuple.iter().zip(items).enumerate() {
                        check(subschema, item, &child_path(path, &index.to_string()), errors);
                    }
                }
                Some(subschema) => {
                    for (index, item) in items.iter().enumerate() {
                        check(subschema, item, &child_path(path, &index.to_string()), errors);
                    }
                }
                None => {}
            }

            if let Some(subschema) = schema.get("contains") {
                if !items.iter().any(|item| matches(subschema, item)) {
                    errors.push(format!(
                        "{}: should contain a matching item",
                        display_path(path)
                    ));
                }
            }
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    errors.push(format!(
                        "{}: should not have fewer than {} items",
                        display_path(path),
                        min
                    ));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if (items.len() as u64) > max {
                    errors.push(format!(
                        "{}: should not have more than {} items",
                        display_path(path),
                        max
                    ));
                }
            }
            if schema.get("uniqueItems") == Some(&Value::Bool(true)) {
                let duplicated = items
                    .iter()
                    .enumerate()
                    .any(|(i, a)| items[i + 1..].iter().any(|b| json_eq(a, b)));
                if duplicated {
                    errors.push(format!(
                        "{}: should not have duplicate items",
                        display_path(path)
                    ));
                }
            }
        }
        Value::String(text) => {
            let length = text.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if length < min {
                    errors.push(format!(
                        "{}: should not be shorter than {} characters",
                        display_path(path),
                        min
                    ));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if length > max {
                    errors.push(format!(
                        "{}: should not be longer than {} characters",
                        display_path(path),
                        max
                    ));
                }
            }
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                match pattern_matches(pattern, text) {
                    Some(true) => {}
                    Some(false) => errors.push(format!(
                        "{}: should match pattern \"{}\"",
                        display_path(path),
                        pattern
                    )),
                    None => errors.push(format!(
                        "{}: invalid pattern \"{}\"",
                        display_path(path),
                        pattern
                    )),
                }
            }
            if let Some(format) = schema.get("format").and_then(Value::as_str) {
                let ok = match format {
                    "uuid" => uuid::Uuid::parse_str(text).is_ok(),
                    "date-time" => chrono::DateTime::parse_from_rfc3339(text).is_ok(),
                    "email" => text.contains('@'),
                    _ => true,
                };
                if !ok {
                    errors.push(format!(
                        "{}: should match format \"{}\"",
                        display_path(path),
                        format
                    ));
                }
            }
        }
        Value::Number(number) => {
            if let Some(n) = number.as_f64() {
                let bound = |key: &str| schema.get(key).and_then(Value::as_f64);
                if let Some(min) = bound("minimum") {
                    if n < min {
                        errors.push(format!("{}: should be >= {}", display_path(path), min));
                    }
                }
                if let Some(max) = bound("maximum") {
                    if n > max {
                        errors.push(format!("{}: should be <= {}", display_path(path), max));
                    }
                }
                if let Some(min) = bound("exclusiveMinimum") {
                    if n <= min {
                        errors.push(format!("{}: should be > {}", display_path(path), min));
                    }
                }
                if let Some(max) = bound("exclusiveMaximum") {
                    if n >= max {
                        errors.push(format!("{}: should be < {}", display_path(path), max));
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(subschema) = schema.get("not") {
        if matches(subschema, value) {
            errors.push(format!(
                "{}: should not match {}",
                display_path(path),
                subschema
            ));
        }
    }

    if let Some(Value::Array(all)) = schema.get("allOf") {
        for subschema in all {
            check(subschema, value, path, errors);
        }
    }

    if let Some(Value::Array(any)) = schema.get("anyOf") {
        if !any.iter().any(|subschema| matches(subschema, value)) {
            errors.push(format!(
                "{}: should match some schema in anyOf",
                display_path(path)
            ));
        }
    }

    if let Some(Value::Array(one)) = schema.get("oneOf") {
        let count = one.iter().filter(|subschema| matches(subschema, value)).count();
        if count != 1 {
            errors.push(format!(
                "{}: should match exactly one schema in oneOf, matched {}",
                display_path(path),
                count
            ));
        }
    }

    if let Some(Value::Object(verbs)) = schema.get("$$links") {
        for (verb, subschema) in verbs {
            let linked = value
                .get("links")
                .and_then(|links| links.get(verb))
                .and_then(Value::as_array);
            let found = linked.is_some_and(|items| items.iter().any(|item| matches(subschema, item)));
            if !found {
                errors.push(format!(
                    "{}: should be linked via '{}' to a matching contract",
                    display_path(path),
                    verb
                ));
            }
        }
    }
}
