//! Field mapping engine for the custom API dialect.
//!
//! Requests are assembled from canonical parameters and reshaped by a
//! [`RequestMapping`]; responses are flattened through a [`ResponseMapping`]
//! into canonical fields, checked against success conditions, and only then
//! searched for keys.
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ParamTransform, RequestMapping, ResponseMapping};
use crate::error::{Error, Result};
use crate::key::ContentKey;

const DEFAULT_ERROR_FIELDS: [&str; 3] = ["error", "message", "details"];

/// Look up a dot-separated path. Numeric segments index into arrays.
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Apply a named transform. Unknown transforms leave the value unchanged.
pub fn apply_transform(value: Value, transform: &str) -> Result<Value> {
    let out = match (transform, value) {
        ("base64_encode", Value::String(s)) => Value::String(super::b64(s.as_bytes())),
        ("base64_encode", v @ Value::Array(_)) => match value_bytes(&v) {
            Some(bytes) => Value::String(super::b64(&bytes)),
            None => v,
        },
        ("base64_decode", Value::String(s)) => {
            bytes_value(base64::engine::general_purpose::STANDARD.decode(s.trim())?)
        }
        ("hex_encode", Value::String(s)) => Value::String(hex::encode(s.as_bytes())),
        ("hex_encode", v @ Value::Array(_)) => match value_bytes(&v) {
            Some(bytes) => Value::String(hex::encode(bytes)),
            None => v,
        },
        ("hex_decode", Value::String(s)) => bytes_value(hex::decode(s.trim())?),
        ("json_stringify", v) => Value::String(serde_json::to_string(&v)?),
        ("json_parse", Value::String(s)) => serde_json::from_str(&s)?,
        ("parse_key_string", Value::String(s)) => Value::Array(parse_key_string(&s)),
        (_, v) => v,
    };
    Ok(out)
}

/// Decoded bytes stay text when they are UTF-8, otherwise become a byte array.
fn bytes_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(e) => Value::Array(e.into_bytes().into_iter().map(Value::from).collect()),
    }
}

/// Raw bytes carried by a value: base64 text (or plain text) or a byte array.
pub fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(super::decode_challenge(s)),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        _ => None,
    }
}

/// Parse `kid:key` lines, optionally prefixed with `--key `.
pub fn parse_key_string(text: &str) -> Vec<Value> {
    text.lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("--key ").unwrap_or(line))
        .filter_map(|line| line.split_once(':'))
        .map(|(kid, key)| {
            serde_json::json!({
                "kid": kid.trim(),
                "key": key.trim(),
                "type": "CONTENT",
            })
        })
        .collect()
}

fn apply_transforms(params: &mut Map<String, Value>, transforms: &[ParamTransform]) -> Result<()> {
    for t in transforms {
        if let Some(value) = params.remove(&t.param) {
            params.insert(t.param.clone(), apply_transform(value, &t.transform)?);
        }
    }
    Ok(())
}

/// Comparison operators, longest first so `>=` is not read as `>`.
const OPERATORS: [&str; 6] = [" >= ", " <= ", " == ", " != ", " > ", " < "];

/// Split on the leftmost operator; ties go to the longer one.
fn split_condition(condition: &str) -> Option<(&'static str, &str, &str)> {
    let (at, op) = OPERATORS
        .iter()
        .filter_map(|op| condition.find(op).map(|at| (at, *op)))
        .min_by_key(|(at, _)| *at)?;
    Some((
        op.trim(),
        condition[..at].trim(),
        condition[at + op.len()..].trim(),
    ))
}

/// Evaluate a simple predicate against `context`.
///
/// Supported forms: `field exists`, `field == null`, `field != null`, and
/// `field <op> value` with `==`, `!=`, `>`, `>=`, `<`, `<=`. Quotes around
/// the value are ignored; ordering operators compare numerically. Anything
/// else evaluates to false.
pub fn evaluate_condition(condition: &str, context: &Value) -> bool {
    let condition = condition.trim();

    if let Some(field) = condition.strip_suffix(" exists") {
        return lookup(context, field.trim()).is_some();
    }
    if let Some(field) = condition.strip_suffix(" == null") {
        return lookup(context, field.trim()).is_none();
    }
    if let Some(field) = condition.strip_suffix(" != null") {
        return lookup(context, field.trim()).is_some();
    }

    let Some((op, field, expected)) = split_condition(condition) else {
        return false;
    };
    let expected = expected.trim_matches(|c| c == '\'' || c == '"');
    let actual = lookup(context, field);

    match op {
        "==" => actual.is_some_and(|v| value_matches(v, expected)),
        "!=" => !actual.is_some_and(|v| value_matches(v, expected)),
        _ => {
            let (Some(actual), Ok(expected)) = (actual.and_then(as_number), expected.parse::<f64>())
            else {
                return false;
            };
            match op {
                ">=" => actual >= expected,
                "<=" => actual <= expected,
                ">" => actual > expected,
                _ => actual < expected,
            }
        }
    }
}

/// Null counts as absent.
fn lookup<'a>(context: &'a Value, field: &str) -> Option<&'a Value> {
    get_path(context, field).filter(|v| !v.is_null())
}

fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Bool(b) => expected.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            n.to_string() == expected
                || expected.parse::<f64>().ok().zip(n.as_f64()).is_some_and(|(e, a)| e == a)
        }
        other => other.to_string() == expected,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reshape canonical parameters for the wire.
///
/// Steps run in a fixed order: rename, static params, conditional params
/// (evaluated against `context`), transforms, nesting, exclusion.
pub fn build_request_params(
    mapping: &RequestMapping,
    base: Map<String, Value>,
    context: &Value,
) -> Result<Map<String, Value>> {
    let mut params = base;

    let mut renamed = Map::new();
    for (from, to) in mapping.param_names.iter() {
        let (Some(from), Some(to)) = (from.as_str(), to.as_str()) else {
            continue;
        };
        if let Some(value) = params.remove(from) {
            renamed.insert(to.to_string(), value);
        }
    }
    params.extend(renamed);

    params.extend(mapping.static_params.clone());

    for block in &mapping.conditional_params {
        if evaluate_condition(&block.condition, context) {
            params.extend(block.params.clone());
        }
    }

    apply_transforms(&mut params, &mapping.transforms)?;

    for (parent, children) in mapping.nested_params.iter() {
        let Some(parent) = parent.as_str() else {
            continue;
        };
        let nested: Map<String, Value> = children
            .as_sequence()
            .into_iter()
            .flatten()
            .filter_map(|child| child.as_str())
            .filter_map(|child| params.remove(child).map(|v| (child.to_string(), v)))
            .collect();
        if !nested.is_empty() {
            params.insert(parent.to_string(), Value::Object(nested));
        }
    }

    for name in &mapping.exclude_params {
        params.remove(name);
    }

    Ok(params)
}

/// A response flattened into canonical fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub fields: Map<String, Value>,
    /// First matching `response_types` entry.
    pub response_type: Option<String>,
}

impl ParsedResponse {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Whether the API signalled keys it already holds.
    pub fn has_cached_keys(&self) -> bool {
        self.response_type.as_deref() == Some("cached_keys") || self.get("cached_keys").is_some()
    }
}

/// Flatten a raw response and enforce its success conditions.
///
/// With no `fields` configured the top-level object is used as is. A failed
/// success condition yields [`Error::RemoteApi`] carrying whatever the
/// configured error fields contain.
pub fn parse_response(cdm: &str, mapping: &ResponseMapping, raw: &Value) -> Result<ParsedResponse> {
    let mut fields = if mapping.fields.is_empty() {
        raw.as_object().cloned().unwrap_or_default()
    } else {
        let mut fields = Map::new();
        for (name, path) in mapping.fields.iter() {
            let (Some(name), Some(path)) = (name.as_str(), path.as_str()) else {
                continue;
            };
            if let Some(value) = lookup(raw, path) {
                fields.insert(name.to_string(), value.clone());
            }
        }
        fields
    };

    apply_transforms(&mut fields, &mapping.transforms)?;

    // Conditions only see mapped fields.
    let flat = Value::Object(fields);
    let holds = |condition: &str| evaluate_condition(condition, &flat);

    let response_type = mapping
        .response_types
        .iter()
        .find(|rt| holds(&rt.condition))
        .map(|rt| rt.response_type.clone());

    if let Some(failed) = mapping.success_conditions.iter().find(|c| !holds(c)) {
        debug!(cdm, condition = %failed, "success condition not met");
        return Err(Error::RemoteApi(format!(
            "{}: {}",
            cdm,
            error_context(mapping, raw)
        )));
    }

    let fields = match flat {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    Ok(ParsedResponse {
        fields,
        response_type,
    })
}

fn error_context(mapping: &ResponseMapping, raw: &Value) -> String {
    let names: Vec<&str> = match &mapping.error_fields {
        Some(fields) => fields.iter().map(String::as_str).collect(),
        None => DEFAULT_ERROR_FIELDS.to_vec(),
    };
    let mut messages: Vec<String> = Vec::new();
    for name in names {
        let message = match lookup(raw, name) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) | None => continue,
            Some(other) => other.to_string(),
        };
        if !messages.contains(&message) {
            messages.push(message);
        }
    }
    if messages.is_empty() {
        "Unknown error".to_string()
    } else {
        messages.join(" - ")
    }
}

/// Provider field name for a canonical key field, honoring both canonical
/// spellings (`kid`/`key_id`, `key`/`content_key`).
fn key_field<'a>(mapping: &'a ResponseMapping, names: &[&'a str]) -> &'a str {
    names
        .iter()
        .find_map(|n| mapping.key_fields.get(*n).map(String::as_str))
        .unwrap_or(names[0])
}

/// Extract content keys from the canonical field `field`.
///
/// Accepts a list of key objects (remapped through `key_fields`), a list of
/// `kid:key` strings, or a single newline-separated `kid:key` string.
/// Entries missing a KID or key are skipped.
pub fn extract_keys(
    mapping: &ResponseMapping,
    parsed: &ParsedResponse,
    field: &str,
) -> Result<Vec<ContentKey>> {
    let items = match parsed.get(field) {
        None => return Ok(Vec::new()),
        Some(Value::String(s)) => parse_key_string(s),
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| match item {
                Value::String(s) => parse_key_string(s),
                other => vec![other.clone()],
            })
            .collect(),
        Some(object @ Value::Object(_)) => vec![object.clone()],
        Some(_) => return Ok(Vec::new()),
    };

    let kid_field = key_field(mapping, &["kid", "key_id"]);
    let key_field_name = key_field(mapping, &["key", "content_key"]);
    let type_field = key_field(mapping, &["type", "key_type"]);

    let mut keys = Vec::new();
    for item in &items {
        let get = |name: &str| item.get(name).and_then(Value::as_str);
        let (Some(kid), Some(key)) = (get(kid_field), get(key_field_name)) else {
            debug!("skipping key entry without kid or key");
            continue;
        };
        if kid.is_empty() || key.is_empty() {
            continue;
        }
        keys.push(ContentKey::from_hex(kid, key, get(type_field))?);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response_mapping(yaml: &str) -> ResponseMapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn dot_paths_reach_nested_fields_and_array_items() {
        let data = json!({"data": {"keys": [{"kid": "a"}, {"kid": "b"}]}, "message": "success"});
        assert_eq!(get_path(&data, "message"), Some(&json!("success")));
        assert_eq!(get_path(&data, "data.keys.1.kid"), Some(&json!("b")));
        assert_eq!(get_path(&data, "data.missing"), None);
        assert_eq!(get_path(&data, ""), None);
    }

    #[test]
    fn conditions_cover_existence_null_and_comparisons() {
        let ctx = json!({"status": "ok", "count": 3, "flag": true, "gone": null});
        assert!(evaluate_condition("status exists", &ctx));
        assert!(!evaluate_condition("gone exists", &ctx));
        assert!(evaluate_condition("gone == null", &ctx));
        assert!(evaluate_condition("status != null", &ctx));
        assert!(evaluate_condition("status == 'ok'", &ctx));
        assert!(evaluate_condition("status != \"error\"", &ctx));
        assert!(evaluate_condition("flag == True", &ctx));
        assert!(evaluate_condition("count >= 3", &ctx));
        assert!(evaluate_condition("count > 2", &ctx));
        assert!(!evaluate_condition("count < 3", &ctx));
        assert!(evaluate_condition("count == 3", &ctx));
        assert!(!evaluate_condition("status > 1", &ctx));
        assert!(!evaluate_condition("gibberish", &ctx));
    }

    #[test]
    fn request_mapping_runs_every_step_in_order() {
        let mapping: RequestMapping = serde_yaml::from_str(
            r#"
param_names:
  scheme: device
  init_data: pssh
static_params:
  version: 2
conditional_params:
  - condition: "is_playready == true"
    params: {format: wrm}
  - condition: "device_name == 'L1'"
    params: {hw: true}
transforms:
  - param: pssh
    type: hex_encode
nested_params:
  request: [device, pssh]
exclude_params: [service]
"#,
        )
        .unwrap();
        let base: Map<String, Value> = serde_json::from_value(json!({
            "scheme": "L3",
            "init_data": "AA",
            "service": "NF",
        }))
        .unwrap();
        let ctx = json!({"is_playready": true, "device_name": "L3"});
        let params = build_request_params(&mapping, base, &ctx).unwrap();

        assert_eq!(
            Value::Object(params),
            json!({
                "request": {"device": "L3", "pssh": "4141"},
                "version": 2,
                "format": "wrm",
            })
        );
    }

    #[test]
    fn response_fields_are_extracted_by_path() {
        let mapping = response_mapping("fields: {challenge: data.challenge}\n");
        let raw = json!({"data": {"challenge": "XYZ"}});
        let parsed = parse_response("custom", &mapping, &raw).unwrap();
        assert_eq!(parsed.get_str("challenge"), Some("XYZ"));
    }

    #[test]
    fn failed_success_condition_raises_before_key_extraction() {
        let mapping = response_mapping(
            "success_conditions: [\"status == 'ok'\"]\nerror_fields: [error, details]\n",
        );
        let raw = json!({
            "status": "error",
            "error": "quota exceeded",
            "keys": "not even parseable",
        });
        let err = parse_response("custom", &mapping, &raw).unwrap_err();
        match err {
            Error::RemoteApi(msg) => {
                assert!(msg.contains("custom"));
                assert!(msg.contains("quota exceeded"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn mapped_error_field_fails_null_check() {
        let mapping = response_mapping(
            "fields: {error: err.msg, challenge: data.challenge}\nsuccess_conditions: [\"error == null\"]\n",
        );
        let raw = json!({"err": {"msg": "quota exceeded"}, "data": {"challenge": "Q0g="}});
        let err = parse_response("custom", &mapping, &raw).unwrap_err();
        assert!(matches!(err, Error::RemoteApi(_)));

        let ok = json!({"data": {"challenge": "Q0g="}});
        let parsed = parse_response("custom", &mapping, &ok).unwrap();
        assert_eq!(parsed.get_str("challenge"), Some("Q0g="));
    }

    #[test]
    fn raw_paths_are_not_consulted_when_fields_are_mapped() {
        let mapping =
            response_mapping("fields: {state: data.state}\nsuccess_conditions: [\"status == 'ok'\"]\n");
        let raw = json!({"status": "ok", "data": {"state": "failed"}});
        assert!(parse_response("custom", &mapping, &raw).is_err());
    }

    #[test]
    fn leftmost_operator_splits_the_condition() {
        let ctx = json!({"message": "a >= b", "count": 5});
        assert!(evaluate_condition("message == 'a >= b'", &ctx));
        assert!(!evaluate_condition("message != 'a >= b'", &ctx));
        assert!(evaluate_condition("count >= 5", &ctx));
        assert!(!evaluate_condition("count > 5", &ctx));
    }

    #[test]
    fn unknown_error_when_no_error_fields_present() {
        let mapping = response_mapping("success_conditions: [\"message == 'success'\"]\n");
        let err = parse_response("c", &mapping, &json!({"message": ""})).unwrap_err();
        assert!(err.to_string().contains("Unknown error"));
    }

    #[test]
    fn response_type_is_first_matching_condition() {
        let mapping = response_mapping(
            r#"
fields: {challenge: data.challenge, cached: data.cached}
response_types:
  - {condition: "cached exists", type: cached_keys}
  - {condition: "challenge exists", type: license_request}
"#,
        );
        let parsed =
            parse_response("c", &mapping, &json!({"data": {"challenge": "Q0g="}})).unwrap();
        assert_eq!(parsed.response_type.as_deref(), Some("license_request"));
        assert!(!parsed.has_cached_keys());
    }

    #[test]
    fn keys_are_remapped_through_key_fields() {
        let mapping = response_mapping(
            r#"
fields: {keys: result.keys}
key_fields: {key_id: id, content_key: value}
"#,
        );
        let raw = json!({"result": {"keys": [
            {"id": "00000000000000000000000000000001", "value": "0102"},
            {"id": "", "value": "ff"},
            {"value": "ff"},
        ]}});
        let parsed = parse_response("c", &mapping, &raw).unwrap();
        let keys = extract_keys(&mapping, &parsed, "keys").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid_hex(), "00000000000000000000000000000001");
        assert_eq!(keys[0].key, vec![1, 2]);
        assert!(keys[0].is_content());
    }

    #[test]
    fn key_strings_are_parsed() {
        let mapping = ResponseMapping::default();
        let raw = json!({
            "keys": "--key 00000000000000000000000000000001:aa\n00000000000000000000000000000002:bb\n",
        });
        let parsed = parse_response("c", &mapping, &raw).unwrap();
        let keys = extract_keys(&mapping, &parsed, "keys").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].key, vec![0xbb]);

        let listed = json!({"keys": ["00000000000000000000000000000003:cc"]});
        let parsed = parse_response("c", &mapping, &listed).unwrap();
        assert_eq!(extract_keys(&mapping, &parsed, "keys").unwrap().len(), 1);
    }

    #[test]
    fn transforms_round_trip_between_text_and_bytes() {
        assert_eq!(apply_transform(json!("hi"), "base64_encode").unwrap(), json!("aGk="));
        assert_eq!(apply_transform(json!("aGk="), "base64_decode").unwrap(), json!("hi"));
        assert_eq!(apply_transform(json!("6869"), "hex_decode").unwrap(), json!("hi"));
        assert_eq!(
            apply_transform(json!("ff00"), "hex_decode").unwrap(),
            json!([255, 0])
        );
        assert_eq!(apply_transform(json!([255, 0]), "hex_encode").unwrap(), json!("ff00"));
        assert_eq!(
            apply_transform(json!({"a": 1}), "json_stringify").unwrap(),
            json!("{\"a\":1}")
        );
        assert_eq!(
            apply_transform(json!("{\"a\":1}"), "json_parse").unwrap(),
            json!({"a": 1})
        );
        assert_eq!(apply_transform(json!(5), "no_such_transform").unwrap(), json!(5));
    }
}
