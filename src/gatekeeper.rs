//! Deny-list for privileged backend actions
//!
//! Backends accept administrative actions as ordinary POSTs carrying an
//! `action` field. The gateway buffers POST bodies for the configured paths
//! and refuses the listed actions before they reach the backend.

use crate::config::GatewayConfig;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub struct Gatekeeper {
    deny: HashMap<String, HashSet<String>>,
}

impl Gatekeeper {
    pub fn new(config: &GatewayConfig) -> Self {
        let deny = config
            .deny
            .iter()
            .map(|(path, actions)| {
                (
                    normalize_path(path),
                    actions.iter().cloned().collect(),
                )
            })
            .collect();
        Self { deny }
    }

    /// Whether POSTs to this backend-relative path have their body checked
    pub fn inspects(&self, backend_path: &str) -> bool {
        self.deny.contains_key(&normalize_path(backend_path))
    }

    pub fn is_denied(&self, backend_path: &str, fields: &HashMap<String, String>) -> bool {
        let Some(actions) = self.deny.get(&normalize_path(backend_path)) else {
            return false;
        };
        fields
            .get("action")
            .is_some_and(|action| actions.contains(action))
    }
}

/// Backend routing ignores case, so deny-list keys and request paths
/// are compared lowercased
pub fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_ascii_lowercase()
}

/// Whether a `Content-Encoding` leaves the body readable as sent. Anything
/// else would be inflated by the backend after the deny-list saw it.
pub fn is_identity_encoding(content_encoding: Option<&str>) -> bool {
    content_encoding.map_or(true, |value| {
        value
            .split(',')
            .map(str::trim)
            .all(|coding| coding.is_empty() || coding.eq_ignore_ascii_case("identity"))
    })
}

/// Decode the fields of a POST body. JSON objects contribute their scalar
/// members; anything else is read as a URL-encoded or multipart form.
pub fn parse_fields(content_type: Option<&str>, body: &[u8]) -> HashMap<String, String> {
    let raw = content_type.unwrap_or_default();
    let content_type = raw.to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        return json_fields(body);
    }
    if content_type.starts_with("multipart/form-data") {
        return match boundary(raw) {
            Some(boundary) => multipart_fields(body, &boundary),
            None => HashMap::new(),
        };
    }
    form_fields(body)
}

fn json_fields(body: &[u8]) -> HashMap<String, String> {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Bool(b) => Some((key, b.to_string())),
            Value::Number(n) => Some((key, n.to_string())),
            _ => None,
        })
        .collect()
}

fn form_fields(body: &[u8]) -> HashMap<String, String> {
    let body = String::from_utf8_lossy(body);
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(name, _)| name.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim_matches('"').to_string())
}

fn multipart_fields(body: &[u8], boundary: &str) -> HashMap<String, String> {
    let body = String::from_utf8_lossy(body);
    let delimiter = format!("--{boundary}");
    let mut fields = HashMap::new();

    for part in body.split(delimiter.as_str()) {
        let Some((headers, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        let name = headers
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|line| {
                line.split(';')
                    .filter_map(|param| param.trim().split_once('='))
                    .find(|(key, _)| *key == "name")
                    .map(|(_, name)| name.trim_matches('"').to_string())
            });
        if let Some(name) = name {
            let value = value.strip_suffix("\r\n").unwrap_or(value);
            fields.insert(name, value.to_string());
        }
    }
    fields
}
