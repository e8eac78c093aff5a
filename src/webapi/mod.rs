//! HTTP handler layer: the platform surface (Web API compatible endpoints)
//! and the simulator-only surface that the UI drives.

pub mod platform;
pub mod simulator;
pub mod views;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::socketbus::SocketBus;
use crate::state::State;
use axum::body::Bytes;
use axum::http::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared application state handed to every handler via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<State>,
    pub bus: Arc<SocketBus>,
    pub config: Config,
    pub log_tx: broadcast::Sender<Value>,
}

impl AppState {
    pub fn new(state: Arc<State>, bus: Arc<SocketBus>, config: Config) -> Arc<Self> {
        let (log_tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            state,
            bus,
            config,
            log_tx,
        })
    }
}

/// Bearer-token auth for the platform surface. Adopts prefix-strip
/// semantics throughout (the bot id is the token's suffix after
/// `xoxb-`/`xoxp-`), per the design note resolving the source's two
/// disagreeing lookup strategies in favor of the simpler one.
pub fn bot_id_from_headers(headers: &HeaderMap) -> Result<String> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InvalidAuth)?;
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
    for prefix in ["xoxb-", "xoxp-"] {
        if let Some(id) = token.strip_prefix(prefix) {
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }
    Err(Error::InvalidAuth)
}

/// Parses a platform request body that may be `application/json` or
/// `application/x-www-form-urlencoded`. Form fields that look like JSON
/// arrays/objects are parsed as such; everything else stays a string.
pub fn parse_platform_body(headers: &HeaderMap, bytes: &Bytes) -> Result<Value> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.contains("application/json") {
        return serde_json::from_slice(bytes).map_err(|e| Error::InvalidJson(e.to_string()));
    }

    if content_type.contains("application/x-www-form-urlencoded") {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_bytes(bytes).map_err(|e| Error::InvalidJson(e.to_string()))?;
        let mut map = serde_json::Map::new();
        for (key, value) in pairs {
            map.insert(key, decode_form_value(&value));
        }
        return Ok(Value::Object(map));
    }

    if bytes.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    serde_json::from_slice(bytes).map_err(|e| Error::InvalidJson(e.to_string()))
}

fn decode_form_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    let looks_like_json = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'));
    if looks_like_json {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

/// Assigns `block_<index>` to any block missing a `block_id`, wherever
/// blocks are accepted (`chat.postMessage`, `chat.update`).
pub fn assign_block_ids(blocks: &mut Value) {
    if let Some(array) = blocks.as_array_mut() {
        for (index, block) in array.iter_mut().enumerate() {
            if let Some(obj) = block.as_object_mut() {
                obj.entry("block_id")
                    .or_insert_with(|| Value::String(format!("block_{index}")));
            }
        }
    }
}

/// Required-string helper: pulls `field` out of a JSON body. Errors with
/// `missing_argument` if the field is absent (or not a string), and with
/// `missing_required_field` if it's present but empty.
pub fn require_str<'a>(body: &'a Value, field: &'static str) -> Result<&'a str> {
    match body.get(field).and_then(|v| v.as_str()) {
        None => Err(Error::MissingArgument(field)),
        Some(s) if s.is_empty() => Err(Error::MissingRequiredField(field)),
        Some(s) => Ok(s),
    }
}

pub fn optional_str(body: &Value, field: &str) -> Option<String> {
    body.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bot_token_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer xoxb-simple".parse().unwrap(),
        );
        assert_eq!(bot_id_from_headers(&headers).unwrap(), "simple");
    }

    #[test]
    fn rejects_missing_auth() {
        let headers = HeaderMap::new();
        assert!(bot_id_from_headers(&headers).is_err());
    }

    #[test]
    fn decodes_embedded_json_array_in_form_value() {
        let decoded = decode_form_value("[1,2,3]");
        assert_eq!(decoded, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn leaves_plain_strings_alone() {
        let decoded = decode_form_value("hello world");
        assert_eq!(decoded, Value::String("hello world".to_string()));
    }

    #[test]
    fn assigns_missing_block_ids() {
        let mut blocks = serde_json::json!([{"type": "section"}, {"type": "divider", "block_id": "kept"}]);
        assign_block_ids(&mut blocks);
        assert_eq!(blocks[0]["block_id"], "block_0");
        assert_eq!(blocks[1]["block_id"], "kept");
    }

    #[test]
    fn require_str_distinguishes_absent_from_empty() {
        let body = serde_json::json!({"text": ""});
        assert!(matches!(
            require_str(&body, "text"),
            Err(Error::MissingRequiredField("text"))
        ));
        assert!(matches!(
            require_str(&body, "channel"),
            Err(Error::MissingArgument("channel"))
        ));
        assert_eq!(
            require_str(&serde_json::json!({"channel": "C1"}), "channel").unwrap(),
            "C1"
        );
    }
}
