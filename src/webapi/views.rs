//! View-submission value transformation: the UI submits raw
//! `blockId -> actionId -> rawValue` form values; this module rewrites each
//! value into the platform's canonical per-element shape before dispatch.

use crate::error::Result;
use crate::ids;
use crate::model::FileMeta;
use crate::state::State;
use base64::Engine as _;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

struct ElementInfo {
    element_type: String,
    options: Option<Vec<Value>>,
}

fn index_elements(view: &Value) -> HashMap<(String, String), ElementInfo> {
    let mut index = HashMap::new();
    let Some(blocks) = view.get("blocks").and_then(|v| v.as_array()) else {
        return index;
    };
    for block in blocks {
        let Some(block_id) = block.get("block_id").and_then(|v| v.as_str()) else {
            continue;
        };
        let mut elements = Vec::new();
        if let Some(element) = block.get("element") {
            elements.push(element);
        }
        if let Some(array) = block.get("elements").and_then(|v| v.as_array()) {
            elements.extend(array.iter());
        }
        for element in elements {
            let Some(action_id) = element.get("action_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(element_type) = element.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            let options = element
                .get("options")
                .or_else(|| element.get("option_groups"))
                .and_then(|v| v.as_array())
                .cloned();
            index.insert(
                (block_id.to_string(), action_id.to_string()),
                ElementInfo {
                    element_type: element_type.to_string(),
                    options,
                },
            );
        }
    }
    index
}

/// Rewrites `raw_values` (`{blockId: {actionId: rawValue}}`) into the
/// platform's canonical shape, consulting `view` to learn each field's
/// element type and option set. `file_input` values carrying embedded
/// `dataUrl`s are stored via `state` and replaced with `{id: storedId}`.
pub async fn transform_values(state: &State, view: &Value, raw_values: &Value) -> Result<Value> {
    let index = index_elements(view);
    let mut output = Map::new();

    let Some(blocks) = raw_values.as_object() else {
        return Ok(Value::Object(output));
    };

    for (block_id, actions) in blocks {
        let Some(actions) = actions.as_object() else {
            continue;
        };
        let mut out_actions = Map::new();
        for (action_id, raw) in actions {
            let key = (block_id.clone(), action_id.clone());
            let transformed = match index.get(&key) {
                Some(info) => transform_one(state, info, raw).await?,
                None => raw.clone(),
            };
            out_actions.insert(action_id.clone(), transformed);
        }
        output.insert(block_id.clone(), Value::Object(out_actions));
    }

    Ok(Value::Object(output))
}

async fn transform_one(state: &State, info: &ElementInfo, raw: &Value) -> Result<Value> {
    match info.element_type.as_str() {
        "plain_text_input" => {
            let mut out = raw.clone();
            set_type(&mut out, &info.element_type);
            Ok(out)
        }
        "static_select" | "radio_buttons" | "static_multi_select" => {
            let raw_value = raw.get("value").and_then(|v| v.as_str()).unwrap_or("");
            let option = info
                .options
                .as_ref()
                .and_then(|options| {
                    options
                        .iter()
                        .find(|o| o.get("value").and_then(|v| v.as_str()) == Some(raw_value))
                })
                .cloned()
                .unwrap_or_else(|| json!({"value": raw_value}));
            Ok(json!({"selected_option": option, "type": info.element_type}))
        }
        "checkboxes" => {
            let mut out = raw.clone();
            set_type(&mut out, &info.element_type);
            Ok(out)
        }
        "datepicker" => Ok(json!({
            "selected_date": raw.get("value").cloned().unwrap_or(Value::Null),
            "type": info.element_type,
        })),
        "timepicker" => Ok(json!({
            "selected_time": raw.get("value").cloned().unwrap_or(Value::Null),
            "type": info.element_type,
        })),
        "datetimepicker" => Ok(json!({
            "selected_date_time": raw.get("value").cloned().unwrap_or(Value::Null),
            "type": info.element_type,
        })),
        "file_input" => store_file_input(state, raw).await,
        _ => {
            let mut out = raw.clone();
            set_type(&mut out, &info.element_type);
            Ok(out)
        }
    }
}

fn set_type(value: &mut Value, element_type: &str) {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("type".to_string(), Value::String(element_type.to_string()));
    }
}

async fn store_file_input(state: &State, raw: &Value) -> Result<Value> {
    let mut stored_files = Vec::new();
    if let Some(files) = raw.get("files").and_then(|v| v.as_array()) {
        for file in files {
            if let Some(data_url) = file.get("dataUrl").and_then(|v| v.as_str()) {
                if let Some((mimetype, bytes)) = decode_data_url(data_url) {
                    let name = file
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("upload")
                        .to_string();
                    let id = ids::file_id();
                    let meta = FileMeta {
                        id: id.clone(),
                        name,
                        title: None,
                        mimetype,
                        size: bytes.len() as u64,
                        url_private: None,
                        channels: Vec::new(),
                        user: None,
                        is_expanded: false,
                    };
                    state.save_file(meta, &bytes).await?;
                    stored_files.push(json!({"id": id}));
                    continue;
                }
            }
            stored_files.push(file.clone());
        }
    }
    Ok(json!({"files": stored_files, "type": "file_input"}))
}

fn decode_data_url(data_url: &str) -> Option<(String, Vec<u8>)> {
    let rest = data_url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mimetype = header.split(';').next().unwrap_or("application/octet-stream");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()?;
    Some((mimetype.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persistence;

    fn sample_view() -> Value {
        json!({
            "blocks": [
                {
                    "block_id": "b1",
                    "element": {"type": "static_select", "action_id": "a1", "options": [
                        {"text": {"type": "plain_text", "text": "One"}, "value": "one"},
                        {"text": {"type": "plain_text", "text": "Two"}, "value": "two"},
                    ]},
                },
                {
                    "block_id": "b2",
                    "element": {"type": "plain_text_input", "action_id": "a2"},
                },
            ]
        })
    }

    #[tokio::test]
    async fn rewrites_static_select_to_selected_option() {
        let state = State::new(Persistence::disabled());
        let raw = json!({"b1": {"a1": {"value": "two"}}});
        let out = transform_values(&state, &sample_view(), &raw).await.unwrap();
        assert_eq!(out["b1"]["a1"]["type"], "static_select");
        assert_eq!(out["b1"]["a1"]["selected_option"]["value"], "two");
    }

    #[tokio::test]
    async fn plain_text_input_only_gains_a_type_tag() {
        let state = State::new(Persistence::disabled());
        let raw = json!({"b2": {"a2": {"value": "hello"}}});
        let out = transform_values(&state, &sample_view(), &raw).await.unwrap();
        assert_eq!(out["b2"]["a2"]["type"], "plain_text_input");
        assert_eq!(out["b2"]["a2"]["value"], "hello");
    }
}
