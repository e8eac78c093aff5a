//! Simulator-only endpoints: everything the UI drives directly rather than
//! what a bot would call through the platform surface.

use super::views::transform_values;
use super::AppState;
use crate::error::{Error, Result};
use crate::model::Message;
use crate::state::Event;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;

fn ok(mut fields: Value) -> Json<Value> {
    if let Some(obj) = fields.as_object_mut() {
        obj.insert("ok".to_string(), Value::Bool(true));
    }
    Json(fields)
}

fn message_json(message: &Message) -> Value {
    let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
    value["type"] = json!("message");
    value
}

/// SSE stream of every state-change event, prefixed by a `connected`
/// control message.
pub async fn events_sse(
    State(app): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let mut rx = app.state.subscribe();

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().event("connected").data("{}"));
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(SseEvent::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    tracing::debug!(count, "SSE client lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new())
}

pub async fn logs_sse(
    State(app): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let mut rx = app.log_tx.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(record) => yield Ok(SseEvent::default().data(record.to_string())),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new())
}

/// Accepts a pushed log record from an external process and rebroadcasts
/// it to every `/logs` subscriber.
pub async fn logs_post(State(app): State<Arc<AppState>>, Json(record): Json<Value>) -> Json<Value> {
    let _ = app.log_tx.send(record);
    ok(json!({}))
}

pub async fn settings_get(State(app): State<Arc<AppState>>) -> Json<Value> {
    Json(app.state.settings_for_bot("__global__").await)
}

pub async fn settings_post(
    State(app): State<Arc<AppState>>,
    Json(settings): Json<Value>,
) -> Result<Json<Value>> {
    let parsed = serde_json::from_value(settings).map_err(|e| Error::InvalidJson(e.to_string()))?;
    let first_push = app.state.push_settings(parsed).await;
    if !first_push {
        app.bus
            .dispatch_disconnect_all("Settings changed — please restart")
            .await;
    }
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
pub struct UserMessageBody {
    text: String,
    channel: String,
    #[serde(default)]
    user: Option<String>,
}

pub async fn user_message(
    State(app): State<Arc<AppState>>,
    Json(body): Json<UserMessageBody>,
) -> Result<Json<Value>> {
    let user = body
        .user
        .unwrap_or_else(|| crate::model::SIMULATED_USER.to_string());
    let message = Message {
        ts: String::new(),
        channel: body.channel.clone(),
        user,
        text: body.text.clone(),
        thread_ts: None,
        subtype: None,
        blocks: None,
        reactions: Vec::new(),
        file: None,
    };
    let stored = app.state.add_message(message).await?;

    app.bus
        .dispatch(
            "events_api",
            json!({
                "type": "event_callback",
                "event": message_json(&stored),
            }),
            false,
            None,
        )
        .await;

    if !crate::model::Channel::is_dm(&body.channel) {
        for bot in app.state.list_connected_bots().await {
            let mentioned = bot
                .name()
                .map(|n| body.text.contains(&format!("@{n}")))
                .unwrap_or(false)
                || body.text.contains(&format!("@{}", bot.id));
            if mentioned {
                app.bus
                    .dispatch(
                        "events_api",
                        json!({
                            "type": "event_callback",
                            "event": {
                                "type": "app_mention",
                                "ts": stored.ts,
                                "channel": stored.channel,
                                "user": stored.user,
                                "text": stored.text,
                            },
                        }),
                        false,
                        Some(&bot.id),
                    )
                    .await;
            }
        }
    }

    Ok(ok(json!({"ts": stored.ts})))
}

pub async fn messages_list(State(app): State<Arc<AppState>>) -> Json<Value> {
    let messages = app.state.all_messages().await;
    ok(json!({"messages": messages.iter().map(message_json).collect::<Vec<_>>()}))
}

pub async fn messages_seed(
    State(app): State<Arc<AppState>>,
    Json(messages): Json<Vec<Message>>,
) -> Json<Value> {
    app.state.seed_messages(messages).await;
    ok(json!({}))
}

pub async fn messages_clear(State(app): State<Arc<AppState>>) -> Json<Value> {
    for message in app.state.all_messages().await {
        app.state.delete_message(&message.ts).await;
    }
    ok(json!({}))
}

pub async fn messages_delete_one(
    State(app): State<Arc<AppState>>,
    Path(ts): Path<String>,
) -> Result<Json<Value>> {
    let channel = app
        .state
        .all_messages()
        .await
        .into_iter()
        .find(|m| m.ts == ts)
        .map(|m| m.channel);
    if !app.state.delete_message(&ts).await {
        return Err(Error::MessageNotFound);
    }
    if let Some(channel) = channel {
        app.state.emit_event(Event::MessageDelete { channel, ts });
    }
    Ok(ok(json!({})))
}

pub async fn channels_clear_messages(
    State(app): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Json<Value> {
    app.state.clear_channel_messages(&channel_id).await;
    ok(json!({}))
}

pub async fn channels_list(State(app): State<Arc<AppState>>) -> Json<Value> {
    ok(json!({"channels": app.state.list_channels().await}))
}

#[derive(Deserialize)]
pub struct CreateChannelBody {
    name: String,
}

pub async fn channels_create(
    State(app): State<Arc<AppState>>,
    Json(body): Json<CreateChannelBody>,
) -> Result<Json<Value>> {
    let channel = app.state.create_channel(&body.name).await?;
    Ok(ok(json!({"channel": channel})))
}

pub async fn channels_delete(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    app.state.delete_channel(&id).await?;
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
pub struct SlashCommandBody {
    command: String,
    #[serde(default)]
    text: String,
    user_id: String,
    channel_id: String,
    #[serde(default)]
    bot_id: Option<String>,
}

pub async fn slash_command(
    State(app): State<Arc<AppState>>,
    Json(body): Json<SlashCommandBody>,
) -> Json<Value> {
    let trigger_id = app
        .state
        .create_trigger_context(body.user_id.clone(), Some(body.channel_id.clone()), None, None)
        .await;
    let payload = json!({
        "command": body.command,
        "text": body.text,
        "user_id": body.user_id,
        "channel_id": body.channel_id,
        "trigger_id": trigger_id,
        "response_url": format!("/api/simulator/response_url/{trigger_id}"),
    });
    app.bus
        .dispatch("slash_commands", payload, false, body.bot_id.as_deref())
        .await;
    ok(json!({}))
}

#[derive(Deserialize)]
pub struct ViewSubmitBody {
    view_id: String,
    values: Value,
    user_id: String,
}

/// Does **not** close the view automatically; the bot's ack decides.
pub async fn view_submit(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ViewSubmitBody>,
) -> Result<Json<Value>> {
    let view = app.state.get_view(&body.view_id).await.ok_or(Error::ViewNotFound)?;
    let transformed = transform_values(&app.state, &view.view, &body.values).await?;

    let payload = json!({
        "type": "view_submission",
        "view": view.view_with_id(),
        "user": {"id": body.user_id},
        "values": transformed,
    });

    let acks = app
        .bus
        .dispatch("interactive", payload, true, Some(&view.bot_id))
        .await;

    for (_, ack) in acks {
        let Some(ack) = ack else { continue };
        match ack.get("response_action").and_then(|v| v.as_str()) {
            Some("update") => {
                if let Some(new_view) = ack.get("view").cloned() {
                    let _ = app.state.update_view(&body.view_id, new_view).await;
                }
            }
            Some("errors") => {}
            Some("clear") | None => {
                app.state.close_view(&body.view_id).await;
            }
            _ => {}
        }
    }

    Ok(ok(json!({})))
}

#[derive(Deserialize)]
pub struct ViewCloseBody {
    view_id: String,
}

pub async fn view_close(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ViewCloseBody>,
) -> Result<Json<Value>> {
    let view = app.state.get_view(&body.view_id).await.ok_or(Error::ViewNotFound)?;
    app.bus
        .dispatch(
            "interactive",
            json!({"type": "view_closed", "view": view.view_with_id()}),
            false,
            Some(&view.bot_id),
        )
        .await;
    app.state.close_view(&body.view_id).await;
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
pub struct BlockActionBody {
    action_id: String,
    element_type: String,
    user_id: String,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    view_id: Option<String>,
    #[serde(default)]
    message_ts: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    selected_option: Option<Value>,
    #[serde(default)]
    selected_options: Option<Value>,
    #[serde(default)]
    selected_date: Option<Value>,
    #[serde(default)]
    selected_time: Option<Value>,
    #[serde(default)]
    selected_date_time: Option<Value>,
}

pub async fn block_action(
    State(app): State<Arc<AppState>>,
    Json(body): Json<BlockActionBody>,
) -> Result<Json<Value>> {
    let mut action = json!({"action_id": body.action_id, "type": body.element_type});
    match body.element_type.as_str() {
        "button" => {
            action["value"] = body.value.clone().unwrap_or(Value::Null);
        }
        "static_select" | "overflow" | "radio_buttons" => {
            action["selected_option"] = body.selected_option.clone().unwrap_or(Value::Null);
        }
        "checkboxes" => {
            action["selected_options"] = body.selected_options.clone().unwrap_or(Value::Array(vec![]));
        }
        "datepicker" => {
            action["selected_date"] = body.selected_date.clone().unwrap_or(Value::Null);
        }
        "timepicker" => {
            action["selected_time"] = body.selected_time.clone().unwrap_or(Value::Null);
        }
        "datetimepicker" => {
            action["selected_date_time"] = body.selected_date_time.clone().unwrap_or(Value::Null);
        }
        _ => {}
    }

    let (target_bot, mut payload) = if let Some(view_id) = &body.view_id {
        let view = app.state.get_view(view_id).await.ok_or(Error::ViewNotFound)?;
        (
            view.bot_id.clone(),
            json!({"type": "block_actions", "actions": [action], "view": view.view_with_id()}),
        )
    } else {
        let channel = body.channel_id.clone().ok_or(Error::MissingArgument("channel_id"))?;
        let ts = body.message_ts.clone().ok_or(Error::MissingArgument("message_ts"))?;
        let bot_id = body.bot_id.clone().ok_or(Error::MissingArgument("bot_id"))?;
        (
            bot_id,
            json!({
                "type": "block_actions",
                "actions": [action],
                "message": {"ts": ts, "channel": channel},
            }),
        )
    };
    payload["user"] = json!({"id": body.user_id});

    app.bus
        .dispatch("interactive", payload, true, Some(&target_bot))
        .await;
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
pub struct ShortcutBody {
    callback_id: String,
    user_id: String,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
}

pub async fn shortcut(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ShortcutBody>,
) -> Json<Value> {
    let trigger_id = app
        .state
        .create_trigger_context(body.user_id.clone(), body.channel_id.clone(), None, None)
        .await;
    let payload = json!({
        "type": "shortcut",
        "callback_id": body.callback_id,
        "trigger_id": trigger_id,
        "user": {"id": body.user_id},
    });
    app.bus
        .dispatch("interactive", payload, false, body.bot_id.as_deref())
        .await;
    ok(json!({}))
}

pub async fn file_upload(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let data = if content_type.starts_with("multipart/") {
        extract_first_multipart_field(content_type, &bytes).unwrap_or_else(|| bytes.to_vec())
    } else {
        bytes.to_vec()
    };
    app.state.fill_pending_upload(&file_id, data).await?;
    Ok(ok(json!({"file_id": file_id})))
}

/// Minimal multipart body-field extraction for raw-bytes upload bodies;
/// the full `files.uploadV2` flow instead uses axum's `Multipart`
/// extractor directly.
fn extract_first_multipart_field(content_type: &str, bytes: &[u8]) -> Option<Vec<u8>> {
    let boundary = content_type.split("boundary=").nth(1)?;
    let marker = format!("--{boundary}").into_bytes();
    let body = bytes;
    let first = find_subslice(body, &marker)?;
    let rest = &body[first + marker.len()..];
    let header_end = find_subslice(rest, b"\r\n\r\n")? + 4;
    let content = &rest[header_end..];
    let end = find_subslice(content, &marker).unwrap_or(content.len());
    Some(content[..end.saturating_sub(2)].to_vec())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub async fn files_get(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Response> {
    let meta = app.state.get_file(&file_id).await.ok_or(Error::FileNotFound)?;
    let bytes = app.state.read_file_bytes(&file_id).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, meta.mimetype.clone()),
            (header::CACHE_CONTROL, "private, max-age=31536000".to_string()),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct FilePatchBody {
    #[serde(rename = "isExpanded")]
    is_expanded: bool,
}

pub async fn files_patch(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    Json(body): Json<FilePatchBody>,
) -> Result<Json<Value>> {
    let file = app.state.set_file_expanded(&file_id, body.is_expanded).await?;
    Ok(ok(json!({"file": file})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::persistence::Persistence;
    use crate::socketbus::SocketBus;
    use crate::state::State as AppStateModel;

    fn app_state() -> Arc<AppState> {
        let state = AppStateModel::new(Persistence::disabled());
        let bus = SocketBus::new(state.clone());
        AppState::new(
            state,
            bus,
            Config {
                port: 0,
                data_dir: None,
            },
        )
    }

    #[tokio::test]
    async fn messages_seed_list_and_clear_round_trip() {
        let app = app_state();
        let seeded = vec![Message {
            ts: "100.000001".to_string(),
            channel: "C_GENERAL".to_string(),
            user: "U_simple".to_string(),
            text: "seeded".to_string(),
            thread_ts: None,
            subtype: None,
            blocks: None,
            reactions: Vec::new(),
            file: None,
        }];
        messages_seed(State(app.clone()), Json(seeded)).await;

        let listed = messages_list(State(app.clone())).await;
        let messages = listed.0["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["text"], "seeded");

        messages_clear(State(app.clone())).await;
        let listed = messages_list(State(app)).await;
        assert!(listed.0["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_delete_one_missing_ts_is_an_error() {
        let app = app_state();
        let result = messages_delete_one(State(app), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(Error::MessageNotFound)));
    }

    #[tokio::test]
    async fn channels_create_then_delete() {
        let app = app_state();
        let created = channels_create(
            State(app.clone()),
            Json(CreateChannelBody {
                name: "random".to_string(),
            }),
        )
        .await
        .unwrap();
        let channel_id = created.0["channel"]["id"].as_str().unwrap().to_string();

        let listed = channels_list(State(app.clone())).await;
        assert!(
            listed.0["channels"]
                .as_array()
                .unwrap()
                .iter()
                .any(|c| c["id"] == channel_id)
        );

        channels_delete(State(app.clone()), Path(channel_id.clone())).await.unwrap();
        let listed = channels_list(State(app)).await;
        assert!(
            !listed.0["channels"]
                .as_array()
                .unwrap()
                .iter()
                .any(|c| c["id"] == channel_id)
        );
    }

    #[tokio::test]
    async fn user_message_stores_and_emits_a_message_event() {
        let app = app_state();
        let mut events = app.state.subscribe();
        let posted = user_message(
            State(app.clone()),
            Json(UserMessageBody {
                text: "hey there".to_string(),
                channel: "C_GENERAL".to_string(),
                user: None,
            }),
        )
        .await
        .unwrap();

        let ts = posted.0["ts"].as_str().unwrap().to_string();
        let first = events.recv().await.unwrap();
        assert!(matches!(first, Event::Message(m) if m.ts == ts));
    }

    #[tokio::test]
    async fn block_action_without_view_or_channel_context_is_an_error() {
        let app = app_state();
        let body = BlockActionBody {
            action_id: "a1".to_string(),
            element_type: "button".to_string(),
            user_id: "U_simulated".to_string(),
            bot_id: None,
            view_id: None,
            message_ts: None,
            channel_id: None,
            value: None,
            selected_option: None,
            selected_options: None,
            selected_date: None,
            selected_time: None,
            selected_date_time: None,
        };
        let result = block_action(State(app), Json(body)).await;
        assert!(matches!(result, Err(Error::MissingArgument(_))));
    }

    #[tokio::test]
    async fn shortcut_creates_a_consumable_trigger_context() {
        let app = app_state();
        shortcut(
            State(app.clone()),
            Json(ShortcutBody {
                callback_id: "demo".to_string(),
                user_id: "U_simulated".to_string(),
                channel_id: Some("C_GENERAL".to_string()),
                bot_id: None,
            }),
        )
        .await;

        // The trigger_id isn't returned to the caller directly (it goes out
        // over the bus), so this only confirms the handler ran without a
        // connected bot to dispatch to.
        assert!(app.state.list_connected_bots().await.is_empty());
    }

    #[test]
    fn multipart_field_extraction_finds_the_body_between_boundaries() {
        let boundary = "X-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        let extracted = extract_first_multipart_field(
            &format!("multipart/form-data; boundary={boundary}"),
            body.as_bytes(),
        );
        assert_eq!(extracted, Some(b"hello".to_vec()));
    }
}

