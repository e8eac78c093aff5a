//! Platform (Web API compatible) endpoints: message posting, reactions,
//! conversation history, views, and file uploads.

use super::{AppState, assign_block_ids, bot_id_from_headers, optional_str, parse_platform_body, require_str};
use crate::error::{Error, Result};
use crate::model::{FileMeta, Message};
use crate::state::Event;
use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use axum::body::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
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

pub async fn auth_test(headers: HeaderMap) -> Json<Value> {
    let bot_id = bot_id_from_headers(&headers).unwrap_or_else(|_| "unknown".to_string());
    ok(json!({
        "team": "Emulated Workspace",
        "team_id": "T_EMULATOR",
        "user": bot_id,
        "user_id": format!("U_{bot_id}"),
        "bot_id": format!("B_{bot_id}"),
    }))
}

/// Claims an unassociated connection and runs bot registration. Not gated
/// behind bot-token auth: the bot has no token yet.
pub async fn register(
    State(app): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>> {
    let config: Value = serde_json::from_slice(&body).map_err(|e| Error::InvalidJson(e.to_string()))?;

    let Some(connection_id) = app.bus.claim_unassociated_connection().await else {
        return Err(Error::NoWebsocketConnection);
    };

    match app.state.register_bot(connection_id.clone(), config).await {
        Ok(bot) => {
            app.bus.confirm_connection_claim(&connection_id, &bot.id).await;
            Ok(ok(json!({"connection_id": connection_id, "bot_id": bot.id})))
        }
        Err(error) => {
            app.bus.release_connection_claim(&connection_id).await;
            tracing::error!(%error, "bot registration failed");
            Err(Error::RegistrationFailed(error.to_string()))
        }
    }
}

pub async fn connections_open(State(app): State<Arc<AppState>>) -> Json<Value> {
    ok(json!({
        "url": format!("ws://127.0.0.1:{}/ws/socket-mode", app.config.port),
    }))
}

pub async fn post_message(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    post_message_as(&app, &bot_id, &body, None).await
}

pub async fn post_ephemeral(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    post_message_as(&app, &bot_id, &body, Some("ephemeral")).await
}

async fn post_message_as(
    app: &AppState,
    bot_id: &str,
    body: &Value,
    subtype: Option<&str>,
) -> Result<Json<Value>> {
    let channel = require_str(body, "channel")?;
    let text = optional_str(body, "text");
    let mut blocks = body.get("blocks").cloned();
    if text.is_none() && blocks.is_none() {
        return Err(Error::MissingArgument("text"));
    }
    if let Some(blocks) = blocks.as_mut() {
        assign_block_ids(blocks);
    }

    let message = Message {
        ts: String::new(),
        channel: channel.to_string(),
        user: format!("U_{bot_id}"),
        text: text.unwrap_or_default(),
        thread_ts: optional_str(body, "thread_ts"),
        subtype: subtype.map(str::to_string),
        blocks,
        reactions: Vec::new(),
        file: None,
    };
    let stored = app.state.add_message(message).await?;
    Ok(ok(json!({
        "channel": channel,
        "ts": stored.ts,
        "message": message_json(&stored),
    })))
}

pub async fn update_message(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let channel = require_str(&body, "channel")?;
    let ts = require_str(&body, "ts")?;
    let text = optional_str(&body, "text");
    let mut blocks = body.get("blocks").cloned();
    if let Some(blocks) = blocks.as_mut() {
        assign_block_ids(blocks);
    }
    let updated = app.state.update_message(channel, ts, text, blocks).await?;
    app.state.emit_event(Event::MessageUpdate(updated.clone()));
    Ok(ok(json!({
        "channel": channel,
        "ts": ts,
        "message": message_json(&updated),
    })))
}

pub async fn delete_message(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let channel = require_str(&body, "channel")?;
    let ts = require_str(&body, "ts")?;
    if !app.state.delete_message(ts).await {
        return Err(Error::MessageNotFound);
    }
    app.state.emit_event(Event::MessageDelete {
        channel: channel.to_string(),
        ts: ts.to_string(),
    });
    Ok(ok(json!({"channel": channel, "ts": ts})))
}

pub async fn reactions_add(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let channel = require_str(&body, "channel")?;
    let ts = ts_field(&body)?;
    let name = require_str(&body, "name")?;
    app.state
        .add_reaction(channel, &ts, name, &format!("U_{bot_id}"))
        .await?;
    Ok(ok(json!({})))
}

pub async fn reactions_remove(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let channel = require_str(&body, "channel")?;
    let ts = ts_field(&body)?;
    let name = require_str(&body, "name")?;
    app.state
        .remove_reaction(channel, &ts, name, &format!("U_{bot_id}"))
        .await?;
    Ok(ok(json!({})))
}

fn ts_field(body: &Value) -> Result<String> {
    require_str(body, "timestamp")
        .or_else(|_| require_str(body, "ts"))
        .map(str::to_string)
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    channel: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn conversations_history(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let limit = query.limit.unwrap_or(100).max(1);
    let messages = app.state.history(&query.channel, limit).await;
    Ok(ok(json!({
        "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct RepliesQuery {
    channel: String,
    ts: String,
}

pub async fn conversations_replies(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RepliesQuery>,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let messages = app.state.replies(&query.channel, &query.ts).await;
    Ok(ok(json!({
        "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct UserQuery {
    user: String,
}

pub async fn users_info(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let user = app.state.get_user(&query.user).await.ok_or(Error::UserNotFound)?;
    Ok(ok(json!({"user": user})))
}

pub async fn views_open(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let trigger_id = require_str(&body, "trigger_id")?.to_string();
    let view = body.get("view").cloned().ok_or(Error::MissingArgument("view"))?;
    let ctx = app.state.consume_trigger_context(&trigger_id).await?;
    let state = app.state.open_view(view, trigger_id, ctx.user_id, ctx.channel_id, bot_id).await;
    Ok(ok(json!({"view": state.view_with_id()})))
}

pub async fn views_update(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let view_id = require_str(&body, "view_id")?;
    let view = body.get("view").cloned().ok_or(Error::MissingArgument("view"))?;
    let updated = app.state.update_view(view_id, view).await?;
    Ok(ok(json!({"view": updated.view_with_id()})))
}

pub async fn files_get_upload_url(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let filename = require_str(&body, "filename")?.to_string();
    let length: u64 = body
        .get("length")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or(Error::MissingArgument("length"))?;
    let file_id = app.state.create_pending_upload(filename, length).await;
    Ok(ok(json!({
        "upload_url": format!("/api/simulator/file-upload/{file_id}"),
        "file_id": file_id,
    })))
}

#[derive(Deserialize)]
pub struct CompleteUploadBody {
    files: Vec<CompleteUploadFile>,
    channel_id: Option<String>,
    initial_comment: Option<String>,
}

#[derive(Deserialize)]
pub struct CompleteUploadFile {
    id: String,
}

pub async fn files_complete_upload(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let body = parse_platform_body(&headers, &bytes)?;
    let request: CompleteUploadBody =
        serde_json::from_value(body).map_err(|e| Error::InvalidJson(e.to_string()))?;

    let mut files_out = Vec::new();
    for entry in request.files {
        let upload = app.state.consume_pending_upload(&entry.id).await?;
        let data = upload.data.unwrap_or_default();
        let mimetype = mime_guess::from_path(&upload.filename)
            .first_or_octet_stream()
            .to_string();
        let meta = FileMeta {
            id: entry.id.clone(),
            name: upload.filename.clone(),
            title: None,
            mimetype,
            size: data.len() as u64,
            url_private: Some(format!("/api/simulator/files/{}", entry.id)),
            channels: request.channel_id.iter().cloned().collect(),
            user: Some(format!("U_{bot_id}")),
            is_expanded: false,
        };
        let stored = app.state.save_file(meta, &data).await?;

        if let Some(channel) = &request.channel_id {
            let message = Message {
                ts: String::new(),
                channel: channel.clone(),
                user: format!("U_{bot_id}"),
                text: request.initial_comment.clone().unwrap_or_default(),
                thread_ts: None,
                subtype: Some("file_share".to_string()),
                blocks: None,
                reactions: Vec::new(),
                file: Some(crate::model::FileShareRef { id: stored.id.clone() }),
            };
            let stored_message = app.state.store_message_silently(message).await?;
            app.state.emit_event(Event::FileShared {
                message: stored_message,
                file: stored.clone(),
            });
        }
        files_out.push(json!({"id": stored.id, "title": stored.name}));
    }

    Ok(ok(json!({"files": files_out})))
}

pub async fn files_upload_v2(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let bot_id = bot_id_from_headers(&headers)?;
    let mut filename = "upload".to_string();
    let mut channel: Option<String> = None;
    let mut initial_comment: Option<String> = None;
    let mut data: Vec<u8> = Vec::new();
    let mut mimetype = "application/octet-stream".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidJson(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "channels" | "channel_id" => {
                channel = Some(field.text().await.unwrap_or_default());
            }
            "initial_comment" => {
                initial_comment = Some(field.text().await.unwrap_or_default());
            }
            "filename" => {
                filename = field.text().await.unwrap_or(filename);
            }
            "file" => {
                if let Some(name) = field.file_name() {
                    filename = name.to_string();
                }
                mimetype = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or(mimetype);
                data = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            }
            _ => {}
        }
    }

    let file_id = crate::ids::file_id();
    let meta = FileMeta {
        id: file_id.clone(),
        name: filename,
        title: None,
        mimetype,
        size: data.len() as u64,
        url_private: Some(format!("/api/simulator/files/{file_id}")),
        channels: channel.iter().cloned().collect(),
        user: Some(format!("U_{bot_id}")),
        is_expanded: false,
    };
    let stored = app.state.save_file(meta, &data).await?;

    if let Some(channel) = channel {
        let message = Message {
            ts: String::new(),
            channel,
            user: format!("U_{bot_id}"),
            text: initial_comment.unwrap_or_default(),
            thread_ts: None,
            subtype: Some("file_share".to_string()),
            blocks: None,
            reactions: Vec::new(),
            file: Some(crate::model::FileShareRef { id: stored.id.clone() }),
        };
        let stored_message = app.state.store_message_silently(message).await?;
        app.state.emit_event(Event::FileShared {
            message: stored_message,
            file: stored.clone(),
        });
    }

    Ok(ok(json!({"file": stored})))
}

#[derive(Deserialize)]
pub struct FileQuery {
    file: String,
}

pub async fn files_info(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>> {
    bot_id_from_headers(&headers)?;
    let file = app.state.get_file(&query.file).await.ok_or(Error::FileNotFound)?;
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

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    fn json_body(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn posted_message_round_trips_through_history() {
        let app = app_state();
        let body = json_body(json!({"channel": "C_GENERAL", "text": "hello"}));
        let posted = post_message(State(app.clone()), bearer("xoxb-simple"), body)
            .await
            .unwrap();
        assert_eq!(posted.0["ok"], true);

        let history = conversations_history(
            State(app),
            bearer("xoxb-simple"),
            Query(HistoryQuery {
                channel: "C_GENERAL".to_string(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        let messages = history.0["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["text"], "hello");
    }

    #[tokio::test]
    async fn reactions_add_then_remove_restores_the_original_message() {
        let app = app_state();
        let posted = post_message(
            State(app.clone()),
            bearer("xoxb-simple"),
            json_body(json!({"channel": "C_GENERAL", "text": "hi"})),
        )
        .await
        .unwrap();
        let ts = posted.0["ts"].as_str().unwrap().to_string();

        reactions_add(
            State(app.clone()),
            bearer("xoxb-simple"),
            json_body(json!({"channel": "C_GENERAL", "timestamp": ts, "name": "+1"})),
        )
        .await
        .unwrap();

        let history = conversations_history(
            State(app.clone()),
            bearer("xoxb-simple"),
            Query(HistoryQuery {
                channel: "C_GENERAL".to_string(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        let reactions = history.0["messages"][0]["reactions"].as_array().unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0]["count"], 1);

        reactions_remove(
            State(app.clone()),
            bearer("xoxb-simple"),
            json_body(json!({"channel": "C_GENERAL", "timestamp": ts, "name": "+1"})),
        )
        .await
        .unwrap();

        let history = conversations_history(
            State(app),
            bearer("xoxb-simple"),
            Query(HistoryQuery {
                channel: "C_GENERAL".to_string(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert!(history.0["messages"][0]["reactions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_without_an_open_connection_fails() {
        let app = app_state();
        let body = json_body(json!({"app": {"id": "simple"}}));
        let result = register(State(app), body).await;
        assert!(matches!(result, Err(Error::NoWebsocketConnection)));
    }

    #[tokio::test]
    async fn views_open_rejects_an_unknown_trigger_id() {
        let app = app_state();
        let body = json_body(json!({"trigger_id": "nonexistent", "view": {}}));
        let result = views_open(State(app), bearer("xoxb-simple"), body).await;
        assert!(result.is_err());
    }
}
