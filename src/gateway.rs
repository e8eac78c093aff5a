//! Single process entry: HTTP router, transport upgrade, startup/shutdown
//! ordering.

use crate::config::Config;
use crate::persistence::Persistence;
use crate::socketbus::{Outbound, SocketBus};
use crate::state::State;
use crate::webapi::{platform, simulator, AppState};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State as AxumState;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Opens persistence, hydrates state, and builds the router. Does not bind
/// the listener; the caller drives `serve`.
pub async fn build(config: Config) -> anyhow::Result<(Arc<AppState>, Arc<SocketBus>)> {
    let persistence = match (config.sqlite_path(), config.uploads_dir()) {
        (Some(sqlite_path), Some(uploads_dir)) => {
            Persistence::open(&sqlite_path, &uploads_dir).await?
        }
        _ => {
            tracing::info!("DATA_DIR not set, running with in-memory persistence only");
            Persistence::disabled()
        }
    };

    let state = State::new(persistence);
    state.hydrate().await?;

    let bus = SocketBus::new(state.clone());
    let app_state = AppState::new(state, bus.clone(), config);

    Ok((app_state, bus))
}

/// Starts the heartbeat monitor and serves HTTP until `shutdown` resolves.
pub async fn serve(
    app_state: Arc<AppState>,
    bus: Arc<SocketBus>,
    bind: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let heartbeat = tokio::spawn(bus.clone().run_heartbeat());

    let router = router(app_state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    heartbeat.abort();
    tracing::info!("gateway shut down");
    Ok(())
}

fn router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let simulator_routes = Router::new()
        .route("/events", get(simulator::events_sse))
        .route("/logs", get(simulator::logs_sse).post(simulator::logs_post))
        .route(
            "/settings",
            get(simulator::settings_get).post(simulator::settings_post),
        )
        .route("/user-message", post(simulator::user_message))
        .route(
            "/messages",
            get(simulator::messages_list)
                .post(simulator::messages_seed)
                .delete(simulator::messages_clear),
        )
        .route("/messages/{ts}", delete(simulator::messages_delete_one))
        .route(
            "/channels/{id}/messages",
            delete(simulator::channels_clear_messages),
        )
        .route(
            "/channels",
            get(simulator::channels_list).post(simulator::channels_create),
        )
        .route("/channels/{id}", delete(simulator::channels_delete))
        .route("/slash-command", post(simulator::slash_command))
        .route("/view-submit", post(simulator::view_submit))
        .route("/view-close", post(simulator::view_close))
        .route("/block-action", post(simulator::block_action))
        .route("/shortcut", post(simulator::shortcut))
        .route("/file-upload/{file_id}", post(simulator::file_upload))
        .route(
            "/files/{file_id}",
            get(simulator::files_get).patch(simulator::files_patch),
        );

    let platform_routes = Router::new()
        .route("/auth.test", get(platform::auth_test).post(platform::auth_test))
        .route("/register", post(platform::register))
        .route("/apps.connections.open", post(platform::connections_open))
        .route("/chat.postMessage", post(platform::post_message))
        .route("/chat.postEphemeral", post(platform::post_ephemeral))
        .route("/chat.update", post(platform::update_message))
        .route("/chat.delete", post(platform::delete_message))
        .route("/reactions.add", post(platform::reactions_add))
        .route("/reactions.remove", post(platform::reactions_remove))
        .route("/conversations.history", get(platform::conversations_history))
        .route("/conversations.replies", get(platform::conversations_replies))
        .route("/users.info", get(platform::users_info))
        .route("/views.open", post(platform::views_open))
        .route("/views.update", post(platform::views_update))
        .route("/views.push", post(platform::views_update))
        .route(
            "/files.getUploadURLExternal",
            post(platform::files_get_upload_url),
        )
        .route(
            "/files.completeUploadExternal",
            post(platform::files_complete_upload),
        )
        .route("/files.uploadV2", post(platform::files_upload_v2))
        .route("/files.info", get(platform::files_info));

    Router::new()
        .route("/health", get(health))
        .route("/ws/socket-mode", get(ws_upgrade))
        .nest("/api/simulator", simulator_routes)
        .nest("/api", platform_routes.clone())
        // Compatibility shims: the same dotted paths are also reachable at
        // the root, mirroring the platform's historical routing.
        .merge(platform_routes)
        .layer(cors)
        .with_state(app_state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

async fn ws_upgrade(
    AxumState(app_state): AxumState<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(app_state, socket))
}

async fn handle_socket(app_state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = futures::StreamExt::split(socket);
    let (connection_id, mut outbound) = app_state.bus.open_connection().await;

    let writer = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(frame) = outbound.recv().await {
            let result = match frame {
                Outbound::Text(text) => sink.send(WsMessage::Text(text.into())).await,
                Outbound::Ping => sink.send(WsMessage::Ping(Vec::new().into())).await,
                Outbound::Close => sink.send(WsMessage::Close(None)).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    use futures::StreamExt;
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => handle_incoming(&app_state, &connection_id, &text).await,
            WsMessage::Pong(_) => app_state.bus.record_pong(&connection_id).await,
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    app_state.bus.close_connection(&connection_id).await;
}

/// Bot-to-server frames are acks: `{envelope_id, payload?}`.
async fn handle_incoming(app_state: &AppState, connection_id: &str, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!(connection_id, "ignoring malformed frame");
        return;
    };
    let Some(envelope_id) = value.get("envelope_id").and_then(|v| v.as_str()) else {
        return;
    };
    let payload = value.get("payload").cloned().unwrap_or(serde_json::Value::Null);
    app_state.bus.handle_ack(connection_id, envelope_id, payload).await;
}
