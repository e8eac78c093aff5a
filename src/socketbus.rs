//! The bot transport: long-lived WebSocket connections, heartbeats,
//! envelope dispatch with per-envelope acknowledgment, and connection
//! claiming for the registration handshake.

use crate::ids;
use crate::state::State;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

/// A frame queued for delivery to a bot's socket. The gateway's per-connection
/// write task translates these into actual WebSocket frames.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_GRACE: Duration = Duration::from_secs(40);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DISPATCH_RACE: Duration = Duration::from_secs(10);

struct Connection {
    sender: mpsc::UnboundedSender<Outbound>,
    connected_at: Instant,
    last_pong: Instant,
    associated_bot: Option<String>,
    claimed: bool,
}

type AckKey = (String, String);

/// Owns every live bot connection. One instance per emulator process,
/// constructed by the gateway and given to the WebSocket upgrade handler.
pub struct SocketBus {
    connections: RwLock<HashMap<String, Connection>>,
    pending_acks: Mutex<HashMap<AckKey, oneshot::Sender<Value>>>,
    state: Arc<State>,
}

impl SocketBus {
    pub fn new(state: Arc<State>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            state,
        })
    }

    /// Registers a freshly upgraded connection, sends the `hello` envelope,
    /// and runs the reconnect-vs-connecting branch.
    pub async fn open_connection(&self) -> (String, mpsc::UnboundedReceiver<Outbound>) {
        let id = ids::connection_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        {
            let mut connections = self.connections.write().await;
            connections.insert(
                id.clone(),
                Connection {
                    sender: tx.clone(),
                    connected_at: now,
                    last_pong: now,
                    associated_bot: None,
                    claimed: false,
                },
            );
        }

        let num_connections = self.connections.read().await.len();
        let hello = json!({
            "type": "hello",
            "connection_info": {"connection_id": id},
            "num_connections": num_connections,
            "debug_info": {"host": "emulator"},
        });
        let _ = tx.send(Outbound::Text(hello.to_string()));

        let resumed = self.state.try_reconnect_bot().await;
        if !resumed {
            self.state.emit_bot_connecting(id.clone());
        }

        (id, rx)
    }

    pub async fn record_pong(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.last_pong = Instant::now();
        }
    }

    /// Called when the connection's transport actually closes (read loop
    /// ends, or the heartbeat monitor force-closes it).
    pub async fn close_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        self.resolve_pending_for_connection(connection_id).await;
        self.state.unregister_bot(connection_id).await;
    }

    async fn resolve_pending_for_connection(&self, connection_id: &str) {
        let mut pending = self.pending_acks.lock().await;
        let keys: Vec<AckKey> = pending
            .keys()
            .filter(|(conn, _)| conn == connection_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(tx) = pending.remove(&key) {
                let _ = tx.send(Value::Null);
            }
        }
    }

    /// Handles a bot-to-server ack frame `{envelope_id, payload?}`.
    pub async fn handle_ack(&self, connection_id: &str, envelope_id: &str, payload: Value) {
        let key = (connection_id.to_string(), envelope_id.to_string());
        if let Some(tx) = self.pending_acks.lock().await.remove(&key) {
            let _ = tx.send(payload);
        }
    }

    // ---- Connection claiming ---------------------------------------------------

    /// Returns the oldest connection that is unassociated and unclaimed,
    /// atomically adding it to the claim set.
    pub async fn claim_unassociated_connection(&self) -> Option<String> {
        let mut connections = self.connections.write().await;
        let candidate = connections
            .iter()
            .filter(|(_, c)| c.associated_bot.is_none() && !c.claimed)
            .min_by_key(|(_, c)| c.connected_at)
            .map(|(id, _)| id.clone())?;
        if let Some(conn) = connections.get_mut(&candidate) {
            conn.claimed = true;
        }
        Some(candidate)
    }

    pub async fn confirm_connection_claim(&self, connection_id: &str, bot_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.associated_bot = Some(bot_id.to_string());
            conn.claimed = false;
        }
    }

    pub async fn release_connection_claim(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.claimed = false;
        }
    }

    async fn connection_for_bot(&self, bot_id: &str) -> Option<String> {
        self.state
            .get_bot(bot_id)
            .await
            .and_then(|b| b.connection_id)
    }

    // ---- Dispatch -------------------------------------------------------------

    /// Sends an envelope to `target_bot_id`'s connection, or broadcasts to
    /// every connected bot when `target_bot_id` is `None`. Returns, per
    /// target bot id, the ack payload (`None` on timeout — acks are
    /// advisory, never flow-controlling).
    pub async fn dispatch(
        &self,
        kind: &str,
        payload: Value,
        accepts_response_payload: bool,
        target_bot_id: Option<&str>,
    ) -> Vec<(String, Option<Value>)> {
        let targets = match target_bot_id {
            Some(bot_id) => match self.connection_for_bot(bot_id).await {
                Some(conn_id) => vec![(bot_id.to_string(), conn_id)],
                None => Vec::new(),
            },
            None => {
                let bots = self.state.list_connected_bots().await;
                let mut pairs = Vec::new();
                for bot in bots {
                    if let Some(conn_id) = bot.connection_id.clone() {
                        pairs.push((bot.id, conn_id));
                    }
                }
                pairs
            }
        };

        let mut awaiters = Vec::with_capacity(targets.len());
        for (bot_id, connection_id) in targets {
            let envelope_id = ids::envelope_id();
            let envelope = json!({
                "envelope_id": envelope_id,
                "type": kind,
                "payload": payload,
                "accepts_response_payload": accepts_response_payload,
            });

            let (tx, rx) = oneshot::channel();
            self.pending_acks
                .lock()
                .await
                .insert((connection_id.clone(), envelope_id.clone()), tx);
            self.send_to(&connection_id, Outbound::Text(envelope.to_string()))
                .await;

            awaiters.push(async move {
                let ack = tokio::time::timeout(ACK_TIMEOUT, rx).await;
                let value = match ack {
                    Ok(Ok(value)) => Some(value),
                    _ => {
                        tracing::warn!(bot_id = %bot_id, "ack timed out, treating as acknowledged");
                        None
                    }
                };
                (bot_id, value)
            });
        }

        match tokio::time::timeout(DISPATCH_RACE, futures::future::join_all(awaiters)).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(kind, "dispatch race exceeded overall timeout");
                Vec::new()
            }
        }
    }

    async fn send_to(&self, connection_id: &str, frame: Outbound) {
        let sender = self
            .connections
            .read()
            .await
            .get(connection_id)
            .map(|c| c.sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(frame);
        }
    }

    // ---- Heartbeat -------------------------------------------------------------

    /// Runs forever: fires every 30s, closes connections that haven't
    /// pong'd within the grace period, pings the rest, then demotes any
    /// bot whose connection is no longer live.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        let mut alive = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, conn) in connections.iter() {
                if now.duration_since(conn.last_pong) > HEARTBEAT_GRACE {
                    dead.push(id.clone());
                } else {
                    alive.push(id.clone());
                }
            }
        }
        for id in &dead {
            tracing::debug!(connection_id = %id, "heartbeat grace exceeded, closing");
            self.send_to(id, Outbound::Close).await;
            self.close_connection(id).await;
        }
        for id in &alive {
            self.send_to(id, Outbound::Ping).await;
        }

        let active: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for orphan in self.state.orphaned_bots(&active).await {
            tracing::warn!(bot_id = %orphan.id, "demoting orphaned bot");
            self.state.force_disconnect_bot(&orphan.id).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Disconnects every connected bot with `reason`. Used when the UI
    /// pushes a non-initial settings change: bots must restart to pick up
    /// the new configuration.
    pub async fn dispatch_disconnect_all(&self, reason: &str) {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        tracing::info!(count = ids.len(), reason, "disconnecting all bots");
        for id in ids {
            let notice = json!({"type": "disconnect", "reason": reason});
            self.send_to(&id, Outbound::Text(notice.to_string())).await;
            self.send_to(&id, Outbound::Close).await;
            self.close_connection(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persistence;

    async fn bus() -> Arc<SocketBus> {
        let state = State::new(Persistence::disabled());
        SocketBus::new(state)
    }

    #[tokio::test]
    async fn a_claimed_connection_is_not_handed_out_twice() {
        let bus = bus().await;
        let (id, _rx) = bus.open_connection().await;

        let first = bus.claim_unassociated_connection().await;
        assert_eq!(first, Some(id.clone()));

        let second = bus.claim_unassociated_connection().await;
        assert!(second.is_none());

        bus.release_connection_claim(&id).await;
        let third = bus.claim_unassociated_connection().await;
        assert_eq!(third, Some(id));
    }

    #[tokio::test]
    async fn confirmed_claims_are_never_offered_again() {
        let bus = bus().await;
        let (id, _rx) = bus.open_connection().await;
        bus.claim_unassociated_connection().await;
        bus.confirm_connection_claim(&id, "bot-a").await;

        assert!(bus.claim_unassociated_connection().await.is_none());
    }

    #[tokio::test]
    async fn dispatch_with_no_connected_bots_returns_empty() {
        let bus = bus().await;
        let acks = bus
            .dispatch("events_api", json!({"type": "app_mention"}), false, None)
            .await;
        assert!(acks.is_empty());
    }
}
