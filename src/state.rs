//! The authoritative in-memory model: users, channels, messages, reactions,
//! files, modal views, trigger contexts, the bot registry, and simulator
//! settings. Every externally visible mutation emits a typed [`Event`].

use crate::error::{Error, Result};
use crate::ids;
use crate::model::*;
use crate::persistence::Persistence;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// A state-change event, broadcast to every subscriber (the UI SSE stream,
/// chiefly). `type` carries the event kind named in the component design.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message(Message),
    MessageUpdate(Message),
    MessageDelete {
        channel: String,
        ts: String,
    },
    ReactionAdded {
        channel: String,
        ts: String,
        reaction: Reaction,
        user: String,
    },
    ReactionRemoved {
        channel: String,
        ts: String,
        reaction: String,
        user: String,
    },
    FileShared {
        message: Message,
        file: FileMeta,
    },
    ViewOpen(ViewState),
    ViewUpdate(ViewState),
    ViewClose {
        view_id: String,
    },
    BotConnecting {
        connection_id: String,
    },
    BotConnected(ConnectedBot),
    BotDisconnected(ConnectedBot),
}

/// Per-bot settings overrides, merged on top of the global map at
/// registration time (`_app_settings[botId]` in the wire format).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSettingsOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_fast: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_personality: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Modeled per the design note against loosely-typed source settings: an
/// explicit tagged record rather than a bag of strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_fast: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_thinking: Option<String>,
    #[serde(rename = "_app_settings", default)]
    pub app_settings: HashMap<String, BotSettingsOverride>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SimulatorSettings {
    /// Merge this global map with `bot_id`'s overrides. `BOT_NAME` and
    /// `BOT_PERSONALITY` are never inherited from the global map; they only
    /// apply when present in the bot's own override.
    pub fn merged_for_bot(&self, bot_id: &str) -> Value {
        let mut merged = serde_json::json!({
            "ai_provider": normalize_model_provider(&self.ai_provider),
            "model_fast": normalize_model(&self.ai_provider, &self.model_fast),
            "model_default": normalize_model(&self.ai_provider, &self.model_default),
            "model_thinking": normalize_model(&self.ai_provider, &self.model_thinking),
        });
        for (k, v) in &self.extra {
            merged[k] = v.clone();
        }
        if let Some(over) = self.app_settings.get(bot_id) {
            if let Some(p) = &over.ai_provider {
                merged["ai_provider"] = Value::String(p.clone());
            }
            if over.model_fast.is_some() {
                merged["model_fast"] = Value::from(normalize_model(&over.ai_provider, &over.model_fast));
            }
            if over.model_default.is_some() {
                merged["model_default"] =
                    Value::from(normalize_model(&over.ai_provider, &over.model_default));
            }
            if over.model_thinking.is_some() {
                merged["model_thinking"] =
                    Value::from(normalize_model(&over.ai_provider, &over.model_thinking));
            }
            if let Some(name) = &over.bot_name {
                merged["bot_name"] = Value::String(name.clone());
            }
            if let Some(personality) = &over.bot_personality {
                merged["bot_personality"] = Value::String(personality.clone());
            }
            for (k, v) in &over.extra {
                merged[k] = v.clone();
            }
        }
        merged
    }
}

fn normalize_model_provider(provider: &Option<String>) -> Option<String> {
    provider.clone()
}

/// Models containing `/` are only valid for `openrouter`; any other provider
/// rejects a slashed model. Incompatible or missing values fall back to
/// `None` (the provider's default, left to the bot to choose).
fn normalize_model(provider: &Option<String>, model: &Option<String>) -> Option<String> {
    let model = model.as_ref()?;
    let is_openrouter = provider.as_deref() == Some("openrouter");
    let has_slash = model.contains('/');
    if has_slash == is_openrouter {
        Some(model.clone())
    } else {
        None
    }
}

struct Inner {
    users: HashMap<String, User>,
    channels: HashMap<String, Channel>,
    messages: Vec<Message>,
    files: HashMap<String, FileMeta>,
    views: HashMap<String, ViewState>,
    trigger_contexts: HashMap<String, TriggerContext>,
    pending_uploads: HashMap<String, PendingUpload>,
    bots: HashMap<String, ConnectedBot>,
    commands: HashMap<String, Value>,
    settings: SimulatorSettings,
    settings_pushed_once: bool,
    scope: Option<String>,
}

/// The emulator's authoritative state, owned by the gateway for the
/// lifetime of the process. No hidden globals.
pub struct State {
    inner: RwLock<Inner>,
    persistence: Persistence,
    event_tx: broadcast::Sender<Event>,
}

impl State {
    pub fn new(persistence: Persistence) -> Arc<Self> {
        let (event_tx, _rx) = broadcast::channel(1024);
        let mut channels = HashMap::new();
        channels.insert(
            PRESET_GENERAL.to_string(),
            Channel::preset(PRESET_GENERAL, "general"),
        );
        channels.insert(
            PRESET_SHOWCASE.to_string(),
            Channel::preset(PRESET_SHOWCASE, "showcase"),
        );
        let mut users = HashMap::new();
        let sim = User::simulated_user();
        users.insert(sim.id.clone(), sim);

        Arc::new(Self {
            inner: RwLock::new(Inner {
                users,
                channels,
                messages: Vec::new(),
                files: HashMap::new(),
                views: HashMap::new(),
                trigger_contexts: HashMap::new(),
                pending_uploads: HashMap::new(),
                bots: HashMap::new(),
                commands: HashMap::new(),
                settings: SimulatorSettings::default(),
                settings_pushed_once: false,
                scope: None,
            }),
            persistence,
            event_tx,
        })
    }

    /// Hydrate in-memory messages and files from persistence. Files load
    /// first so messages can re-attach their file reference. Called once at
    /// startup against a fresh, empty `Inner`.
    pub async fn hydrate(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let scope = inner.scope.clone();
        let files = self.persistence.load_files(scope.as_deref()).await?;
        for file in files {
            inner.files.insert(file.id.clone(), file);
        }
        let messages = self.persistence.load_messages(scope.as_deref()).await?;
        inner.messages = messages;
        Ok(())
    }

    /// Reloads DMs and DM files for `bot_id`'s scope after a scope switch.
    /// Channel messages/files already in memory are untouched; a no-op when
    /// persistence is disabled, since `load_messages`/`load_files` would
    /// return nothing but an unconditional reload would still be a wasted
    /// round trip through an empty pool.
    async fn reload_scope(&self, bot_id: &str) {
        if !self.persistence.is_enabled() {
            return;
        }

        let files = match self.persistence.load_files(Some(bot_id)).await {
            Ok(files) => files,
            Err(error) => {
                tracing::error!(%error, bot_id, "failed to reload files for new scope");
                return;
            }
        };
        let messages = match self.persistence.load_messages(Some(bot_id)).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(%error, bot_id, "failed to reload messages for new scope");
                return;
            }
        };

        let mut inner = self.inner.write().await;
        for file in files
            .into_iter()
            .filter(|f| f.channels.iter().any(|c| Channel::is_dm(c)))
        {
            inner.files.insert(file.id.clone(), file);
        }
        inner
            .messages
            .extend(messages.into_iter().filter(|m| Channel::is_dm(&m.channel)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: Event) {
        // Isolated per the design note: a lagging/dropped subscriber never
        // blocks or cancels delivery to others.
        let _ = self.event_tx.send(event);
    }

    /// Emits an event on the caller's behalf. Used by the WebAPI layer for
    /// events whose emission is assigned to the handler rather than to
    /// State itself (`message_delete`, `message_update`, `file_shared`).
    pub fn emit_event(&self, event: Event) {
        self.emit(event);
    }

    // ---- Users ---------------------------------------------------------

    pub async fn get_user(&self, id: &str) -> Option<User> {
        self.inner.read().await.users.get(id).cloned()
    }

    async fn ensure_bot_user(&self, bot_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .users
            .entry(format!("U_{bot_id}"))
            .or_insert_with(|| User::bot_identity(bot_id));
        inner
            .channels
            .entry(format!("{DM_PREFIX}{bot_id}"))
            .or_insert_with(|| Channel::dm_for_bot(bot_id));
    }

    // ---- Channels -------------------------------------------------------

    pub async fn list_channels(&self) -> Vec<Channel> {
        let inner = self.inner.read().await;
        let mut channels: Vec<Channel> = inner
            .channels
            .values()
            .filter(|c| !c.is_im)
            .cloned()
            .collect();
        channels.sort_by(|a, b| {
            let a_preset = Channel::is_preset(&a.id);
            let b_preset = Channel::is_preset(&b.id);
            b_preset.cmp(&a_preset).then_with(|| a.name.cmp(&b.name))
        });
        channels
    }

    pub async fn get_channel(&self, id: &str) -> Option<Channel> {
        self.inner.read().await.channels.get(id).cloned()
    }

    pub async fn create_channel(&self, name: &str) -> Result<Channel> {
        let id = Channel::normalize_id(name);
        let mut inner = self.inner.write().await;
        if inner.channels.contains_key(&id) {
            return Err(Error::ChannelExists);
        }
        let channel = Channel {
            id: id.clone(),
            name: name.to_string(),
            is_channel: true,
            is_im: false,
            is_member: true,
        };
        inner.channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub async fn delete_channel(&self, id: &str) -> Result<()> {
        if Channel::is_preset(id) {
            return Err(Error::CannotDeletePreset);
        }
        let mut inner = self.inner.write().await;
        if inner.channels.remove(id).is_none() {
            return Err(Error::ChannelNotFound);
        }
        inner.messages.retain(|m| m.channel != id);
        Ok(())
    }

    pub async fn clear_channel_messages(&self, channel: &str) {
        let mut inner = self.inner.write().await;
        inner.messages.retain(|m| m.channel != channel);
    }

    // ---- Messages --------------------------------------------------------

    fn scope_tag(channel: &str, scope: &Option<String>) -> Option<String> {
        if Channel::is_dm(channel) {
            scope.clone()
        } else {
            None
        }
    }

    /// Stores, persists, and emits `message`.
    pub async fn add_message(&self, mut message: Message) -> Result<Message> {
        if message.ts.is_empty() {
            message.ts = ids::next_ts();
        }
        let stored = self.store(message).await?;
        self.emit(Event::Message(stored.clone()));
        Ok(stored)
    }

    /// Stores and persists without emitting `message`; used when the caller
    /// will emit `file_shared` instead, to prevent duplicate rendering.
    pub async fn store_message_silently(&self, message: Message) -> Result<Message> {
        self.store(message).await
    }

    async fn store(&self, mut message: Message) -> Result<Message> {
        if message.ts.is_empty() {
            message.ts = ids::next_ts();
        }
        let mut inner = self.inner.write().await;
        if inner.messages.iter().any(|m| m.ts == message.ts) {
            return Err(Error::Internal(anyhow::anyhow!(
                "duplicate message ts {}",
                message.ts
            )));
        }
        let scope = Self::scope_tag(&message.channel, &inner.scope);
        inner.messages.push(message.clone());
        let scope_ref = scope.clone();
        drop(inner);
        if let Err(error) = self.persistence.save_message(&message, scope_ref.as_deref()).await {
            tracing::error!(%error, ts = %message.ts, "failed to persist message");
        }
        Ok(message)
    }

    /// Searches all channels, removes, persists deletion, returns whether
    /// found. Emission of `message_delete` is the caller's responsibility.
    pub async fn delete_message(&self, ts: &str) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| m.ts != ts);
        let found = inner.messages.len() != before;
        drop(inner);
        if found {
            if let Err(error) = self.persistence.delete_message(ts).await {
                tracing::error!(%error, ts, "failed to persist message deletion");
            }
        }
        found
    }

    pub async fn get_message(&self, channel: &str, ts: &str) -> Option<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.channel == channel && m.ts == ts)
            .cloned()
    }

    /// In-place mutation of text/blocks followed by re-persistence. The
    /// caller emits `message_update`.
    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: Option<String>,
        blocks: Option<Value>,
    ) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let Some(message) = inner
            .messages
            .iter_mut()
            .find(|m| m.channel == channel && m.ts == ts)
        else {
            return Err(Error::MessageNotFound);
        };
        if let Some(text) = text {
            message.text = text;
        }
        if blocks.is_some() {
            message.blocks = blocks;
        }
        let updated = message.clone();
        let scope = Self::scope_tag(&updated.channel, &inner.scope);
        drop(inner);
        self.persist_message(&updated, scope).await;
        Ok(updated)
    }

    async fn persist_message(&self, message: &Message, scope: Option<String>) {
        if let Err(error) = self
            .persistence
            .save_message(message, scope.as_deref())
            .await
        {
            tracing::error!(%error, ts = %message.ts, "failed to persist message");
        }
    }

    pub async fn history(&self, channel: &str, limit: usize) -> Vec<Message> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect();
        if messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        messages
    }

    pub async fn all_messages(&self) -> Vec<Message> {
        self.inner.read().await.messages.clone()
    }

    /// Bulk-imports messages (e.g. scripted demo seeding), skipping any
    /// whose `ts` already exists.
    pub async fn seed_messages(&self, messages: Vec<Message>) {
        let mut inner = self.inner.write().await;
        for message in messages {
            if !inner.messages.iter().any(|m| m.ts == message.ts) {
                inner.messages.push(message);
            }
        }
    }

    pub async fn replies(&self, channel: &str, thread_ts: &str) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .iter()
            .filter(|m| {
                m.channel == channel && (m.ts == thread_ts || m.thread_ts.as_deref() == Some(thread_ts))
            })
            .cloned()
            .collect()
    }

    // ---- Reactions ---------------------------------------------------------

    pub async fn add_reaction(&self, channel: &str, ts: &str, name: &str, user: &str) -> Result<()> {
        let (message, added) = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner
                .messages
                .iter_mut()
                .find(|m| m.channel == channel && m.ts == ts)
            else {
                return Err(Error::MessageNotFound);
            };
            let added = message.add_reaction(name, user);
            (message.clone(), added)
        };
        let scope = {
            let inner = self.inner.read().await;
            Self::scope_tag(channel, &inner.scope)
        };
        self.persist_message(&message, scope).await;
        if added {
            let reaction = message
                .reactions
                .iter()
                .find(|r| r.name == name)
                .cloned()
                .unwrap_or_default();
            self.emit(Event::ReactionAdded {
                channel: channel.to_string(),
                ts: ts.to_string(),
                reaction,
                user: user.to_string(),
            });
        }
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
        user: &str,
    ) -> Result<()> {
        let (message, removed) = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner
                .messages
                .iter_mut()
                .find(|m| m.channel == channel && m.ts == ts)
            else {
                return Err(Error::MessageNotFound);
            };
            let removed = message.remove_reaction(name, user);
            (message.clone(), removed)
        };
        if !removed {
            return Err(Error::NoReaction);
        }
        let scope = {
            let inner = self.inner.read().await;
            Self::scope_tag(channel, &inner.scope)
        };
        self.persist_message(&message, scope).await;
        self.emit(Event::ReactionRemoved {
            channel: channel.to_string(),
            ts: ts.to_string(),
            reaction: name.to_string(),
            user: user.to_string(),
        });
        Ok(())
    }

    // ---- Files -------------------------------------------------------------

    pub async fn save_file(&self, meta: FileMeta, bytes: &[u8]) -> Result<FileMeta> {
        let scope = {
            let inner = self.inner.read().await;
            meta.channels
                .first()
                .and_then(|c| Self::scope_tag(c, &inner.scope))
        };
        self.persistence.save_file(&meta, scope.as_deref(), bytes).await?;
        self.inner.write().await.files.insert(meta.id.clone(), meta.clone());
        Ok(meta)
    }

    pub async fn get_file(&self, id: &str) -> Option<FileMeta> {
        self.inner.read().await.files.get(id).cloned()
    }

    pub async fn read_file_bytes(&self, id: &str) -> Result<Vec<u8>> {
        if self.get_file(id).await.is_none() {
            return Err(Error::FileNotFound);
        }
        self.persistence.read_file_bytes(id).await
    }

    pub async fn set_file_expanded(&self, id: &str, is_expanded: bool) -> Result<FileMeta> {
        let mut inner = self.inner.write().await;
        let Some(file) = inner.files.get_mut(id) else {
            return Err(Error::FileNotFound);
        };
        file.is_expanded = is_expanded;
        let updated = file.clone();
        drop(inner);
        if let Err(error) = self.persistence.update_file_expanded(id, is_expanded).await {
            tracing::error!(%error, id, "failed to persist file expansion state");
        }
        Ok(updated)
    }

    // ---- Views --------------------------------------------------------------

    pub async fn open_view(&self, view: Value, trigger_id: String, user_id: String, channel_id: Option<String>, bot_id: String) -> ViewState {
        let state = ViewState {
            id: ids::view_id(),
            view,
            trigger_id,
            user_id,
            channel_id,
            bot_id,
        };
        self.inner.write().await.views.insert(state.id.clone(), state.clone());
        self.emit(Event::ViewOpen(state.clone()));
        state
    }

    pub async fn update_view(&self, view_id: &str, view: Value) -> Result<ViewState> {
        let mut inner = self.inner.write().await;
        let Some(state) = inner.views.get_mut(view_id) else {
            return Err(Error::ViewNotFound);
        };
        state.view = view;
        let updated = state.clone();
        drop(inner);
        self.emit(Event::ViewUpdate(updated.clone()));
        Ok(updated)
    }

    pub async fn get_view(&self, view_id: &str) -> Option<ViewState> {
        self.inner.read().await.views.get(view_id).cloned()
    }

    pub async fn close_view(&self, view_id: &str) {
        self.inner.write().await.views.remove(view_id);
        self.emit(Event::ViewClose {
            view_id: view_id.to_string(),
        });
    }

    // ---- Trigger contexts -----------------------------------------------------

    pub async fn create_trigger_context(
        &self,
        user_id: String,
        channel_id: Option<String>,
        user_name: Option<String>,
        channel_name: Option<String>,
    ) -> String {
        let id = ids::trigger_id();
        let ctx = TriggerContext {
            user_id,
            channel_id,
            user_name,
            channel_name,
            created_at: std::time::Instant::now(),
        };
        self.inner.write().await.trigger_contexts.insert(id.clone(), ctx);
        id
    }

    /// Consumed at most once: removed whether or not it had expired.
    pub async fn consume_trigger_context(&self, trigger_id: &str) -> Result<TriggerContext> {
        let mut inner = self.inner.write().await;
        let Some(ctx) = inner.trigger_contexts.remove(trigger_id) else {
            return Err(Error::ExpiredTriggerId);
        };
        if ctx.is_expired() {
            return Err(Error::ExpiredTriggerId);
        }
        Ok(ctx)
    }

    // ---- Pending uploads --------------------------------------------------------

    pub async fn create_pending_upload(&self, filename: String, length: u64) -> String {
        let id = ids::file_id();
        let upload = PendingUpload {
            file_id: id.clone(),
            filename,
            length,
            data: None,
            created_at: std::time::Instant::now(),
        };
        self.inner.write().await.pending_uploads.insert(id.clone(), upload);
        id
    }

    pub async fn fill_pending_upload(&self, file_id: &str, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(upload) = inner.pending_uploads.get_mut(file_id) else {
            return Err(Error::FileNotFound);
        };
        if upload.is_expired() {
            inner.pending_uploads.remove(file_id);
            return Err(Error::FileNotFound);
        }
        upload.data = Some(data);
        Ok(())
    }

    pub async fn consume_pending_upload(&self, file_id: &str) -> Result<PendingUpload> {
        let mut inner = self.inner.write().await;
        let Some(upload) = inner.pending_uploads.remove(file_id) else {
            return Err(Error::FileNotFound);
        };
        if upload.is_expired() {
            return Err(Error::FileNotFound);
        }
        Ok(upload)
    }

    // ---- Bot registry -----------------------------------------------------------

    pub async fn get_bot(&self, id: &str) -> Option<ConnectedBot> {
        self.inner.read().await.bots.get(id).cloned()
    }

    pub async fn current_scope(&self) -> Option<String> {
        self.inner.read().await.scope.clone()
    }

    /// If exactly one bot is `disconnected`, transition it to `connecting`.
    /// With zero or more than one, this is silent (no fallback policy; see
    /// the open question in the component design).
    pub async fn try_reconnect_bot(&self) -> bool {
        let mut inner = self.inner.write().await;
        let disconnected: Vec<String> = inner
            .bots
            .iter()
            .filter(|(_, b)| b.status == BotStatus::Disconnected)
            .map(|(id, _)| id.clone())
            .collect();
        if let [only] = disconnected.as_slice() {
            if let Some(bot) = inner.bots.get_mut(only) {
                bot.status = BotStatus::Connecting;
                return true;
            }
        }
        false
    }

    /// Forcibly demotes a bot to `disconnected` regardless of its current
    /// connection id; used by the heartbeat monitor on orphan detection.
    pub async fn force_disconnect_bot(&self, bot_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(bot) = inner.bots.get_mut(bot_id) else {
            return;
        };
        bot.status = BotStatus::Disconnected;
        bot.connection_id = None;
        let snapshot = bot.clone();
        drop(inner);
        self.emit(Event::BotDisconnected(snapshot));
    }

    /// Registers a bot's config, reusing a prior registration by id or name
    /// when one exists rather than creating a duplicate.
    pub async fn register_bot(&self, connection_id: String, config: Value) -> Result<ConnectedBot> {
        let app = config.get("app").ok_or(Error::InvalidConfig)?;
        let new_id = app
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ids::fresh_id("bot"));
        let new_name = app.get("name").and_then(|v| v.as_str()).map(str::to_string);

        let mut inner = self.inner.write().await;

        let reuse_id = inner
            .bots
            .iter()
            .filter(|(_, b)| matches!(b.status, BotStatus::Disconnected | BotStatus::Connecting))
            .find(|(id, _)| **id == new_id)
            .map(|(id, _)| id.clone())
            .or_else(|| {
                new_name.as_ref().and_then(|name| {
                    inner
                        .bots
                        .iter()
                        .filter(|(_, b)| {
                            matches!(b.status, BotStatus::Disconnected | BotStatus::Connecting)
                        })
                        .find(|(_, b)| b.name() == Some(name.as_str()))
                        .map(|(id, _)| id.clone())
                })
            });

        let bot_id = reuse_id.unwrap_or_else(|| new_id.clone());
        let bot = ConnectedBot {
            id: bot_id.clone(),
            connection_id: Some(connection_id),
            app_config: config.clone(),
            connected_at: ids::next_ts(),
            status: BotStatus::Connected,
        };
        inner.bots.insert(bot_id.clone(), bot.clone());

        let scope_changed = inner.scope.as_deref() != Some(bot_id.as_str());
        if scope_changed {
            inner.messages.retain(|m| !Channel::is_dm(&m.channel));
            inner
                .files
                .retain(|_, f| f.channels.iter().all(|c| !Channel::is_dm(c)));
            inner.scope = Some(bot_id.clone());
        }

        if let Some(commands) = config.get("commands").and_then(|v| v.as_array()) {
            for command in commands {
                if let Some(name) = command.get("name").and_then(|v| v.as_str()) {
                    inner.commands.insert(name.to_string(), command.clone());
                }
            }
        }
        drop(inner);

        self.ensure_bot_user(&bot_id).await;

        if scope_changed {
            self.reload_scope(&bot_id).await;
        }

        self.emit(Event::BotConnected(bot.clone()));
        Ok(bot)
    }

    /// Marks the bot associated with `connection_id` as disconnected,
    /// retaining its record and history.
    pub async fn unregister_bot(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        let found = inner
            .bots
            .values_mut()
            .find(|b| b.connection_id.as_deref() == Some(connection_id));
        let Some(bot) = found else { return };
        bot.status = BotStatus::Disconnected;
        bot.connection_id = None;
        let snapshot = bot.clone();
        drop(inner);
        self.emit(Event::BotDisconnected(snapshot));
    }

    /// Bots currently marked `connected` whose connection id is not live.
    pub async fn orphaned_bots(&self, active_connection_ids: &[String]) -> Vec<ConnectedBot> {
        let inner = self.inner.read().await;
        inner
            .bots
            .values()
            .filter(|b| b.status == BotStatus::Connected)
            .filter(|b| match &b.connection_id {
                Some(id) => !active_connection_ids.iter().any(|a| a == id),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub async fn get_bot_by_connection(&self, connection_id: &str) -> Option<ConnectedBot> {
        self.inner
            .read()
            .await
            .bots
            .values()
            .find(|b| b.connection_id.as_deref() == Some(connection_id))
            .cloned()
    }

    pub async fn list_connected_bots(&self) -> Vec<ConnectedBot> {
        self.inner
            .read()
            .await
            .bots
            .values()
            .filter(|b| b.status == BotStatus::Connected)
            .cloned()
            .collect()
    }

    pub fn emit_bot_connecting(&self, connection_id: String) {
        self.emit(Event::BotConnecting { connection_id });
    }

    // ---- Settings ------------------------------------------------------------

    /// Returns merged settings for `bot_id` (global map overridden by the
    /// bot's own `_app_settings` entry), provider/model normalized.
    pub async fn settings_for_bot(&self, bot_id: &str) -> Value {
        self.inner.read().await.settings.merged_for_bot(bot_id)
    }

    /// Replaces the global settings map. Returns whether this was the first
    /// push (callers use this to decide whether to disconnect bots).
    pub async fn push_settings(&self, settings: SimulatorSettings) -> bool {
        let mut inner = self.inner.write().await;
        let first = !inner.settings_pushed_once;
        inner.settings = settings;
        inner.settings_pushed_once = true;
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, ts: &str) -> Message {
        Message {
            ts: ts.to_string(),
            channel: channel.to_string(),
            user: "U_simple".to_string(),
            text: "hello".to_string(),
            thread_ts: None,
            subtype: None,
            blocks: None,
            reactions: Vec::new(),
            file: None,
        }
    }

    fn bot_config(id: &str) -> Value {
        serde_json::json!({"app": {"id": id}})
    }

    #[tokio::test]
    async fn message_round_trips_through_get_message() {
        let state = State::new(Persistence::disabled());
        let stored = state.add_message(message(PRESET_GENERAL, "")).await.unwrap();
        let fetched = state.get_message(PRESET_GENERAL, &stored.ts).await.unwrap();
        assert_eq!(fetched.ts, stored.ts);
        assert_eq!(fetched.text, "hello");
    }

    #[tokio::test]
    async fn duplicate_ts_is_rejected() {
        let state = State::new(Persistence::disabled());
        state.add_message(message(PRESET_GENERAL, "100.000001")).await.unwrap();
        let result = state.add_message(message(PRESET_GENERAL, "100.000001")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reaction_add_is_idempotent_for_the_same_user() {
        let state = State::new(Persistence::disabled());
        let stored = state.add_message(message(PRESET_GENERAL, "")).await.unwrap();
        state.add_reaction(PRESET_GENERAL, &stored.ts, "+1", "U_simple").await.unwrap();
        state.add_reaction(PRESET_GENERAL, &stored.ts, "+1", "U_simple").await.unwrap();

        let fetched = state.get_message(PRESET_GENERAL, &stored.ts).await.unwrap();
        assert_eq!(fetched.reactions.len(), 1);
        assert_eq!(fetched.reactions[0].count, 1);
    }

    #[tokio::test]
    async fn reaction_remove_restores_the_original_message() {
        let state = State::new(Persistence::disabled());
        let stored = state.add_message(message(PRESET_GENERAL, "")).await.unwrap();
        state.add_reaction(PRESET_GENERAL, &stored.ts, "+1", "U_simple").await.unwrap();
        state.remove_reaction(PRESET_GENERAL, &stored.ts, "+1", "U_simple").await.unwrap();

        let fetched = state.get_message(PRESET_GENERAL, &stored.ts).await.unwrap();
        assert!(fetched.reactions.is_empty());
    }

    #[tokio::test]
    async fn bot_reconnect_preserves_identity_across_connections() {
        let state = State::new(Persistence::disabled());
        let first = state.register_bot("conn-1".to_string(), bot_config("simple")).await.unwrap();
        state.unregister_bot("conn-1").await;
        assert!(state.try_reconnect_bot().await);
        let second = state.register_bot("conn-2".to_string(), bot_config("simple")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.connection_id.as_deref(), Some("conn-2"));
    }

    /// Regression test: a scope switch with persistence disabled must never
    /// wipe channel messages already held in memory, since reloading from a
    /// disabled store returns nothing to replace them with.
    #[tokio::test]
    async fn scope_switch_without_persistence_keeps_channel_messages() {
        let state = State::new(Persistence::disabled());
        state.add_message(message(PRESET_GENERAL, "")).await.unwrap();

        state.register_bot("conn-a".to_string(), bot_config("bot-a")).await.unwrap();
        state.register_bot("conn-b".to_string(), bot_config("bot-b")).await.unwrap();

        let messages = state.all_messages().await;
        assert_eq!(messages.iter().filter(|m| m.channel == PRESET_GENERAL).count(), 1);
    }

    #[tokio::test]
    async fn dm_scoping_switches_and_restores_with_persistence_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = Persistence::open(&dir.path().join("db.sqlite"), &dir.path().join("uploads"))
            .await
            .expect("persistence should open");
        let state = State::new(persistence);
        state.hydrate().await.unwrap();

        state.register_bot("conn-a".to_string(), bot_config("bot-a")).await.unwrap();
        state.add_message(message(PRESET_GENERAL, "")).await.unwrap();
        state.add_message(message("D_bot-a", "")).await.unwrap();

        state.register_bot("conn-b".to_string(), bot_config("bot-b")).await.unwrap();
        let during_b = state.all_messages().await;
        assert!(during_b.iter().any(|m| m.channel == PRESET_GENERAL));
        assert!(!during_b.iter().any(|m| m.channel == "D_bot-a"));

        state.register_bot("conn-a2".to_string(), bot_config("bot-a")).await.unwrap();
        let restored = state.all_messages().await;
        assert!(restored.iter().any(|m| m.channel == "D_bot-a"));
    }
}
