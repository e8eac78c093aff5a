//! Entities of the emulated platform: users, channels, messages, reactions,
//! files, modal views, trigger contexts, pending uploads, and connected bots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DM channel id prefix (`"D_" + botId`).
pub const DM_PREFIX: &str = "D_";
/// Channel id prefix for user-created channels (`"C_" + upper(name)`).
pub const CHANNEL_PREFIX: &str = "C_";

pub const PRESET_GENERAL: &str = "C_GENERAL";
pub const PRESET_SHOWCASE: &str = "C_SHOWCASE";

/// Synthetic user id standing in for the human operating the simulator UI.
pub const SIMULATED_USER: &str = "__SIMULATED_USER__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub real_name: String,
    pub is_bot: bool,
    pub profile: Profile,
}

impl User {
    pub fn bot_identity(bot_id: &str) -> Self {
        let id = format!("U_{bot_id}");
        User {
            id: id.clone(),
            name: bot_id.to_string(),
            real_name: bot_id.to_string(),
            is_bot: true,
            profile: Profile {
                display_name: bot_id.to_string(),
            },
        }
    }

    pub fn simulated_user() -> Self {
        User {
            id: SIMULATED_USER.to_string(),
            name: "simulated_user".to_string(),
            real_name: "Simulated User".to_string(),
            is_bot: false,
            profile: Profile {
                display_name: "Simulated User".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub is_channel: bool,
    pub is_im: bool,
    pub is_member: bool,
}

impl Channel {
    pub fn preset(id: &str, name: &str) -> Self {
        Channel {
            id: id.to_string(),
            name: name.to_string(),
            is_channel: true,
            is_im: false,
            is_member: true,
        }
    }

    pub fn dm_for_bot(bot_id: &str) -> Self {
        Channel {
            id: format!("{DM_PREFIX}{bot_id}"),
            name: format!("dm-{bot_id}"),
            is_channel: false,
            is_im: true,
            is_member: true,
        }
    }

    pub fn is_preset(id: &str) -> bool {
        id == PRESET_GENERAL || id == PRESET_SHOWCASE
    }

    pub fn is_dm(id: &str) -> bool {
        id.starts_with(DM_PREFIX)
    }

    /// Normalize a user-supplied channel name into its canonical id.
    pub fn normalize_id(name: &str) -> String {
        format!("{CHANNEL_PREFIX}{}", name.to_uppercase())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    pub users: Vec<String>,
    pub count: usize,
}

impl Reaction {
    fn recount(&mut self) {
        self.count = self.users.len();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub ts: String,
    pub channel: String,
    pub user: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Value>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileShareRef>,
}

impl Message {
    /// A message is a thread root when its own `ts` is also its `thread_ts`.
    pub fn is_thread_root(&self) -> bool {
        self.thread_ts.as_deref() == Some(self.ts.as_str())
    }

    /// Add `user` to the named reaction, creating it if absent. Returns
    /// `false` if the user already reacted with this name (no-op, keeps
    /// the operation idempotent).
    pub fn add_reaction(&mut self, name: &str, user: &str) -> bool {
        if let Some(existing) = self.reactions.iter_mut().find(|r| r.name == name) {
            if existing.users.iter().any(|u| u == user) {
                return false;
            }
            existing.users.push(user.to_string());
            existing.recount();
            return true;
        }
        self.reactions.push(Reaction {
            name: name.to_string(),
            users: vec![user.to_string()],
            count: 1,
        });
        true
    }

    /// Remove `user` from the named reaction. Returns an error-signal
    /// `false` if there was no such reaction entry for this user.
    pub fn remove_reaction(&mut self, name: &str, user: &str) -> bool {
        let Some(existing) = self.reactions.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        let before = existing.users.len();
        existing.users.retain(|u| u != user);
        existing.recount();
        let removed = existing.users.len() != before;
        self.reactions.retain(|r| !r.users.is_empty());
        removed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileShareRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub mimetype: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_private: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "isExpanded")]
    pub is_expanded: bool,
}

/// Persistence-level scope tag attached to DM rows; `None` for channel rows.
pub type Scope = Option<String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewState {
    pub id: String,
    pub view: Value,
    pub trigger_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub bot_id: String,
}

impl ViewState {
    /// The stored view document with its server-assigned `id` embedded, as
    /// returned to bots from `views.open`/`views.update`.
    pub fn view_with_id(&self) -> Value {
        let mut view = self.view.clone();
        if let Some(obj) = view.as_object_mut() {
            obj.insert("id".to_string(), Value::String(self.id.clone()));
        }
        view
    }
}

#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub user_id: String,
    pub channel_id: Option<String>,
    pub user_name: Option<String>,
    pub channel_name: Option<String>,
    pub created_at: std::time::Instant,
}

impl TriggerContext {
    pub const TTL: std::time::Duration = std::time::Duration::from_secs(30);

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > Self::TTL
    }
}

#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub file_id: String,
    pub filename: String,
    pub length: u64,
    pub data: Option<Vec<u8>>,
    pub created_at: std::time::Instant,
}

impl PendingUpload {
    pub const TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > Self::TTL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedBot {
    pub id: String,
    pub connection_id: Option<String>,
    pub app_config: Value,
    pub connected_at: String,
    pub status: BotStatus,
}

impl ConnectedBot {
    pub fn name(&self) -> Option<&str> {
        self.app_config
            .get("app")
            .and_then(|app| app.get("name"))
            .and_then(|v| v.as_str())
    }
}
