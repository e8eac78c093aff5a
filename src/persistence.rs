//! SQLite-backed persistence: messages, reactions, and file metadata, with
//! app-scoped DM isolation. Binary file payloads live alongside the database
//! under `<dataDir>/uploads/`.

use crate::error::Result;
use crate::model::{FileMeta, Message, Reaction};
use anyhow::Context as _;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row as _, SqlitePool};
use std::path::{Path, PathBuf};

/// A handle to the durable store, or `None` when persistence is disabled
/// (`DATA_DIR` unset) and the emulator runs in-memory only.
#[derive(Clone)]
pub struct Persistence {
    inner: Option<Inner>,
}

#[derive(Clone)]
struct Inner {
    pool: SqlitePool,
    uploads_dir: PathBuf,
}

impl Persistence {
    /// Open (creating if absent) the database at `sqlite_path`, with file
    /// binaries stored under `uploads_dir`. Runs schema creation.
    pub async fn open(sqlite_path: &Path, uploads_dir: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = sqlite_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create data directory")?;
        }
        tokio::fs::create_dir_all(uploads_dir)
            .await
            .context("failed to create uploads directory")?;

        let url = format!("sqlite:{}?mode=rwc", sqlite_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .context("failed to open sqlite database")?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .context("failed to enable WAL mode")?;

        run_schema(&pool).await?;

        Ok(Self {
            inner: Some(Inner {
                pool,
                uploads_dir: uploads_dir.to_path_buf(),
            }),
        })
    }

    /// Construct a disabled persistence handle (in-memory only session).
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Persist a message insert or replace. Errors are the caller's to log
    /// and swallow; in-memory state remains authoritative.
    pub async fn save_message(&self, message: &Message, scope: Option<&str>) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let reactions_json = serde_json::to_string(&message.reactions)?;
        let file_id = message.file.as_ref().map(|f| f.id.as_str());
        sqlx::query(
            r#"
            INSERT INTO simulator_messages
                (ts, channel, user, text, thread_ts, reactions, file_id, app_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(ts) DO UPDATE SET
                channel = excluded.channel,
                user = excluded.user,
                text = excluded.text,
                thread_ts = excluded.thread_ts,
                reactions = excluded.reactions,
                file_id = excluded.file_id,
                app_id = excluded.app_id
            "#,
        )
        .bind(&message.ts)
        .bind(&message.channel)
        .bind(&message.user)
        .bind(&message.text)
        .bind(&message.thread_ts)
        .bind(&reactions_json)
        .bind(file_id)
        .bind(scope)
        .execute(&inner.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_message(&self, ts: &str) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        sqlx::query("DELETE FROM simulator_messages WHERE ts = ?")
            .bind(ts)
            .execute(&inner.pool)
            .await?;
        Ok(())
    }

    /// Load every channel message, plus DM messages whose `app_id` matches
    /// `current_scope`.
    pub async fn load_messages(&self, current_scope: Option<&str>) -> Result<Vec<Message>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT ts, channel, user, text, thread_ts, reactions, file_id FROM simulator_messages \
             WHERE channel NOT LIKE 'D\\_%' ESCAPE '\\' OR app_id = ? \
             ORDER BY ts ASC",
        )
        .bind(current_scope)
        .fetch_all(&inner.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let reactions_json: String = row.try_get("reactions")?;
            let reactions: Vec<Reaction> =
                serde_json::from_str(&reactions_json).unwrap_or_default();
            let file_id: Option<String> = row.try_get("file_id")?;
            messages.push(Message {
                ts: row.try_get("ts")?,
                channel: row.try_get("channel")?,
                user: row.try_get("user")?,
                text: row.try_get("text")?,
                thread_ts: row.try_get("thread_ts")?,
                subtype: None,
                blocks: None,
                reactions,
                file: file_id.map(|id| crate::model::FileShareRef { id }),
            });
        }
        Ok(messages)
    }

    /// Validate `id` is a bare basename (no path traversal), then write the
    /// binary to `<uploads_dir>/<id>` and the metadata row. No metadata row
    /// is written if the binary write fails.
    pub async fn save_file(
        &self,
        meta: &FileMeta,
        scope: Option<&str>,
        bytes: &[u8],
    ) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        sanitize_basename(&meta.id)?;

        let path = inner.uploads_dir.join(&meta.id);
        tokio::fs::write(&path, bytes)
            .await
            .context("failed to write file binary")?;

        sqlx::query(
            r#"
            INSERT INTO simulator_files
                (id, name, title, mimetype, size, channel, user, app_id, is_expanded, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                title = excluded.title,
                mimetype = excluded.mimetype,
                size = excluded.size,
                is_expanded = excluded.is_expanded
            "#,
        )
        .bind(&meta.id)
        .bind(&meta.name)
        .bind(&meta.title)
        .bind(&meta.mimetype)
        .bind(meta.size as i64)
        .bind(meta.channels.first())
        .bind(&meta.user)
        .bind(scope)
        .bind(meta.is_expanded)
        .execute(&inner.pool)
        .await?;
        Ok(())
    }

    pub async fn update_file_expanded(&self, id: &str, is_expanded: bool) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        sqlx::query("UPDATE simulator_files SET is_expanded = ? WHERE id = ?")
            .bind(is_expanded)
            .bind(id)
            .execute(&inner.pool)
            .await?;
        Ok(())
    }

    pub async fn load_files(&self, current_scope: Option<&str>) -> Result<Vec<FileMeta>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT id, name, title, mimetype, size, channel, user, is_expanded \
             FROM simulator_files \
             WHERE channel IS NULL OR channel NOT LIKE 'D\\_%' ESCAPE '\\' OR app_id = ? \
             ORDER BY created_at ASC",
        )
        .bind(current_scope)
        .fetch_all(&inner.pool)
        .await?;

        let mut files = Vec::with_capacity(rows.len());
        for row in rows {
            let channel: Option<String> = row.try_get("channel")?;
            files.push(FileMeta {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                title: row.try_get("title")?,
                mimetype: row.try_get("mimetype")?,
                size: row.try_get::<i64, _>("size")? as u64,
                url_private: None,
                channels: channel.into_iter().collect(),
                user: row.try_get("user")?,
                is_expanded: row.try_get("is_expanded")?,
            });
        }
        Ok(files)
    }

    /// Read a file's binary payload from disk.
    pub async fn read_file_bytes(&self, id: &str) -> Result<Vec<u8>> {
        let Some(inner) = &self.inner else {
            return Err(crate::error::Error::FileNotFound);
        };
        sanitize_basename(id)?;
        let bytes = tokio::fs::read(inner.uploads_dir.join(id))
            .await
            .map_err(|_| crate::error::Error::FileNotFound)?;
        Ok(bytes)
    }
}

/// Reject any id that is not its own basename: no `/`, no `..`, not empty.
fn sanitize_basename(id: &str) -> Result<()> {
    let path = Path::new(id);
    let is_plain = path.file_name().map(|n| n == std::ffi::OsStr::new(id)) == Some(true);
    if id.is_empty() || !is_plain || id.contains("..") {
        return Err(crate::error::Error::FileNotFound);
    }
    Ok(())
}

async fn run_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS simulator_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL UNIQUE,
            channel TEXT NOT NULL,
            user TEXT NOT NULL,
            text TEXT NOT NULL,
            thread_ts TEXT,
            reactions TEXT NOT NULL DEFAULT '[]',
            file_id TEXT,
            app_id TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create simulator_messages table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_channel ON simulator_messages(channel)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_thread_ts ON simulator_messages(thread_ts)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_app_id ON simulator_messages(app_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS simulator_files (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            title TEXT,
            mimetype TEXT NOT NULL,
            size INTEGER NOT NULL,
            channel TEXT,
            user TEXT,
            app_id TEXT,
            is_expanded BOOLEAN NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create simulator_files table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_channel ON simulator_files(channel)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_app_id ON simulator_files(app_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Persistence, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = Persistence::open(&dir.path().join("db.sqlite"), &dir.path().join("uploads"))
            .await
            .expect("persistence should open");
        (persistence, dir)
    }

    #[tokio::test]
    async fn round_trips_a_channel_message() {
        let (persistence, _dir) = setup().await;
        let message = Message {
            ts: "100.000001".to_string(),
            channel: "C_GENERAL".to_string(),
            user: "U_bot".to_string(),
            text: "hello".to_string(),
            thread_ts: None,
            subtype: None,
            blocks: None,
            reactions: Vec::new(),
            file: None,
        };
        persistence.save_message(&message, None).await.unwrap();

        let loaded = persistence.load_messages(Some("other-bot")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text, "hello");
    }

    #[tokio::test]
    async fn dm_messages_are_scoped_to_the_owning_bot() {
        let (persistence, _dir) = setup().await;
        let dm = Message {
            ts: "200.000001".to_string(),
            channel: "D_alice".to_string(),
            user: "U_alice".to_string(),
            text: "secret".to_string(),
            thread_ts: None,
            subtype: None,
            blocks: None,
            reactions: Vec::new(),
            file: None,
        };
        persistence.save_message(&dm, Some("alice")).await.unwrap();

        let as_alice = persistence.load_messages(Some("alice")).await.unwrap();
        assert_eq!(as_alice.len(), 1);

        let as_bob = persistence.load_messages(Some("bob")).await.unwrap();
        assert!(as_bob.is_empty());
    }

    #[tokio::test]
    async fn rejects_path_traversal_in_file_ids() {
        let (persistence, _dir) = setup().await;
        let meta = FileMeta {
            id: "../etc/passwd".to_string(),
            name: "x".to_string(),
            title: None,
            mimetype: "text/plain".to_string(),
            size: 1,
            url_private: None,
            channels: Vec::new(),
            user: None,
            is_expanded: false,
        };
        let err = persistence.save_file(&meta, None, b"x").await.unwrap_err();
        assert_eq!(err.kind(), "file_not_found");
    }

    #[tokio::test]
    async fn file_binary_round_trips() {
        let (persistence, _dir) = setup().await;
        let meta = FileMeta {
            id: "F_abc".to_string(),
            name: "a.png".to_string(),
            title: None,
            mimetype: "image/png".to_string(),
            size: 4,
            url_private: None,
            channels: vec!["C_GENERAL".to_string()],
            user: None,
            is_expanded: false,
        };
        persistence
            .save_file(&meta, None, &[1, 2, 3, 4])
            .await
            .unwrap();
        let bytes = persistence.read_file_bytes("F_abc").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }
}
