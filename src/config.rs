//! Process configuration, loaded entirely from the environment.

/// Emulator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port. `PORT` env var, default 7557.
    pub port: u16,

    /// Persistence root. `DATA_DIR` env var. When absent, persistence is
    /// disabled and the emulator runs in-memory only.
    pub data_dir: Option<std::path::PathBuf>,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7557);

        let data_dir = std::env::var_os("DATA_DIR").map(std::path::PathBuf::from);

        Self { port, data_dir }
    }

    /// Path to the SQLite database file, if persistence is enabled.
    pub fn sqlite_path(&self) -> Option<std::path::PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("simulator.sqlite"))
    }

    /// Path to the directory holding uploaded file binaries, if persistence
    /// is enabled.
    pub fn uploads_dir(&self) -> Option<std::path::PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("uploads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_path_is_none_without_data_dir() {
        let config = Config {
            port: 7557,
            data_dir: None,
        };
        assert!(config.sqlite_path().is_none());
    }

    #[test]
    fn sqlite_path_is_scoped_to_data_dir() {
        let config = Config {
            port: 7557,
            data_dir: Some("/tmp/emu".into()),
        };
        assert_eq!(
            config.sqlite_path(),
            Some(std::path::PathBuf::from("/tmp/emu/simulator.sqlite"))
        );
    }
}
