//! Database location configuration.

use std::path::PathBuf;

/// Where the delegate database lives on disk.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Default database file, relative to the user's home directory.
    pub const DEFAULT_RELATIVE_PATH: &'static str = ".delegate/tasks.db";

    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Resolve the database path: `DELEGATE_DATABASE_PATH` env var if set,
    /// otherwise `$HOME/.delegate/tasks.db`.
    pub fn resolve() -> Self {
        if let Ok(path) = std::env::var("DELEGATE_DATABASE_PATH") {
            return Self::new(path);
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(Self::DEFAULT_RELATIVE_PATH))
    }

    /// Directory holding spilled per-task output files, a sibling of the
    /// database file.
    pub fn output_dir(&self) -> PathBuf {
        self.database_path
            .parent()
            .map(|p| p.join("output"))
            .unwrap_or_else(|| PathBuf::from("output"))
    }
}
