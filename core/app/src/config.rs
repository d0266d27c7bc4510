//! Ledger configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ledgerkeep_common::{AccountId, Actor, Error, Result};
use ledgerkeep_sync::SyncConfig;

/// Directory under the platform data dir holding local replicas.
pub const DATA_DIRNAME: &str = "ledgerkeep";

/// Default database file name.
pub const DATABASE_FILENAME: &str = "ledger.db";

/// Default location of the local database.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIRNAME)
        .join(DATABASE_FILENAME)
}

/// Configuration of one device's replica of an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Local SQLite database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Account (business) the replica belongs to.
    pub account_id: String,
    /// Signed-in user.
    pub actor: Actor,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl LedgerConfig {
    pub fn new(account_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            database_path: default_database_path(),
            account_id: account_id.into(),
            actor,
            sync: SyncConfig::default(),
        }
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn account(&self) -> Result<AccountId> {
        AccountId::new(self.account_id.clone())
    }

    /// Load a configuration file (JSON).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::InvalidInput(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.account()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerkeep_sync::SyncMode;
    use tempfile::TempDir;

    #[test]
    fn test_default_database_path() {
        let path = default_database_path();
        assert!(path.ends_with("ledgerkeep/ledger.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("ledger.json");

        let config = LedgerConfig::new("shop-1", Actor::new("u-1", "owner"))
            .with_database_path(dir.path().join("ledger.db"))
            .with_sync(SyncConfig::default().with_mode(SyncMode::Manual));
        config.save(&path).unwrap();

        let loaded = LedgerConfig::load(&path).unwrap();
        assert_eq!(loaded.account_id, "shop-1");
        assert_eq!(loaded.actor, Actor::new("u-1", "owner"));
        assert_eq!(loaded.sync.mode, SyncMode::Manual);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"account_id": "shop-1", "actor": {"id": "u-1", "role": "cashier"}}"#,
        )
        .unwrap();

        let loaded = LedgerConfig::load(&path).unwrap();
        assert_eq!(loaded.database_path, default_database_path());
        assert_eq!(loaded.sync.pull_batch_size, 200);
    }

    #[test]
    fn test_blank_account_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"account_id": " ", "actor": {"id": "u-1", "role": "cashier"}}"#,
        )
        .unwrap();

        assert!(LedgerConfig::load(&path).is_err());
    }
}
