//! Ledger configuration
//!
//! Resolution order: built-in defaults, then the `[storage]` table of a TOML
//! file, then environment overrides. `CAPTURE_LEDGER_DEV=1` pins the data
//! directory to a project-local `.ledger_dev/data` for development runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LedgerError, Result};
use crate::storage::AtomicWriter;

pub const APP_NAME: &str = "capture-ledger";
pub const CONFIG_FILENAME: &str = "config.toml";

pub const ENV_DATA_DIR: &str = "CAPTURE_LEDGER_DATA_DIR";
pub const ENV_DEV: &str = "CAPTURE_LEDGER_DEV";
const DEV_FOLDER: &str = ".ledger_dev";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub index_file: String,
    pub fallback_file: String,
    pub checkpoint_file: String,
    pub busy_timeout_ms: u64,
    /// fsync every fallback append
    pub sync_appends: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            index_file: "index.db".into(),
            fallback_file: "captures.jsonl".into(),
            checkpoint_file: "migration.checkpoint.json".into(),
            busy_timeout_ms: 30_000,
            sync_appends: true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    storage: LedgerConfig,
}

impl LedgerConfig {
    /// Defaults merged with `path` if it exists. Never writes.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Self::from_toml_str(&raw)?
        } else {
            tracing::debug!("[Config] {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.normalize()?;
        Ok(config)
    }

    /// Load `config_dir/config.toml`, writing the defaults there first if missing.
    pub fn ensure(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILENAME);
        if !path.exists() {
            let mut defaults = Self::default();
            defaults.normalize()?;
            defaults.save(&path)?;
            tracing::info!("[Config] Wrote default config: {}", path.display());
        }
        Self::load(&path)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| LedgerError::Config(e.to_string()))?;
        Ok(file.storage)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(&ConfigFile { storage: self.clone() })
            .map_err(|e| LedgerError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        AtomicWriter::write(path, self.to_toml_string()?.as_bytes())
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let truthy = |v: String| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");

        if lookup(ENV_DEV).map(truthy).unwrap_or(false) {
            let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            self.data_dir = root.join(DEV_FOLDER).join("data");
        } else if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Expand `~` and check the file names.
    pub fn normalize(&mut self) -> Result<()> {
        self.data_dir = expand_home(&self.data_dir);
        for (key, name) in [
            ("index_file", &self.index_file),
            ("fallback_file", &self.fallback_file),
            ("checkpoint_file", &self.checkpoint_file),
        ] {
            let plain = Path::new(name).file_name().map(|f| f == name.as_str()).unwrap_or(false);
            if !plain {
                return Err(LedgerError::Config(format!("{} must be a plain file name, got '{}'", key, name)));
            }
        }
        if self.busy_timeout_ms == 0 {
            return Err(LedgerError::Config("busy_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_file)
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.data_dir.join(&self.fallback_file)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(&self.checkpoint_file)
    }

    /// Advisory lock shared by every process writing to `data_dir`.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lock", self.index_file))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// `<config dir>/capture-ledger`, e.g. `~/.config/capture-ledger`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("data")
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
