//! Tool configuration: resolving database names to filesystem paths.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DB_EXTENSION: &str = "couch";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    database_dir: Option<PathBuf>,
}

/// Resolved tool configuration. `database_dir` defaults to the current
/// directory when no config file sets it.
#[derive(Clone, Debug)]
pub struct ToolConfig {
    pub database_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("."),
        }
    }
}

impl ToolConfig {
    /// Loads from an explicit config path, falling back to the per-user
    /// default location and then to built-in defaults when neither exists.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let raw = match path {
            Some(ref config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        Ok(Self {
            database_dir: raw.database_dir.unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn with_database_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            database_dir: dir.into(),
        }
    }

    /// `<database_dir>/<name>.couch`. Names may carry path separators, as
    /// the `lost+found/` namespace does.
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.database_dir.join(format!("{name}.{DB_EXTENSION}"))
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("driftwood").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn db_path_appends_extension_under_database_dir() {
        let config = ToolConfig::with_database_dir("/var/lib/driftwood");
        assert_eq!(
            config.db_path("orders"),
            PathBuf::from("/var/lib/driftwood/orders.couch")
        );
        assert_eq!(
            config.db_path("lost+found/orders"),
            PathBuf::from("/var/lib/driftwood/lost+found/orders.couch")
        );
    }

    #[test]
    fn load_reads_database_dir_from_toml() {
        let dir = tempdir().expect("temp dir");
        let config_path = dir.path().join("config.toml");
        let mut f = fs::File::create(&config_path).expect("create");
        writeln!(f, "database_dir = \"/data/dbs\"").expect("write");

        let config = ToolConfig::load(Some(config_path)).expect("load");
        assert_eq!(config.database_dir, PathBuf::from("/data/dbs"));
    }

    #[test]
    fn load_defaults_to_current_directory() {
        let dir = tempdir().expect("temp dir");
        let missing = dir.path().join("absent.toml");
        let config = ToolConfig::load(Some(missing)).expect("load");
        assert_eq!(config.database_dir, PathBuf::from("."));
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempdir().expect("temp dir");
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "database_dir = [not toml").expect("write");
        assert!(matches!(
            ToolConfig::load(Some(config_path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
