mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("No config file found for environment {env:?} (searched: {searched:?})")]
    NotFound { env: String, searched: Vec<PathBuf> },
    #[error("Invalid DSN for database {id}: {reason}")]
    InvalidDsn { id: u32, reason: String },
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Load the configuration for the environment named by `APP_ENV`
///
/// Defaults to `develop`. The first existing candidate path wins.
pub fn load_for_env() -> Result<Config, ConfigError> {
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "develop".to_string());
    let candidates = config_candidates(&env);

    for path in &candidates {
        if path.is_file() {
            info!(path = %path.display(), env = %env, "Loading configuration");
            return load_config(path);
        }
        debug!(path = %path.display(), "Config candidate not found");
    }

    Err(ConfigError::NotFound {
        env,
        searched: candidates,
    })
}

fn config_candidates(env: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("config/{env}/shardgroup.toml")),
        PathBuf::from(format!("../config/{env}/shardgroup.toml")),
        PathBuf::from("shardgroup.toml"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_candidates_follow_env() {
        let paths = config_candidates("staging");
        assert_eq!(paths[0], PathBuf::from("config/staging/shardgroup.toml"));
        assert_eq!(paths.last().unwrap(), &PathBuf::from("shardgroup.toml"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardgroup.toml");
        std::fs::write(
            &path,
            r#"
[[database.groups.master]]
id = 1
driver = "sqlite"
dsn = "master.db"

[database.groups.sharding]
total_tables = 8
tables_per_database = 8

[[database.groups.sharding.databases]]
id = 1
driver = "sqlite"
dsn = "shard1.db"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.database.groups.master.len(), 1);
        assert_eq!(config.database.groups.sharding.databases.len(), 1);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/shardgroup.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
