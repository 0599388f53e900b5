// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Default checkpoint database when `FLOWSTATE_DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/flowstate.db";

/// Flowstate node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL for the checkpoint store
    pub database_url: String,
    /// Number of affinity executor workers
    pub affinity_threads: usize,
    /// Whether checkpoints are written to storage
    pub checkpointing: bool,
    /// Node name, used as this node's peer description
    pub node_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            affinity_threads: 1,
            checkpointing: true,
            node_name: "node".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLOWSTATE_DATABASE_URL`: checkpoint store URL (default: `sqlite:.data/flowstate.db`)
    /// - `FLOWSTATE_AFFINITY_THREADS`: executor workers (default: 1)
    /// - `FLOWSTATE_CHECKPOINTING`: `true`/`false` (default: true)
    /// - `FLOWSTATE_NODE_NAME`: node name (default: `node`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            std::env::var("FLOWSTATE_DATABASE_URL").unwrap_or(defaults.database_url);
        if database_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "FLOWSTATE_DATABASE_URL",
                "must not be empty",
            ));
        }

        let affinity_threads: usize = std::env::var("FLOWSTATE_AFFINITY_THREADS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FLOWSTATE_AFFINITY_THREADS", "must be a positive integer")
            })?;
        if affinity_threads == 0 {
            return Err(ConfigError::Invalid(
                "FLOWSTATE_AFFINITY_THREADS",
                "must be a positive integer",
            ));
        }

        let checkpointing = match std::env::var("FLOWSTATE_CHECKPOINTING") {
            Ok(value) => parse_flag(&value).ok_or(ConfigError::Invalid(
                "FLOWSTATE_CHECKPOINTING",
                "must be true or false",
            ))?,
            Err(_) => defaults.checkpointing,
        };

        let node_name = std::env::var("FLOWSTATE_NODE_NAME").unwrap_or(defaults.node_name);

        Ok(Self {
            database_url,
            affinity_threads,
            checkpointing,
            node_name,
        })
    }

    /// The SQLite file path, if the database URL points at SQLite.
    pub fn sqlite_path(&self) -> Option<&str> {
        let rest = self.database_url.strip_prefix("sqlite:")?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        Some(rest.split('?').next().unwrap_or(rest))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
