//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. When unset, the platform data directory is
    /// used.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Filesystem path where uploaded media files are stored.
    /// Env: `MEDIA_STORAGE_PATH`
    /// Default: `./media`
    pub media_storage_path: PathBuf,

    /// Maximum media upload size in bytes (50 MiB).
    /// Env: `MAX_MEDIA_SIZE`
    pub max_media_size: usize,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley"`
    pub instance_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            media_storage_path: PathBuf::from("./media"),
            max_media_size: 50 * 1024 * 1024, // 50 MiB
            instance_name: "Parley".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(path) = std::env::var("MEDIA_STORAGE_PATH") {
            config.media_storage_path = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("MAX_MEDIA_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_media_size = n;
            } else {
                tracing::warn!(value = %val, "Invalid MAX_MEDIA_SIZE, using default");
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.max_media_size, 50 * 1024 * 1024);
        assert!(config.database_path.is_none());
    }
}
