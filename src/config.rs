use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub assets: AssetConfig,
    pub logging: LoggingConfig,
    pub slack_channel_url: Option<String>,
    pub loader_io_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub socket_path: Option<String>,
    /// Pool acquisition timeout in seconds.
    pub connection_timeout: u64,
    /// Physical column cap before a logical table is split.
    pub max_columns: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Event-loop lag threshold in milliseconds; 0 disables the check.
    pub cpu_throttle_ms: u64,
    /// Maximum queued query depth against the pool; 0 disables the check.
    pub db_throttle: usize,
    /// When false, immutable caching headers are never emitted.
    pub cache_allow: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    /// Adapter name: "local" or "s3".
    pub store: String,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Optional secondary log destination (file path); "none" disables it.
    pub external: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env first so the overrides below see its variables
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("database.host", "localhost")?
            .set_default("database.name", "ddf")?
            .set_default("database.user", "ddf")?
            .set_default("database.password", None::<String>)?
            .set_default("database.socket_path", None::<String>)?
            .set_default("database.connection_timeout", 5)?
            .set_default("database.max_columns", 1000)?
            .set_default("server.port", 80)?
            .set_default("server.cpu_throttle_ms", 200)?
            .set_default("server.db_throttle", 5)?
            .set_default("server.cache_allow", true)?
            .set_default("assets.store", "local")?
            .set_default("assets.bucket", None::<String>)?
            .set_default("logging.level", "info")?
            .set_default("logging.external", "none")?
            .set_default("slack_channel_url", None::<String>)?
            .set_default("loader_io_token", None::<String>)?;

        if let Ok(port) = env::var("HTTP_PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(80))?;
        }

        if let Ok(host) = env::var("DB_HOST") {
            builder = builder.set_override("database.host", host)?;
        }

        if let Ok(name) = env::var("DB_NAME") {
            builder = builder.set_override("database.name", name)?;
        }

        if let Ok(user) = env::var("DB_USER") {
            builder = builder.set_override("database.user", user)?;
        }

        if let Ok(pwd) = env::var("DB_PWD") {
            builder = builder.set_override("database.password", Some(pwd))?;
        }

        if let Ok(socket) = env::var("DB_SOCKET_PATH") {
            builder = builder.set_override("database.socket_path", Some(socket))?;
        }

        if let Ok(timeout) = env::var("DB_CONNECTION_TIMEOUT") {
            builder = builder.set_override(
                "database.connection_timeout",
                timeout.parse::<u64>().unwrap_or(5),
            )?;
        }

        if let Ok(max_columns) = env::var("DB_MAX_COLUMNS") {
            builder = builder.set_override(
                "database.max_columns",
                max_columns.parse::<i64>().unwrap_or(1000),
            )?;
        }

        if let Ok(cpu) = env::var("CPU_THROTTLE") {
            builder =
                builder.set_override("server.cpu_throttle_ms", cpu.parse::<u64>().unwrap_or(200))?;
        }

        if let Ok(depth) = env::var("DB_THROTTLE") {
            builder =
                builder.set_override("server.db_throttle", depth.parse::<i64>().unwrap_or(5))?;
        }

        if let Ok(allow) = env::var("CACHE_ALLOW") {
            builder = builder.set_override("server.cache_allow", allow != "false")?;
        }

        if let Ok(store) = env::var("ASSET_STORE") {
            builder = builder.set_override("assets.store", store)?;
        }

        if let Ok(bucket) = env::var("ASSET_STORE_BUCKET") {
            builder = builder.set_override("assets.bucket", Some(bucket))?;
        }

        if let Ok(webhook) = env::var("SLACK_CHANNEL_URL") {
            builder = builder.set_override("slack_channel_url", Some(webhook))?;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            builder = builder.set_override("logging.level", level)?;
        }

        if let Ok(external) = env::var("EXTERNAL_LOG") {
            builder = builder.set_override("logging.external", external)?;
        }

        if let Ok(token) = env::var("LOADER_IO_TOKEN") {
            builder = builder.set_override("loader_io_token", Some(token))?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("0.0.0.0:{}", self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation keeps these in one sequential test
    #[test]
    fn test_config_defaults_and_overrides() {
        env::remove_var("HTTP_PORT");
        env::remove_var("DB_HOST");
        env::remove_var("DB_MAX_COLUMNS");
        env::remove_var("CACHE_ALLOW");

        let config = Config::from_env().unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.database.max_columns, 1000);
        assert_eq!(config.server.cpu_throttle_ms, 200);
        assert_eq!(config.server.db_throttle, 5);
        assert!(config.server.cache_allow);
        assert_eq!(config.database.connection_timeout, 5);

        env::set_var("CACHE_ALLOW", "false");
        env::set_var("DB_MAX_COLUMNS", "10");
        let config = Config::from_env().unwrap();
        assert!(!config.server.cache_allow);
        assert_eq!(config.database.max_columns, 10);
        env::remove_var("CACHE_ALLOW");
        env::remove_var("DB_MAX_COLUMNS");
    }
}
