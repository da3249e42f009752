//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./trefla.db`
    pub database_path: PathBuf,

    /// Super-admin bearer token for `/admin/*` endpoints.  Employees
    /// authenticate with their own token from the `admins` table.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (no super admin).
    pub admin_token: Option<String>,

    /// Device push gateway URL.
    /// Env: `PUSH_ENDPOINT`
    /// Default: empty (pushes are only logged).
    pub push_endpoint: Option<String>,

    /// Server key sent to the push gateway.
    /// Env: `PUSH_SERVER_KEY`
    pub push_server_key: Option<String>,

    /// Timeout for a single push request.
    /// Env: `PUSH_TIMEOUT_SECS`
    /// Default: 10 seconds.
    pub push_timeout: Duration,

    /// Outbound queue length per live session.  Events for a full queue
    /// are dropped.
    /// Env: `SESSION_BUFFER`
    /// Default: `64`
    pub session_buffer: usize,

    /// Human-readable name reported by `/health`.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Trefla"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./trefla.db"),
            admin_token: None,
            push_endpoint: None,
            push_server_key: None,
            push_timeout: Duration::from_secs(10),
            session_buffer: 64,
            instance_name: "Trefla".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.admin_token = non_empty(lookup("ADMIN_TOKEN"));
        config.push_endpoint = non_empty(lookup("PUSH_ENDPOINT"));
        config.push_server_key = non_empty(lookup("PUSH_SERVER_KEY"));

        if let Some(val) = lookup("PUSH_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.push_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid PUSH_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("SESSION_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.session_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid SESSION_BUFFER, using default"),
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn push_enabled(&self) -> bool {
        self.push_endpoint.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
