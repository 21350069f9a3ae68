//! Configuration management for the Gmail MCP vault
//!
//! Handles paths, environment variables, timing knobs and the encryption key.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, GmailMcpError, Result};

/// Environment variable holding the base64 AES-256 key
pub const ENCRYPTION_KEY_VAR: &str = "GMAIL_MCP_ENCRYPTION_KEY";

/// Environment variable holding the end user's access key
pub const ACCESS_KEY_VAR: &str = "GMAIL_MCP_ACCESS_KEY";

/// Configuration for the Gmail MCP vault
#[derive(Clone)]
pub struct Config {
    /// Directory for storing configuration files
    pub config_dir: PathBuf,

    /// Path to OAuth keys file (client credentials)
    pub oauth_path: PathBuf,

    /// Path to the SQLite credential database
    pub database_path: PathBuf,

    /// Base64-encoded 32-byte token encryption key, if configured
    pub encryption_key: Option<String>,

    /// OAuth callback URL
    pub oauth_callback_url: String,

    /// OAuth callback port
    pub oauth_callback_port: u16,

    /// OAuth scopes requested during authorization
    pub scopes: Vec<String>,

    /// Access tokens are refreshed this long before their stated expiry
    pub refresh_margin: Duration,

    /// Lifetime of an OAuth anti-forgery state
    pub auth_state_ttl: Duration,

    /// Lifetime of a confirmation token
    pub confirmation_ttl: Duration,

    /// Timeout applied to every call to the OAuth provider and Gmail
    pub http_timeout: Duration,

    /// How often expired states and confirmation tokens are purged
    pub sweep_interval: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("config_dir", &self.config_dir)
            .field("oauth_path", &self.oauth_path)
            .field("database_path", &self.database_path)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("oauth_callback_url", &self.oauth_callback_url)
            .field("scopes", &self.scopes)
            .field("refresh_margin", &self.refresh_margin)
            .field("auth_state_ttl", &self.auth_state_ttl)
            .field("confirmation_ttl", &self.confirmation_ttl)
            .field("http_timeout", &self.http_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl Config {
    /// Create a new configuration from the environment, with default paths
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Self::from_env_in(config_dir)
    }

    /// Build a configuration rooted at `config_dir` without touching `$HOME`
    pub fn from_env_in(config_dir: PathBuf) -> Result<Self> {
        let oauth_path = std::env::var("GMAIL_OAUTH_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir.join("gcp-oauth.keys.json"));

        let database_path = std::env::var("GMAIL_MCP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir.join("credentials.db"));

        let encryption_key = std::env::var(ENCRYPTION_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty());

        let oauth_callback_port = env_parse("GMAIL_OAUTH_PORT", 3000u16)?;
        let oauth_callback_url = format!("http://localhost:{}/oauth2callback", oauth_callback_port);

        Ok(Self {
            config_dir,
            oauth_path,
            database_path,
            encryption_key,
            oauth_callback_url,
            oauth_callback_port,
            scopes: vec![
                "openid".to_string(),
                "https://mail.google.com/".to_string(),
            ],
            refresh_margin: Duration::from_secs(env_parse("GMAIL_MCP_REFRESH_MARGIN_SECS", 60)?),
            auth_state_ttl: Duration::from_secs(env_parse("GMAIL_MCP_AUTH_STATE_TTL_SECS", 600)?),
            confirmation_ttl: Duration::from_secs(env_parse(
                "GMAIL_MCP_CONFIRMATION_TTL_SECS",
                300,
            )?),
            http_timeout: Duration::from_secs(env_parse("GMAIL_MCP_HTTP_TIMEOUT_SECS", 30)?),
            sweep_interval: Duration::from_secs(env_parse("GMAIL_MCP_SWEEP_INTERVAL_SECS", 60)?),
        })
    }

    /// Get the configuration directory, creating it if necessary
    fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::home_dir()
            .ok_or_else(|| {
                GmailMcpError::Config(ConfigError::DirNotFound {
                    path: "~".to_string(),
                })
            })?
            .join(".gmail-mcp");

        if !config_dir.exists() {
            std::fs::create_dir_all(&config_dir).map_err(|_| {
                GmailMcpError::Config(ConfigError::DirCreationFailed {
                    path: config_dir.display().to_string(),
                })
            })?;
        }

        Ok(config_dir)
    }

    /// The encryption key, or a configuration error naming the variable
    pub fn require_encryption_key(&self) -> Result<&str> {
        self.encryption_key.as_deref().ok_or_else(|| {
            GmailMcpError::Config(ConfigError::MissingEnvVar {
                var: ENCRYPTION_KEY_VAR.to_string(),
            })
        })
    }

    /// Check if OAuth keys file exists
    pub fn oauth_keys_exist(&self) -> bool {
        self.oauth_path.exists()
    }

    /// Try to find OAuth keys in current directory and copy to config dir
    pub fn find_and_copy_oauth_keys(&self) -> Result<bool> {
        let local_oauth = std::env::current_dir()?.join("gcp-oauth.keys.json");

        if local_oauth.exists() && !self.oauth_keys_exist() {
            std::fs::copy(&local_oauth, &self.oauth_path)?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Parse an optional numeric environment variable
fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            GmailMcpError::Config(ConfigError::InvalidConfig {
                message: format!("{} must be a number, got '{}'", var, raw),
            })
        }),
        Err(_) => Ok(default),
    }
}

/// Gmail API constants
pub mod gmail {
    /// Base URL for Gmail API
    pub const API_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

    /// User ID for the authenticated user
    pub const USER_ID: &str = "me";
}
