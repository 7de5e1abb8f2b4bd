use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Discord OAuth application and REST API settings
#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Must match a redirect registered on the Discord application
    pub redirect_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_authorize_url() -> String {
    "https://discord.com/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://discord.com/api/oauth2/token".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["identify".to_string(), "guilds".to_string()]
}

/// Web server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Externally visible base URL; an `https` scheme switches cookies to secure mode
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            public_url: default_public_url(),
        }
    }
}

impl WebConfig {
    pub fn is_secure(&self) -> bool {
        self.public_url.starts_with("https://")
    }
}

/// Session vault settings
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Passphrase the token encryption key is derived from
    pub secret: String,
    #[serde(default = "default_cookie_max_age")]
    pub cookie_max_age_secs: u64,
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,
}

fn default_cookie_max_age() -> u64 {
    30 * 60
}

fn default_refresh_window() -> u64 {
    5 * 60
}

impl SessionConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            cookie_max_age_secs: default_cookie_max_age(),
            refresh_window_secs: default_refresh_window(),
        }
    }
}

/// Database configuration for the session store
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://guildboard.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Admission coordinator policy
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Quota units always held back from the reported remaining count
    pub reserve_buffer: i64,
    pub queue_timeout_ms: u64,
    pub max_queue_size: usize,
    /// Limit assumed before the provider has reported anything
    pub default_limit: i64,
    pub staleness_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            reserve_buffer: 2,
            queue_timeout_ms: 7_000,
            max_queue_size: 150,
            default_limit: 5,
            staleness_ms: 60_000,
        }
    }
}

/// Batch refresh settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub refresh_cooldown_secs: u64,
    /// Cooldown used when a rate limit arrives without a retry-after hint
    pub rate_limit_cooldown_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 1_000,
            refresh_cooldown_secs: 60,
            rate_limit_cooldown_secs: 60,
        }
    }
}

impl BatchSettings {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub web: WebConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub batch: BatchSettings,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: GUILDBOARD_)
            // e.g., GUILDBOARD_SESSION__SECRET, GUILDBOARD_WEB__PORT
            .add_source(
                Environment::with_prefix("GUILDBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG.get().expect("Config not initialized. Call AppConfig::init() first.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let coordinator = CoordinatorSettings::default();
        assert_eq!(coordinator.reserve_buffer, 2);
        assert_eq!(coordinator.queue_timeout_ms, 7_000);
        assert_eq!(coordinator.max_queue_size, 150);
        assert_eq!(coordinator.default_limit, 5);
        assert_eq!(coordinator.staleness_ms, 60_000);

        let batch = BatchSettings::default();
        assert_eq!(batch.batch_size, 5);
        assert_eq!(batch.inter_batch_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_secure_context_from_public_url() {
        let mut web = WebConfig::default();
        assert!(!web.is_secure());
        web.public_url = "https://board.example.com".to_string();
        assert!(web.is_secure());
    }
}
