// common/src/config.rs
use crate::error::ConfigError;
use config::{Config as ConfigFile, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Central configuration for the gateway
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Secure WebSocket URL of the cluster-management API.
    pub backend_url: Option<String>,
    /// Run against the in-process simulated backend instead of a live one.
    pub sandbox: bool,
    /// Accept self-signed backend certificates.
    pub backend_insecure: bool,
    pub token_ttl_secs: u64,
    pub token_sweep_secs: u64,
    pub auth_timeout_secs: u64,
    pub debug: bool,

    // Static file serving configuration
    pub gui_root: Option<String>,
    pub tests_root: Option<String>,
    /// Address of the plain HTTP listener redirecting to HTTPS.
    pub redirect_addr: Option<String>,

    pub sandbox_user: String,
    pub sandbox_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8888".to_string(),
            backend_url: None,
            sandbox: false,
            backend_insecure: true,
            token_ttl_secs: 120,
            token_sweep_secs: 120,
            auth_timeout_secs: 30,
            debug: false,
            gui_root: None,
            tests_root: None,
            redirect_addr: None,
            sandbox_user: "user-admin".to_string(),
            sandbox_password: "sandbox".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        let config: Config = ConfigFile::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Environment variables with prefix "APP", e.g. APP__SANDBOX=true
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from files, falling back to plain environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        match Self::load() {
            Ok(config) => {
                tracing::info!("Configuration loaded from files and environment");
                Ok(config)
            }
            Err(ConfigError::Load(e)) => {
                tracing::warn!("Failed to load configuration from files: {}", e);
                tracing::info!("Falling back to environment variables only");

                let defaults = Self::default();
                let config = Self {
                    listen_addr: env::var("GATEWAY_ADDR").unwrap_or(defaults.listen_addr),
                    backend_url: env::var("BACKEND_URL").ok(),
                    sandbox: env_flag("SANDBOX").unwrap_or(defaults.sandbox),
                    backend_insecure: env_flag("BACKEND_INSECURE").unwrap_or(defaults.backend_insecure),
                    token_ttl_secs: env_number("TOKEN_TTL").unwrap_or(defaults.token_ttl_secs),
                    token_sweep_secs: env_number("TOKEN_SWEEP").unwrap_or(defaults.token_sweep_secs),
                    auth_timeout_secs: env_number("AUTH_TIMEOUT").unwrap_or(defaults.auth_timeout_secs),
                    debug: env_flag("DEBUG").unwrap_or(defaults.debug),
                    gui_root: env::var("GUI_ROOT").ok(),
                    tests_root: env::var("TESTS_ROOT").ok(),
                    redirect_addr: env::var("REDIRECT_ADDR").ok(),
                    sandbox_user: env::var("SANDBOX_USER").unwrap_or(defaults.sandbox_user),
                    sandbox_password: env::var("SANDBOX_PASSWORD").unwrap_or(defaults.sandbox_password),
                };
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox {
            return Ok(());
        }
        let raw = self.backend_url.as_deref().ok_or(ConfigError::MissingBackend)?;
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBackend {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "wss" | "ws" => Ok(()),
            other => Err(ConfigError::InvalidBackend {
                url: raw.to_string(),
                reason: format!("unsupported scheme {}", other),
            }),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn token_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.token_sweep_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| v.to_lowercase() == "true")
}

fn env_number(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}
