//! Build service connection settings

use serde::{Deserialize, Serialize};

/// Default API endpoint of the internal build service
pub const DEFAULT_API_URL: &str = "https://api.suse.de";

/// Build service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsConfig {
    /// API base URL, without trailing slash
    pub api_url: String,
    /// Account used for basic authentication
    pub user: Option<String>,
    /// Password or token for `user`
    pub password: Option<String>,
    /// Per-request timeout in seconds (0 disables it)
    pub timeout_secs: u64,
}

impl Default for ObsConfig {
    fn default() -> Self {
        ObsConfig {
            api_url: std::env::var("KLP_OBS_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            user: std::env::var("KLP_OBS_USER").ok(),
            password: std::env::var("KLP_OBS_PASSWORD").ok(),
            timeout_secs: 0,
        }
    }
}

impl ObsConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific endpoint
    pub fn new(api_url: &str) -> Self {
        ObsConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            user: None,
            password: None,
            timeout_secs: 0,
        }
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}
