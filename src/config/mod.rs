//! Configuration
//!
//! Settings come from an optional TOML file; every section and field falls
//! back to its default when absent.

mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{Result, SessionError};

impl AppConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SessionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| SessionError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session.debounce_ms == 0 {
            return Err(SessionError::Config(
                "session.debounce_ms must be greater than zero".to_string(),
            ));
        }
        if self.session.reconnect_delay_ms == 0
            || self.session.reconnect_max_delay_ms < self.session.reconnect_delay_ms
        {
            return Err(SessionError::Config(
                "session reconnect delays must be positive and ordered".to_string(),
            ));
        }
        if self.webrtc.data_channel_label.is_empty() {
            return Err(SessionError::Config(
                "webrtc.data_channel_label must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
