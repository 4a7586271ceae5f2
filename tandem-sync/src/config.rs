//! Client configuration.

use serde::{Deserialize, Serialize};
use tandem_core::{ConfigError, SessionConfig};

/// Everything a [`SessionClient`](crate::SessionClient) needs besides its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Root namespace of every store path
    pub study_id: String,
    pub session_config: SessionConfig,
    /// State paths to subscribe to on session start (empty = whole state root)
    pub listener_paths: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            study_id: "tandem".to_string(),
            session_config: SessionConfig::default(),
            listener_paths: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Config for `study_id` with the given quorum and capacity.
    pub fn for_testing(study_id: &str, min_players: usize, max_players: usize) -> Self {
        Self {
            study_id: study_id.to_string(),
            session_config: SessionConfig::for_testing(min_players, max_players),
            ..Self::default()
        }
    }

    /// Parse a camelCase JSON config object.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.study_id.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("studyId must not be empty".into()));
        }
        crate::path::segments(&self.study_id)
            .map_err(|_| ConfigError::Invalid(format!("studyId '{}' is not a valid path", self.study_id)))?;
        self.session_config.validate()
    }

    /// Listener paths with the empty default expanded to the state root.
    pub fn effective_listener_paths(&self) -> Vec<String> {
        if self.listener_paths.is_empty() {
            vec![String::new()]
        } else {
            self.listener_paths.clone()
        }
    }
}
