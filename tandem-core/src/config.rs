//! Session configuration.
//!
//! Field names follow the camelCase keys of a study's `sessionConfig`
//! object, so a JSON config written for an existing study loads unchanged:
//!
//! ```json
//! { "minPlayersNeeded": 2, "maxPlayersNeeded": 2, "allowReplacements": true,
//!   "exitDelayWaitingRoom": 3, "recordData": false }
//! ```

use serde::{Deserialize, Serialize};

/// Matchmaking and lifecycle options shared by every client of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Quorum: player count that promotes a session from waiting to active
    pub min_players_needed: usize,
    /// Capacity of a session
    pub max_players_needed: usize,
    /// Maximum number of concurrent sessions (0 = unlimited)
    pub max_parallel_sessions: usize,
    /// Backfill departed players with players from other waiting rooms
    pub allow_replacements: bool,
    /// Countdown in seconds between quorum and session start (0 = none)
    pub exit_delay_waiting_room: u64,
    /// Grace period in seconds below quorum before the session ends (0 = evict immediately)
    pub max_duration_below_min_players_needed: u64,
    /// Age after which a session stops accepting players (0 = unlimited)
    pub max_hours_session: f64,
    /// Push every session transition and state mutation to the audit log
    pub record_data: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_players_needed: 2,
            max_players_needed: 2,
            max_parallel_sessions: 0,
            allow_replacements: false,
            exit_delay_waiting_room: 0,
            max_duration_below_min_players_needed: 0,
            max_hours_session: 0.0,
            record_data: false,
        }
    }
}

impl SessionConfig {
    /// Config with the given quorum and capacity, everything else default.
    pub fn for_testing(min_players_needed: usize, max_players_needed: usize) -> Self {
        Self {
            min_players_needed,
            max_players_needed,
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

    /// Check that the options describe a reachable session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players_needed == 0 {
            return Err(ConfigError::Invalid(
                "minPlayersNeeded must be at least 1".into(),
            ));
        }
        if self.max_players_needed < self.min_players_needed {
            return Err(ConfigError::Invalid(format!(
                "maxPlayersNeeded ({}) is below minPlayersNeeded ({})",
                self.max_players_needed, self.min_players_needed
            )));
        }
        if !self.max_hours_session.is_finite() || self.max_hours_session < 0.0 {
            return Err(ConfigError::Invalid(
                "maxHoursSession must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Whether a session started at `started_at` (0 = not yet) may still take players at `now`.
    pub fn within_session_hours(&self, started_at: u64, now: u64) -> bool {
        if self.max_hours_session == 0.0 || started_at == 0 {
            return true;
        }
        let hours = now.saturating_sub(started_at) as f64 / (1000.0 * 60.0 * 60.0);
        hours < self.max_hours_session
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The config text is not valid JSON for this shape
    Parse(String),
    /// The values are inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
