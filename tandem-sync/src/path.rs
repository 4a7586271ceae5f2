//! Slash-separated store paths.
//!
//! Every document lives under a study namespace:
//!
//! ```text
//! <study>/sessions                         registry
//! <study>/presence/<playerId>              disconnect markers
//! <study>/states/<sessionId>/...           shared state tree
//! <study>/data/sessions/<sessionId>        registry audit log
//! <study>/recordedData/states/<sessionId>  state audit log
//! ```

use crate::error::StoreError;

const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Split a path into segments. Leading, trailing and doubled slashes are
/// ignored; the empty path addresses the root.
pub fn segments(path: &str) -> Result<Vec<String>, StoreError> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains(FORBIDDEN) {
                Err(StoreError::InvalidPath(path.to_string()))
            } else {
                Ok(s.to_string())
            }
        })
        .collect()
}

/// Join path pieces, skipping empty ones.
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn sessions(study_id: &str) -> String {
    join(&[study_id, "sessions"])
}

pub fn presence_root(study_id: &str) -> String {
    join(&[study_id, "presence"])
}

pub fn presence(study_id: &str, player_id: &str) -> String {
    join(&[study_id, "presence", player_id])
}

pub fn state(study_id: &str, session_id: &str, path: &str) -> String {
    join(&[study_id, "states", session_id, path])
}

pub fn session_log(study_id: &str, session_id: &str) -> String {
    join(&[study_id, "data", "sessions", session_id])
}

pub fn state_log(study_id: &str, session_id: &str) -> String {
    join(&[study_id, "recordedData", "states", session_id])
}
