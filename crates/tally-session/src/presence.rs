//! Live session presence.
//!
//! The tracker asks a [`Presence`] collaborator whether a user is connected
//! right now. It decouples the tracker from whatever host knows the answer
//! (a connection table, a roster kept by the event adapter, ...).

use std::collections::HashSet;

use parking_lot::Mutex;
use tally_store::normalize_user_key;

/// Answers "is this user online right now?".
pub trait Presence: Send + Sync {
    fn is_online(&self, user_key: &str) -> bool;
}

/// Presence that never reports anyone online; the tracker then relies on
/// its own open sessions only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPresence;

impl Presence for NoPresence {
    fn is_online(&self, _user_key: &str) -> bool {
        false
    }
}

/// Set of users currently connected, maintained from start/end signals.
#[derive(Debug, Default)]
pub struct OnlineRoster {
    users: Mutex<HashSet<String>>,
}

impl OnlineRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_online(&self, user_key: &str) {
        self.users.lock().insert(normalize_user_key(user_key));
    }

    pub fn mark_offline(&self, user_key: &str) {
        self.users.lock().remove(&normalize_user_key(user_key));
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }
}

impl Presence for OnlineRoster {
    fn is_online(&self, user_key: &str) -> bool {
        self.users.lock().contains(&normalize_user_key(user_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_presence_is_always_offline() {
        assert!(!NoPresence.is_online("alice"));
    }

    #[test]
    fn test_roster_tracks_case_insensitively() {
        let roster = OnlineRoster::new();
        roster.mark_online("Alice");
        assert!(roster.is_online("alice"));
        assert_eq!(roster.len(), 1);

        roster.mark_offline("ALICE");
        assert!(!roster.is_online("Alice"));
        assert!(roster.is_empty());
    }
}
