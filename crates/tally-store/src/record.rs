//! The session record entity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// One user's start/end interval.
///
/// `id` is assigned by the store on first commit. `session_id` is generated
/// when the record is created and lets the store recognise a record it has
/// already seen, so saving the same record twice never yields two rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Option<i64>,
    pub session_id: Uuid,
    pub user_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Open a new session for `user_key` starting at `started_at`.
    pub fn open(user_key: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            session_id: Uuid::new_v4(),
            user_key: user_key.into(),
            started_at,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Stamp the end time. An end earlier than the start is clamped to the
    /// start so the interval never goes negative.
    pub fn close(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at.max(self.started_at));
    }

    /// Length of a closed session; `None` while the session is open.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Time elapsed since the session started, as seen at `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    /// Reject records no store should persist: a blank user key or an end
    /// before the start.
    pub fn check(&self) -> Result<()> {
        if normalize_user_key(&self.user_key).is_empty() {
            return Err(StoreError::InvalidData(format!(
                "session {} has an empty user key",
                self.session_id
            )));
        }
        if let Some(ended_at) = self.ended_at
            && ended_at < self.started_at
        {
            return Err(StoreError::InvalidData(format!(
                "session {} ends before it starts",
                self.session_id
            )));
        }
        Ok(())
    }

    /// Case-insensitive match against a user key.
    pub fn belongs_to(&self, user_key: &str) -> bool {
        same_user(&self.user_key, user_key)
    }
}

/// Canonical form of a user key for map lookups.
pub fn normalize_user_key(user_key: &str) -> String {
    user_key.trim().to_lowercase()
}

/// Compare two user keys ignoring case.
pub fn same_user(a: &str, b: &str) -> bool {
    normalize_user_key(a) == normalize_user_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_record_has_no_duration() {
        let record = SessionRecord::open("Alice", Utc::now());
        assert!(record.is_open());
        assert!(record.id.is_none());
        assert_eq!(record.duration(), None);
    }

    #[test]
    fn test_close_sets_duration() {
        let start = Utc::now();
        let mut record = SessionRecord::open("alice", start);
        record.close(start + Duration::minutes(90));
        assert_eq!(record.duration(), Some(Duration::minutes(90)));
    }

    #[test]
    fn test_close_before_start_is_clamped() {
        let start = Utc::now();
        let mut record = SessionRecord::open("alice", start);
        record.close(start - Duration::seconds(5));
        assert_eq!(record.ended_at, Some(start));
        assert_eq!(record.duration(), Some(Duration::zero()));
    }

    #[test]
    fn test_user_keys_compare_case_insensitively() {
        let record = SessionRecord::open("Alice", Utc::now());
        assert!(record.belongs_to("ALICE"));
        assert!(record.belongs_to("alice"));
        assert!(!record.belongs_to("bob"));
        assert_eq!(normalize_user_key(" MiXeD "), "mixed");
    }

    #[test]
    fn test_session_ids_are_unique() {
        let now = Utc::now();
        let a = SessionRecord::open("alice", now);
        let b = SessionRecord::open("alice", now);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_check_rejects_bad_records() {
        let now = Utc::now();
        assert!(SessionRecord::open("alice", now).check().is_ok());

        let blank = SessionRecord::open("  ", now);
        assert!(matches!(blank.check(), Err(StoreError::InvalidData(_))));

        let mut backwards = SessionRecord::open("alice", now);
        backwards.ended_at = Some(now - Duration::minutes(1));
        assert!(matches!(backwards.check(), Err(StoreError::InvalidData(_))));
    }
}
