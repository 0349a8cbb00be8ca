//! Storage abstraction for session records.
//!
//! The tracker only talks to [`SessionStore`], so backends can be swapped
//! without touching cache logic.
//!
//! # Architecture
//!
//! ```text
//! SessionStore (trait)          - transactional batch save + filtered lookups
//!     └── SqliteSessionStore    - Default SQLite implementation
//!     └── MockSessionStore      - In-memory mock for testing
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::record::SessionRecord;

/// Which records a query should match by end-time state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    #[default]
    Any,
    /// `ended_at` is not set.
    Open,
    /// Both `started_at` and `ended_at` are set.
    Closed,
}

/// Filter for store lookups.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Case-insensitive user key; `None` matches every user.
    pub user_key: Option<String>,
    pub state: RecordState,
}

impl SessionFilter {
    pub fn user(user_key: impl Into<String>) -> Self {
        Self {
            user_key: Some(user_key.into()),
            state: RecordState::Any,
        }
    }

    pub fn open(mut self) -> Self {
        self.state = RecordState::Open;
        self
    }

    pub fn closed(mut self) -> Self {
        self.state = RecordState::Closed;
        self
    }

    /// Whether an in-memory record satisfies this filter.
    pub fn matches(&self, record: &SessionRecord) -> bool {
        let user_ok = self
            .user_key
            .as_deref()
            .is_none_or(|key| record.belongs_to(key));
        let state_ok = match self.state {
            RecordState::Any => true,
            RecordState::Open => record.ended_at.is_none(),
            RecordState::Closed => record.ended_at.is_some(),
        };
        user_ok && state_ok
    }
}

/// Ordering for [`SessionStore::find_one`]. Ties are broken by id, newest
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrder {
    NewestStart,
    NewestEnd,
}

/// Trait for durable session storage.
pub trait SessionStore: Send + Sync {
    /// Persist a batch of records in one transaction.
    ///
    /// Records that already carry an `id` are updated by id; the rest are
    /// upserted by `session_id`. An `ended_at` already stored is never
    /// cleared. On success every record's `id` is filled in; on failure
    /// nothing is committed and the slice is left untouched.
    fn save_all(&self, records: &mut [SessionRecord]) -> Result<()>;

    /// First record matching `filter` under `order`.
    fn find_one(&self, filter: &SessionFilter, order: SessionOrder)
    -> Result<Option<SessionRecord>>;

    /// Stream every record matching `filter` to `visit`, one row at a time.
    /// Returns the number of records visited.
    fn find_all(
        &self,
        filter: &SessionFilter,
        visit: &mut dyn FnMut(SessionRecord),
    ) -> Result<usize>;
}

/// In-memory implementation of [`SessionStore`] for testing.
///
/// Mirrors the SQLite semantics (upsert by session id, all-or-nothing
/// batches) and can be switched into a failing mode to exercise error paths.
#[derive(Debug, Default)]
pub struct MockSessionStore {
    inner: Mutex<MockInner>,
}

#[derive(Debug, Default)]
struct MockInner {
    rows: Vec<SessionRecord>,
    next_id: i64,
    fail_saves: bool,
    fail_reads: bool,
    save_calls: usize,
}

impl MockSessionStore {
    /// Create a new empty mock storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `save_all` fail with [`StoreError::Unavailable`].
    pub fn set_fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }

    /// Make every following lookup fail with [`StoreError::Unavailable`].
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Number of `save_all` calls received, including failed ones.
    pub fn save_calls(&self) -> usize {
        self.inner.lock().save_calls
    }

    /// Snapshot of all stored rows in insertion order.
    pub fn rows(&self) -> Vec<SessionRecord> {
        self.inner.lock().rows.clone()
    }
}

impl SessionStore for MockSessionStore {
    fn save_all(&self, records: &mut [SessionRecord]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.save_calls += 1;
        if inner.fail_saves {
            return Err(StoreError::Unavailable("saves disabled".to_string()));
        }

        // Validate the whole batch before touching any row.
        let by_session: HashMap<Uuid, usize> = inner
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| (row.session_id, idx))
            .collect();
        for record in records.iter() {
            record.check()?;
            if let Some(id) = record.id
                && !inner.rows.iter().any(|row| row.id == Some(id))
            {
                return Err(StoreError::Conflict { id });
            }
        }

        let mut assigned = Vec::with_capacity(records.len());
        for record in records.iter() {
            let existing = match record.id {
                Some(id) => inner.rows.iter().position(|row| row.id == Some(id)),
                None => by_session.get(&record.session_id).copied(),
            };
            let id = match existing {
                Some(idx) => {
                    let row = &mut inner.rows[idx];
                    if record.ended_at.is_some() {
                        row.ended_at = record.ended_at;
                    }
                    row.id
                }
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    let mut row = record.clone();
                    row.id = Some(id);
                    inner.rows.push(row);
                    Some(id)
                }
            };
            assigned.push(id);
        }

        for (record, id) in records.iter_mut().zip(assigned) {
            record.id = id;
        }
        Ok(())
    }

    fn find_one(
        &self,
        filter: &SessionFilter,
        order: SessionOrder,
    ) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock();
        if inner.fail_reads {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        let candidates = inner.rows.iter().filter(|row| filter.matches(row));
        let found = match order {
            SessionOrder::NewestStart => candidates.max_by_key(|row| (row.started_at, row.id)),
            SessionOrder::NewestEnd => candidates.max_by_key(|row| (row.ended_at, row.id)),
        };
        Ok(found.cloned())
    }

    fn find_all(
        &self,
        filter: &SessionFilter,
        visit: &mut dyn FnMut(SessionRecord),
    ) -> Result<usize> {
        let matching: Vec<SessionRecord> = {
            let inner = self.inner.lock();
            if inner.fail_reads {
                return Err(StoreError::Unavailable("reads disabled".to_string()));
            }
            inner
                .rows
                .iter()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect()
        };
        let count = matching.len();
        matching.into_iter().for_each(|row| visit(row));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[test]
    fn test_filter_matches_state_and_user() {
        let now = Utc::now();
        let open = SessionRecord::open("Alice", now);
        let mut closed = SessionRecord::open("alice", now);
        closed.close(now + Duration::minutes(1));

        let any = SessionFilter::user("ALICE");
        assert!(any.matches(&open));
        assert!(any.matches(&closed));
        assert!(SessionFilter::user("alice").open().matches(&open));
        assert!(!SessionFilter::user("alice").open().matches(&closed));
        assert!(SessionFilter::user("alice").closed().matches(&closed));
        assert!(!SessionFilter::user("bob").matches(&open));
        assert!(SessionFilter::default().matches(&open));
    }

    #[test]
    fn test_mock_upsert_keeps_one_row_per_session() {
        let store = MockSessionStore::new();
        let now = Utc::now();
        let mut record = SessionRecord::open("alice", now);

        let mut batch = vec![record.clone()];
        store.save_all(&mut batch).unwrap();
        assert_eq!(batch[0].id, Some(1));

        record.close(now + Duration::hours(1));
        store.save_all(std::slice::from_mut(&mut record)).unwrap();

        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].duration(), Some(Duration::hours(1)));
        assert_eq!(record.id, Some(1));
    }

    #[test]
    fn test_mock_never_clears_end_time() {
        let store = MockSessionStore::new();
        let now = Utc::now();
        let open = SessionRecord::open("alice", now);
        let mut closed = open.clone();
        closed.close(now + Duration::minutes(10));

        store.save_all(&mut [closed]).unwrap();
        store.save_all(&mut [open]).unwrap();

        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].ended_at.is_some());
    }

    #[test]
    fn test_mock_conflict_rolls_back_batch() {
        let store = MockSessionStore::new();
        let now = Utc::now();
        let fresh = SessionRecord::open("alice", now);
        let mut stale = SessionRecord::open("bob", now);
        stale.id = Some(42);

        let mut batch = vec![fresh, stale];
        let err = store.save_all(&mut batch).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { id: 42 }));
        assert!(store.rows().is_empty());
        assert!(batch[0].id.is_none());
    }

    #[test]
    fn test_mock_failing_saves() {
        let store = MockSessionStore::new();
        store.set_fail_saves(true);
        let mut batch = vec![SessionRecord::open("alice", Utc::now())];
        assert!(matches!(
            store.save_all(&mut batch),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.save_calls(), 1);
        assert!(store.rows().is_empty());
    }

    #[test]
    fn test_mock_find_one_orders() {
        let store = MockSessionStore::new();
        let now = Utc::now();
        let mut early = SessionRecord::open("alice", now - Duration::hours(3));
        early.close(now - Duration::hours(1));
        let mut late = SessionRecord::open("alice", now - Duration::hours(2));
        late.close(now - Duration::hours(2) + Duration::minutes(5));
        store.save_all(&mut [early.clone(), late.clone()]).unwrap();

        let newest_start = store
            .find_one(&SessionFilter::user("alice"), SessionOrder::NewestStart)
            .unwrap()
            .unwrap();
        assert_eq!(newest_start.session_id, late.session_id);

        let newest_end = store
            .find_one(&SessionFilter::user("alice").closed(), SessionOrder::NewestEnd)
            .unwrap()
            .unwrap();
        assert_eq!(newest_end.session_id, early.session_id);
    }
}
