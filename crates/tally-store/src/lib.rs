//! Durable session storage for Tally.
//!
//! Session records are committed in transactional batches and queried by
//! user, optionally restricted to open or closed sessions. SQLite is the
//! default backend; [`MockSessionStore`] backs the tests.

pub mod error;
pub mod record;
pub mod sqlite;
pub mod storage;

pub use error::{Result, StoreError};
pub use record::{SessionRecord, normalize_user_key, same_user};
pub use sqlite::SqliteSessionStore;
pub use storage::{MockSessionStore, RecordState, SessionFilter, SessionOrder, SessionStore};
