//! Storage gateways.
//!
//! Each gateway is an explicit object passed into the engines — one
//! instance per process, initialized at startup. Traits sit at the seams so
//! tests and alternative backends can swap implementations; the shipped
//! implementations are SQLite with a `Mutex<Connection>` apiece. All
//! gateway errors surface as `TimingError::BackendUnavailable`.

pub mod dead_letter;
pub mod event_log;
pub mod event_store;
pub mod explanation_store;
pub mod feature_cache;
pub mod identity_store;

pub use dead_letter::{DeadLetter, DeadLetterSink, JsonlDeadLetterSink, MemoryDeadLetterSink};
pub use event_log::{LogConsumer, LogMessage, MemoryEventLog};
pub use event_store::{EventStore, SqliteEventStore};
pub use explanation_store::{ExplanationLog, SqliteExplanationLog};
pub use feature_cache::{FeatureCache, SqliteFeatureCache};
pub use identity_store::{IdentityStore, SqliteIdentityStore};

use sf_core::TimingError;

pub(crate) fn db_err(e: rusqlite::Error) -> TimingError {
    TimingError::BackendUnavailable(format!("sqlite: {}", e))
}
