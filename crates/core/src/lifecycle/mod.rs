//! Lifecycle store: per-request state, facet merge and transition rules.

mod authority;
mod sqlite_store;
mod state;
mod store;

pub use authority::LifecycleStore;
pub use sqlite_store::SqliteRecordStore;
pub use state::*;
pub use store::*;
