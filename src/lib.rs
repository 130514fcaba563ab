//! # Subscription Store
//!
//! A durable, versioned registry of the queries a client database keeps
//! synchronized with a flexible-sync server.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: Named or unnamed queries over one object class
//! - **Subscription sets**: Versioned snapshots of subscriptions, advancing
//!   through a fixed lifecycle as the server acknowledges them
//! - **Store**: The process-wide registry driving state transitions and
//!   notifications
//!
//! ## Example
//!
//! ```ignore
//! use subscription_store::{Database, DatabaseConfig, Query, State, SubscriptionStore};
//!
//! let db = Database::open(DatabaseConfig {
//!     path: "./my-subscriptions".into(),
//!     ..Default::default()
//! })?;
//! let store = SubscriptionStore::new(db);
//!
//! // Declare what to synchronize.
//! let mut mutable = store.get_latest()?.make_mutable_copy()?;
//! mutable.insert_or_assign("old-dogs", &Query::new("Dog", "age > 10"))?;
//! let set = mutable.commit()?;
//!
//! // Wait until the server has bootstrapped it.
//! let handle = set.get_state_change_notification(State::Complete);
//! let reached = handle.recv()?;
//! ```

pub mod db;
pub mod error;
pub mod notifications;
pub mod sets;
pub mod store;
pub mod types;

// Re-exports
pub use db::{Database, DatabaseConfig, ReadTransaction, Tables, WriteTransaction};
pub use error::{Result, StoreError};
pub use notifications::StateChangeHandle;
pub use sets::{MutableSubscriptionSet, SubscriptionSet};
pub use store::SubscriptionStore;
pub use types::{
    PendingVersion, Query, State, Subscription, SubscriptionId, Timestamp, VersionInfo,
    EMPTY_VERSION,
};
