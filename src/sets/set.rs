//! Read-only subscription set snapshots.

use crate::db::{SubscriptionSetRow, Tables};
use crate::error::{Result, StoreError};
use crate::notifications::StateChangeHandle;
use crate::sets::MutableSubscriptionSet;
use crate::store::SubscriptionStore;
use crate::types::{Query, State, Subscription};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;
use std::sync::{Arc, Weak};

/// An immutable snapshot of one subscription set version.
///
/// Holds value copies of its subscriptions plus a weak back-reference to
/// the store for re-reads; if the store is gone, [`refresh`](Self::refresh)
/// and [`make_mutable_copy`](Self::make_mutable_copy) fail with
/// [`StoreError::StoreGone`].
#[derive(Clone)]
pub struct SubscriptionSet {
    pub(crate) store: Weak<SubscriptionStore>,

    /// Database version this snapshot was read at.
    pub(crate) db_version: i64,

    pub(crate) version: i64,
    pub(crate) state: State,
    pub(crate) error_str: String,
    pub(crate) snapshot_version: i64,
    pub(crate) subs: Vec<Subscription>,
}

impl SubscriptionSet {
    pub(crate) fn from_row(
        store: Weak<SubscriptionStore>,
        tables: &Tables,
        row: &SubscriptionSetRow,
        db_version: i64,
    ) -> Result<Self> {
        let state = State::from_storage(row.state)?;
        let mut subs = Vec::with_capacity(row.subscriptions.len());
        for key in &row.subscriptions {
            let sub = tables.subscriptions.get(key).ok_or_else(|| {
                StoreError::Corruption(format!("dangling subscription row key {:?}", key))
            })?;
            subs.push(Subscription {
                id: sub.id,
                created_at: sub.created_at,
                updated_at: sub.updated_at,
                name: sub.name.clone(),
                object_class_name: sub.object_class_name.clone(),
                query_string: sub.query_str.clone(),
            });
        }
        Ok(Self {
            store,
            db_version,
            version: row.version,
            state,
            error_str: row.error_str.clone(),
            snapshot_version: row.snapshot_version,
            subs,
        })
    }

    /// The synthetic empty set returned when no version qualifies. It is
    /// clone-to-mutate friendly: committing a mutable copy of it produces
    /// version 1.
    pub(crate) fn empty(store: Weak<SubscriptionStore>, db_version: i64) -> Self {
        Self {
            store,
            db_version,
            version: 0,
            state: State::Pending,
            error_str: String::new(),
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    /// Placeholder for a version that has been trimmed from local storage.
    pub(crate) fn superseded(store: Weak<SubscriptionStore>, version: i64, db_version: i64) -> Self {
        Self {
            store,
            db_version,
            version,
            state: State::Superseded,
            error_str: String::new(),
            snapshot_version: 0,
            subs: Vec::new(),
        }
    }

    /// The query version identifying this set in the sync wire protocol.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The database version this set was committed at, or
    /// [`EMPTY_VERSION`](crate::types::EMPTY_VERSION) while uncommitted.
    pub fn snapshot_version(&self) -> i64 {
        self.snapshot_version
    }

    /// The server's error message, present only in the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        if self.error_str.is_empty() {
            None
        } else {
            Some(&self.error_str)
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.subs.iter()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subs
    }

    pub fn get(&self, index: usize) -> Option<&Subscription> {
        self.subs.get(index)
    }

    /// Find a subscription by name. Linear scan; sets are small.
    pub fn find(&self, name: &str) -> Option<&Subscription> {
        self.subs
            .iter()
            .find(|sub| sub.name.as_deref() == Some(name))
    }

    /// Find a subscription by structural query equality: same object class
    /// and same stringified query.
    pub fn find_query(&self, query: &Query) -> Option<&Subscription> {
        self.subs.iter().find(|sub| {
            sub.object_class_name == query.object_class_name()
                && sub.query_string == query.query_string()
        })
    }

    /// Serialize as the extended-JSON document sent to the server:
    /// `{"<class>": {"<name-or-id>": "<query>"}}` with classes and keys in
    /// sorted order, so re-serialization is byte-identical.
    pub fn to_ext_json(&self) -> String {
        let mut classes: BTreeMap<&str, BTreeMap<String, &str>> = BTreeMap::new();
        for sub in &self.subs {
            let key = match &sub.name {
                Some(name) => name.clone(),
                None => sub.id.to_hex(),
            };
            classes
                .entry(sub.object_class_name.as_str())
                .or_default()
                .insert(key, sub.query_string.as_str());
        }
        serde_json::to_string(&classes).expect("string-keyed maps serialize infallibly")
    }

    /// Re-read this set's state from the database. Invalidates anything
    /// borrowed from `self`.
    pub fn refresh(&mut self) -> Result<()> {
        let store = self.upgrade_store()?;
        if store.db().version() == self.db_version {
            return Ok(());
        }
        *self = store.get_by_version(self.version)?;
        Ok(())
    }

    /// Copy this set into a mutable edit bound to a fresh write
    /// transaction. The copy starts `Uncommitted`; its version is assigned
    /// when it commits.
    pub fn make_mutable_copy(&self) -> Result<MutableSubscriptionSet> {
        let store = self.upgrade_store()?;
        Ok(store.make_mutable_copy(self))
    }

    /// Returns a handle that resolves with the first state at or beyond
    /// `notify_when`, earlier if the set reaches a terminal state first, or
    /// with an error if it enters `Error`. Already-satisfied requests
    /// resolve immediately, as do requests on an uncommitted copy
    /// (with [`StoreError::NotMutable`]) or after the store is gone.
    pub fn get_state_change_notification(&self, notify_when: State) -> StateChangeHandle {
        if self.state == State::Uncommitted {
            return StateChangeHandle::resolved(Err(StoreError::NotMutable));
        }
        match self.store.upgrade() {
            Some(store) => store.register_notification(self.version, notify_when),
            None => StateChangeHandle::resolved(Err(StoreError::StoreGone)),
        }
    }

    /// Callback flavor of
    /// [`get_state_change_notification`](Self::get_state_change_notification).
    /// The callback runs exactly once, on whichever thread performs the
    /// resolving transition.
    pub fn on_state_change<F>(&self, notify_when: State, callback: F)
    where
        F: FnOnce(Result<State>) + Send + 'static,
    {
        if self.state == State::Uncommitted {
            callback(Err(StoreError::NotMutable));
            return;
        }
        match self.store.upgrade() {
            Some(store) => store.register_callback(self.version, notify_when, Box::new(callback)),
            None => callback(Err(StoreError::StoreGone)),
        }
    }

    pub(crate) fn upgrade_store(&self) -> Result<Arc<SubscriptionStore>> {
        self.store.upgrade().ok_or(StoreError::StoreGone)
    }
}

impl Index<usize> for SubscriptionSet {
    type Output = Subscription;

    fn index(&self, index: usize) -> &Subscription {
        &self.subs[index]
    }
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("version", &self.version)
            .field("state", &self.state)
            .field("snapshot_version", &self.snapshot_version)
            .field("subs", &self.subs)
            .finish()
    }
}
