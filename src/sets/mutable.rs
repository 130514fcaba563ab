//! In-progress subscription set edits.

use crate::db::{SubscriptionRow, SubscriptionSetRow, WriteTransaction};
use crate::error::{Result, StoreError};
use crate::sets::SubscriptionSet;
use crate::types::{Query, State, Subscription, SubscriptionId, Timestamp};
use std::ops::Deref;

/// A subscription set open for editing, bound to one write transaction.
///
/// Created by [`SubscriptionSet::make_mutable_copy`]. Dereferences to its
/// read-only view for inspection. All mutators require the `Uncommitted`
/// state; [`commit`](Self::commit) consumes the set together with its
/// transaction. While this value is alive it holds the database's write
/// slot, so no other write transaction can begin.
pub struct MutableSubscriptionSet {
    set: SubscriptionSet,
    tr: WriteTransaction,
}

impl MutableSubscriptionSet {
    pub(crate) fn new(set: SubscriptionSet, tr: WriteTransaction) -> Self {
        Self { set, tr }
    }

    fn check_is_mutable(&self) -> Result<()> {
        if self.set.state == State::Uncommitted {
            Ok(())
        } else {
            Err(StoreError::NotMutable)
        }
    }

    /// Insert a subscription named `name`, or re-bind the existing one to
    /// the new query. Returns the subscription and whether it was newly
    /// created. Re-binding bumps `updated_at` and leaves `created_at` and
    /// the id untouched.
    pub fn insert_or_assign(
        &mut self,
        name: impl Into<String>,
        query: &Query,
    ) -> Result<(&Subscription, bool)> {
        self.check_is_mutable()?;
        let name = name.into();
        let existing = self
            .set
            .subs
            .iter()
            .position(|sub| sub.name.as_deref() == Some(name.as_str()));
        Ok(self.upsert(existing, Some(name), query))
    }

    /// Insert an unnamed subscription, or bump `updated_at` on the existing
    /// one with the same object class and query string.
    pub fn insert_or_assign_query(&mut self, query: &Query) -> Result<(&Subscription, bool)> {
        self.check_is_mutable()?;
        let existing = self.set.subs.iter().position(|sub| {
            sub.name.is_none()
                && sub.object_class_name == query.object_class_name()
                && sub.query_string == query.query_string()
        });
        Ok(self.upsert(existing, None, query))
    }

    fn upsert(
        &mut self,
        existing: Option<usize>,
        name: Option<String>,
        query: &Query,
    ) -> (&Subscription, bool) {
        let now = Timestamp::now();
        match existing {
            Some(index) => {
                let sub = &mut self.set.subs[index];
                sub.object_class_name = query.object_class_name().to_string();
                sub.query_string = query.query_string().to_string();
                sub.updated_at = now;
                (&self.set.subs[index], false)
            }
            None => {
                self.set.subs.push(Subscription {
                    id: SubscriptionId::generate(),
                    created_at: now,
                    updated_at: now,
                    name,
                    object_class_name: query.object_class_name().to_string(),
                    query_string: query.query_string().to_string(),
                });
                (self.set.subs.last().expect("just pushed"), true)
            }
        }
    }

    /// Remove the subscription with the given name. Returns whether
    /// anything was removed.
    pub fn erase(&mut self, name: &str) -> Result<bool> {
        self.check_is_mutable()?;
        match self
            .set
            .subs
            .iter()
            .position(|sub| sub.name.as_deref() == Some(name))
        {
            Some(index) => {
                self.set.subs.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the first subscription matching the query (same object class
    /// and query string, named or not).
    pub fn erase_query(&mut self, query: &Query) -> Result<bool> {
        self.check_is_mutable()?;
        match self.set.subs.iter().position(|sub| {
            sub.object_class_name == query.object_class_name()
                && sub.query_string == query.query_string()
        }) {
            Some(index) => {
                self.set.subs.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the subscription at `index`.
    ///
    /// Panics if `index` is out of bounds.
    pub fn erase_at(&mut self, index: usize) -> Result<()> {
        self.check_is_mutable()?;
        self.set.subs.remove(index);
        Ok(())
    }

    /// Remove every subscription over the given object class. Returns
    /// whether anything was removed.
    pub fn erase_by_class_name(&mut self, object_class_name: &str) -> Result<bool> {
        self.check_is_mutable()?;
        let before = self.set.subs.len();
        self.set
            .subs
            .retain(|sub| sub.object_class_name != object_class_name);
        Ok(self.set.subs.len() != before)
    }

    /// Remove every subscription with the given id. Returns whether
    /// anything was removed.
    pub fn erase_by_id(&mut self, id: SubscriptionId) -> Result<bool> {
        self.check_is_mutable()?;
        let before = self.set.subs.len();
        self.set.subs.retain(|sub| sub.id != id);
        Ok(self.set.subs.len() != before)
    }

    /// Remove all subscriptions.
    pub fn clear(&mut self) -> Result<()> {
        self.check_is_mutable()?;
        self.set.subs.clear();
        Ok(())
    }

    /// Directly assign the state. For test and internal use; a state other
    /// than `Uncommitted` is persisted as-is by [`commit`](Self::commit).
    pub fn set_state(&mut self, state: State) {
        self.set.state = state;
    }

    /// Persist this set as a new version and commit the write transaction.
    ///
    /// The version is assigned here, inside the transaction, as one past
    /// the highest existing version; the set transitions to `Pending` and
    /// the returned read-only snapshot reflects the committed rows.
    pub fn commit(mut self) -> Result<SubscriptionSet> {
        let persisted_state = match self.set.state {
            State::Uncommitted => State::Pending,
            other => other,
        };

        let version = self.tr.tables().next_version();
        let snapshot_version = self.tr.commit_version();

        let keys = self
            .set
            .subs
            .iter()
            .map(|sub| {
                self.tr.tables_mut().insert_subscription(SubscriptionRow {
                    id: sub.id,
                    created_at: sub.created_at,
                    updated_at: sub.updated_at,
                    name: sub.name.clone(),
                    object_class_name: sub.object_class_name.clone(),
                    query_str: sub.query_string.clone(),
                })
            })
            .collect();

        self.tr.tables_mut().subscription_sets.insert(
            version,
            SubscriptionSetRow {
                version,
                snapshot_version,
                state: persisted_state.to_storage(),
                error_str: self.set.error_str.clone(),
                subscriptions: keys,
            },
        );

        let db_version = self.tr.commit()?;

        let mut set = self.set;
        set.version = version;
        set.state = persisted_state;
        set.snapshot_version = snapshot_version;
        set.db_version = db_version;
        Ok(set)
    }
}

impl Deref for MutableSubscriptionSet {
    type Target = SubscriptionSet;

    fn deref(&self) -> &SubscriptionSet {
        &self.set
    }
}
