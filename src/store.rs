//! The subscription store: protocol callbacks, version reads, supersession,
//! and notification fulfillment.

use crate::db::{Database, ReadTransaction, Tables, WriteTransaction};
use crate::error::{Result, StoreError};
use crate::notifications::{Notifier, PendingNotifications, StateChangeHandle, StateResult};
use crate::sets::{MutableSubscriptionSet, SubscriptionSet};
use crate::types::{PendingVersion, State, VersionInfo, EMPTY_VERSION};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Process-wide registry of subscription set versions, bound to one
/// database.
///
/// Shared (via `Arc`) between application threads and the sync client; the
/// sets it hands out keep only a weak back-reference, so dropping every
/// `Arc` shuts the store down and resolves outstanding notifiers with a
/// cancelled status.
///
/// Mutation is serialized by the database's write-transaction discipline.
/// The protocol callbacks that must land atomically with a data write
/// (`begin_bootstrap`, `complete_bootstrap`, `cancel_bootstrap`,
/// `mark_active_as_complete`, `set_active_as_latest`, `reset`) take the
/// caller's open write transaction; the caller commits and then calls
/// [`report_progress`](Self::report_progress) so notifiers only observe
/// committed states.
pub struct SubscriptionStore {
    db: Arc<Database>,

    pending_notifications: PendingNotifications,

    /// Bootstrap attempts per version, for `cancel_bootstrap`'s
    /// first-attempt check. Process-local; the table schema carries no
    /// attempt column.
    bootstrap_attempts: Mutex<HashMap<i64, u32>>,
}

impl SubscriptionStore {
    pub fn new(db: Arc<Database>) -> Arc<Self> {
        Arc::new(Self {
            db,
            pending_notifications: PendingNotifications::default(),
            bootstrap_attempts: Mutex::new(HashMap::new()),
        })
    }

    /// The database this store is bound to.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    // --- Reads ---

    /// Snapshot of the highest-versioned set, or the synthetic empty set at
    /// version 0 if none has ever been committed.
    pub fn get_latest(self: &Arc<Self>) -> Result<SubscriptionSet> {
        let rt = self.db.begin_read();
        match rt.tables().latest_set() {
            Some(row) => {
                SubscriptionSet::from_row(Arc::downgrade(self), rt.tables(), row, rt.version())
            }
            None => Ok(SubscriptionSet::empty(Arc::downgrade(self), rt.version())),
        }
    }

    /// Snapshot of the highest version in the `Complete` state, or the
    /// synthetic empty set at version 0 if none has finished bootstrapping.
    pub fn get_active(self: &Arc<Self>) -> Result<SubscriptionSet> {
        let rt = self.db.begin_read();
        match rt.tables().active_set() {
            Some(row) => {
                SubscriptionSet::from_row(Arc::downgrade(self), rt.tables(), row, rt.version())
            }
            None => Ok(SubscriptionSet::empty(Arc::downgrade(self), rt.version())),
        }
    }

    /// Snapshot of exactly `version`. Versions below the smallest retained
    /// one have been trimmed and come back as `Superseded` placeholders;
    /// versions that never existed fail with `KeyNotFound`.
    pub fn get_by_version(self: &Arc<Self>, version: i64) -> Result<SubscriptionSet> {
        let rt = self.db.begin_read();
        let tables = rt.tables();
        if let Some(row) = tables.subscription_sets.get(&version) {
            return SubscriptionSet::from_row(Arc::downgrade(self), tables, row, rt.version());
        }
        if tables
            .smallest_retained_version()
            .is_some_and(|min| version < min)
        {
            return Ok(SubscriptionSet::superseded(
                Arc::downgrade(self),
                version,
                rt.version(),
            ));
        }
        Err(StoreError::KeyNotFound(version))
    }

    /// Latest, active, and pending-mark versions, read from one snapshot so
    /// the three values are coherent.
    pub fn get_version_info(&self) -> VersionInfo {
        let rt = self.db.begin_read();
        let tables = rt.tables();
        VersionInfo {
            latest: tables.latest_set().map_or(0, |row| row.version),
            active: tables.active_set().map_or(0, |row| row.version),
            pending_mark: tables
                .subscription_sets
                .values()
                .rev()
                .find(|row| row.state == State::AwaitingMark.to_storage())
                .map_or(EMPTY_VERSION, |row| row.version),
        }
    }

    /// Whether the database has commits strictly after `version`.
    pub fn would_refresh(&self, version: i64) -> bool {
        self.db.version() > version
    }

    /// Object-class names referenced by the latest set, used by the sync
    /// client to shape its schema.
    pub fn get_tables_for_latest(&self, tr: &ReadTransaction) -> BTreeSet<String> {
        let mut classes = BTreeSet::new();
        if let Some(row) = tr.tables().latest_set() {
            for key in &row.subscriptions {
                if let Some(sub) = tr.tables().subscriptions.get(key) {
                    classes.insert(sub.object_class_name.clone());
                }
            }
        }
        classes
    }

    /// The lowest version above `last_query_version` still waiting to be
    /// sent to the server (`Pending` or `Bootstrapping`), with the database
    /// version it was committed at.
    pub fn get_next_pending_version(&self, last_query_version: i64) -> Option<PendingVersion> {
        let rt = self.db.begin_read();
        rt.tables()
            .subscription_sets
            .range(last_query_version.saturating_add(1)..)
            .find(|(_, row)| {
                row.state == State::Pending.to_storage()
                    || row.state == State::Bootstrapping.to_storage()
            })
            .map(|(version, row)| PendingVersion {
                query_version: *version,
                snapshot_version: row.snapshot_version,
            })
    }

    /// Snapshots of every version that has not yet completed
    /// (`Pending`, `Bootstrapping`, or `AwaitingMark`), ascending.
    pub fn get_pending_subscriptions(self: &Arc<Self>) -> Result<Vec<SubscriptionSet>> {
        let rt = self.db.begin_read();
        let mut pending = Vec::new();
        for row in rt.tables().subscription_sets.values() {
            if row.state == State::Pending.to_storage()
                || row.state == State::Bootstrapping.to_storage()
                || row.state == State::AwaitingMark.to_storage()
            {
                pending.push(SubscriptionSet::from_row(
                    Arc::downgrade(self),
                    rt.tables(),
                    row,
                    rt.version(),
                )?);
            }
        }
        Ok(pending)
    }

    // --- Sync-client protocol surface ---

    /// Record that the server rejected `version`. Fails on versions that
    /// already completed, were superseded, or errored.
    pub fn set_error(&self, version: i64, error_str: &str) -> Result<()> {
        {
            let mut wt = self.db.begin_write();
            let min = wt.tables().smallest_retained_version();
            match wt.tables_mut().subscription_sets.get_mut(&version) {
                None => return Err(Self::missing_version_error(min, version, State::Error)),
                Some(row) => {
                    let state = State::from_storage(row.state)?;
                    match state {
                        State::Pending | State::Bootstrapping | State::AwaitingMark => {
                            row.state = State::Error.to_storage();
                            row.error_str = error_str.to_string();
                        }
                        from => {
                            return Err(StoreError::IllegalTransition {
                                version,
                                from,
                                to: State::Error,
                            })
                        }
                    }
                }
            }
            wt.commit()?;
        }
        self.report_progress();
        Ok(())
    }

    /// Move `version` from `Pending` to `Bootstrapping`. Called inside the
    /// write transaction that persists the first bootstrap changeset. No-op
    /// if the version is already bootstrapping or beyond; fails on terminal
    /// versions.
    pub fn begin_bootstrap(&self, wt: &mut WriteTransaction, version: i64) -> Result<()> {
        let min = wt.tables().smallest_retained_version();
        let row = match wt.tables_mut().subscription_sets.get_mut(&version) {
            Some(row) => row,
            None => {
                return Err(Self::missing_version_error(
                    min,
                    version,
                    State::Bootstrapping,
                ))
            }
        };

        let state = State::from_storage(row.state)?;
        match state {
            State::Pending => {
                row.state = State::Bootstrapping.to_storage();
                *self.bootstrap_attempts.lock().entry(version).or_insert(0) += 1;
                Ok(())
            }
            State::Bootstrapping | State::AwaitingMark | State::Complete => Ok(()),
            from => Err(StoreError::IllegalTransition {
                version,
                from,
                to: State::Bootstrapping,
            }),
        }
    }

    /// Record that the last bootstrap changeset for `version` has been
    /// persisted. A bootstrapping version advances to `AwaitingMark`; a
    /// still-pending version had no changesets to mark and advances
    /// straight to `Complete`. Earlier versions are superseded in the same
    /// transaction. No-op if already complete; fails on terminal versions.
    pub fn complete_bootstrap(&self, wt: &mut WriteTransaction, version: i64) -> Result<()> {
        let min = wt.tables().smallest_retained_version();
        let tables = wt.tables_mut();
        let state = match tables.subscription_sets.get_mut(&version) {
            Some(row) => State::from_storage(row.state)?,
            None => {
                return Err(Self::missing_version_error(
                    min,
                    version,
                    State::AwaitingMark,
                ))
            }
        };

        match state {
            State::Bootstrapping => {
                if let Some(row) = tables.subscription_sets.get_mut(&version) {
                    row.state = State::AwaitingMark.to_storage();
                }
                Self::supersede_older(tables, version, false);
                Ok(())
            }
            State::Pending => {
                if let Some(row) = tables.subscription_sets.get_mut(&version) {
                    row.state = State::Complete.to_storage();
                }
                Self::supersede_older(tables, version, true);
                Ok(())
            }
            State::AwaitingMark | State::Complete => Ok(()),
            from => Err(StoreError::IllegalTransition {
                version,
                from,
                to: State::AwaitingMark,
            }),
        }
    }

    /// Roll `version` back from `Bootstrapping` to `Pending`, only if this
    /// is the first bootstrap attempt for the set. No-op otherwise.
    pub fn cancel_bootstrap(&self, wt: &mut WriteTransaction, version: i64) -> Result<()> {
        let row = match wt.tables_mut().subscription_sets.get_mut(&version) {
            Some(row) => row,
            None => return Ok(()),
        };

        if State::from_storage(row.state)? == State::Bootstrapping {
            let attempts = self
                .bootstrap_attempts
                .lock()
                .get(&version)
                .copied()
                .unwrap_or(0);
            if attempts <= 1 {
                row.state = State::Pending.to_storage();
            }
        }
        Ok(())
    }

    /// Record that a download has completed: the version awaiting its mark
    /// advances to `Complete`. No-op if nothing is in `AwaitingMark`.
    pub fn download_complete(&self) -> Result<()> {
        {
            let rt = self.db.begin_read();
            let any_awaiting = rt
                .tables()
                .subscription_sets
                .values()
                .any(|row| row.state == State::AwaitingMark.to_storage());
            if !any_awaiting {
                return Ok(());
            }
        }

        {
            let mut wt = self.db.begin_write();
            let tables = wt.tables_mut();
            let version = match tables
                .subscription_sets
                .values()
                .rev()
                .find(|row| row.state == State::AwaitingMark.to_storage())
                .map(|row| row.version)
            {
                Some(version) => version,
                None => return Ok(()),
            };
            if let Some(row) = tables.subscription_sets.get_mut(&version) {
                row.state = State::Complete.to_storage();
            }
            Self::supersede_older(tables, version, true);
            wt.commit()?;
        }
        self.report_progress();
        Ok(())
    }

    /// Force the latest set to `Complete` without going through the
    /// bootstrap flow, superseding everything before it. Client-reset path.
    /// Returns the promoted version, or [`EMPTY_VERSION`] if no set exists.
    pub fn mark_active_as_complete(&self, wt: &mut WriteTransaction) -> i64 {
        let tables = wt.tables_mut();
        let version = match tables.latest_set().map(|row| row.version) {
            Some(version) => version,
            None => return EMPTY_VERSION,
        };
        if let Some(row) = tables.subscription_sets.get_mut(&version) {
            row.state = State::Complete.to_storage();
            row.error_str.clear();
        }
        Self::supersede_older(tables, version, true);
        version
    }

    /// Promote the current `Complete` version to be the head: every
    /// strictly-higher version becomes superseded. No-op if the active
    /// version already is the head, or if nothing is active. Returns the
    /// active version, or [`EMPTY_VERSION`].
    pub fn set_active_as_latest(&self, wt: &mut WriteTransaction) -> i64 {
        let tables = wt.tables_mut();
        let active = match tables.active_set().map(|row| row.version) {
            Some(version) => version,
            None => return EMPTY_VERSION,
        };
        let higher: Vec<i64> = tables
            .subscription_sets
            .range(active.saturating_add(1)..)
            .map(|(version, _)| *version)
            .collect();
        for version in higher {
            tables.remove_set(version);
        }
        active
    }

    /// Empty both tables and resolve every pending notifier with
    /// `Superseded`.
    pub fn reset(&self, wt: &mut WriteTransaction) {
        wt.tables_mut().clear();
        self.bootstrap_attempts.lock().clear();
        self.pending_notifications.resolve_all(Ok(State::Superseded));
    }

    // --- Notifications ---

    /// Fulfill every pending notifier whose target version has reached (or
    /// passed through) its requested state, from a fresh snapshot. Called
    /// after committing a transaction that changed states.
    pub fn report_progress(&self) {
        let rt = self.db.begin_read();
        self.pending_notifications
            .fulfill(|version| Self::state_and_error_of(rt.tables(), version));
    }

    /// Resolve every pending notifier with the given status without
    /// touching any row. Broadcast cancel.
    pub fn notify_all_state_change_notifications(&self, status: StoreError) {
        self.pending_notifications.resolve_all(Err(status));
    }

    pub(crate) fn register_notification(
        &self,
        version: i64,
        notify_when: State,
    ) -> StateChangeHandle {
        let (sender, handle) = StateChangeHandle::one_shot();
        self.register_notifier(version, notify_when, Notifier::Channel(sender));
        handle
    }

    pub(crate) fn register_callback(
        &self,
        version: i64,
        notify_when: State,
        callback: Box<dyn FnOnce(StateResult) + Send>,
    ) {
        self.register_notifier(version, notify_when, Notifier::Callback(callback));
    }

    fn register_notifier(&self, version: i64, notify_when: State, notifier: Notifier) {
        self.pending_notifications.register(
            version,
            notify_when,
            || {
                let rt = self.db.begin_read();
                Self::state_and_error_of(rt.tables(), version)
            },
            notifier,
        );
    }

    // --- Internals ---

    pub(crate) fn make_mutable_copy(
        self: &Arc<Self>,
        source: &SubscriptionSet,
    ) -> MutableSubscriptionSet {
        let tr = self.db.begin_write();
        let set = SubscriptionSet {
            store: Arc::downgrade(self),
            db_version: tr.base_version(),
            version: source.version(),
            state: State::Uncommitted,
            error_str: String::new(),
            snapshot_version: EMPTY_VERSION,
            subs: source.subscriptions().to_vec(),
        };
        MutableSubscriptionSet::new(set, tr)
    }

    /// State and error string of `version` in the given snapshot. Versions
    /// no longer present have been trimmed, i.e. superseded.
    fn state_and_error_of(tables: &Tables, version: i64) -> Result<(State, String)> {
        match tables.subscription_sets.get(&version) {
            Some(row) => Ok((State::from_storage(row.state)?, row.error_str.clone())),
            None => Ok((State::Superseded, String::new())),
        }
    }

    /// Trim every strictly-lesser version that has not finished
    /// (`Pending`, `Bootstrapping`, `AwaitingMark`). The previously active
    /// version is trimmed as well when `include_complete` is set, which is
    /// the case exactly when `version` itself reaches `Complete`.
    fn supersede_older(tables: &mut Tables, version: i64, include_complete: bool) {
        let doomed: Vec<i64> = tables
            .subscription_sets
            .range(..version)
            .filter(|(_, row)| {
                row.state == State::Pending.to_storage()
                    || row.state == State::Bootstrapping.to_storage()
                    || row.state == State::AwaitingMark.to_storage()
                    || (include_complete && row.state == State::Complete.to_storage())
            })
            .map(|(v, _)| *v)
            .collect();
        for v in doomed {
            tables.remove_set(v);
        }
    }

    fn missing_version_error(
        smallest_retained: Option<i64>,
        version: i64,
        to: State,
    ) -> StoreError {
        if smallest_retained.is_some_and(|min| version < min) {
            StoreError::IllegalTransition {
                version,
                from: State::Superseded,
                to,
            }
        } else {
            StoreError::KeyNotFound(version)
        }
    }
}

impl Drop for SubscriptionStore {
    fn drop(&mut self) {
        self.pending_notifications.resolve_all(Err(StoreError::Cancelled(
            "subscription store shut down".to_string(),
        )));
    }
}
