//! Embedded host database for the subscription metadata tables.
//!
//! Provides the two tables the store runs against, snapshot reads, and
//! serialized write transactions. Readers take value snapshots and never
//! block writers; at most one write transaction is in flight at a time.
//! Every commit bumps the database version by one and rewrites the
//! metadata file atomically.

use crate::error::{Result, StoreError};
use crate::types::{State, SubscriptionId, Timestamp};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for the metadata file.
const DB_MAGIC: &[u8; 4] = b"FLX\0";

/// Legacy format: subscription set rows carry no state column.
const FORMAT_LEGACY: u8 = 1;

/// Current format.
const FORMAT_CURRENT: u8 = 2;

const TABLES_FILE: &str = "flx_metadata.bin";
const LOCK_FILE: &str = "LOCK";

/// Database configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Base directory for the database.
    pub path: PathBuf,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./subscriptions"),
            create_if_missing: true,
        }
    }
}

/// Key of a row in the subscription table, assigned by the database.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RowKey(pub u64);

/// One row of the `flx_subscriptions` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: SubscriptionId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub name: Option<String>,
    pub object_class_name: String,
    pub query_str: String,
}

/// One row of the `flx_subscription_sets` table. `state` holds the integer
/// code of [`State`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionSetRow {
    pub version: i64,
    pub snapshot_version: i64,
    pub state: i64,
    pub error_str: String,
    pub subscriptions: Vec<RowKey>,
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(Serialize))]
struct LegacySubscriptionSetRow {
    version: i64,
    snapshot_version: i64,
    error_str: String,
    subscriptions: Vec<RowKey>,
}

/// The two metadata tables plus the row-key allocator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    next_row_key: u64,
    pub subscriptions: BTreeMap<RowKey, SubscriptionRow>,
    pub subscription_sets: BTreeMap<i64, SubscriptionSetRow>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[cfg_attr(test, derive(Serialize))]
struct LegacyTables {
    next_row_key: u64,
    subscriptions: BTreeMap<RowKey, SubscriptionRow>,
    subscription_sets: BTreeMap<i64, LegacySubscriptionSetRow>,
}

impl Tables {
    /// The highest-versioned set row, if any.
    pub fn latest_set(&self) -> Option<&SubscriptionSetRow> {
        self.subscription_sets.values().next_back()
    }

    /// The highest-versioned row in the `Complete` state, if any.
    pub fn active_set(&self) -> Option<&SubscriptionSetRow> {
        self.subscription_sets
            .values()
            .rev()
            .find(|row| row.state == State::Complete.to_storage())
    }

    /// The smallest version still present; everything below it has been
    /// superseded and trimmed.
    pub fn smallest_retained_version(&self) -> Option<i64> {
        self.subscription_sets.keys().next().copied()
    }

    /// The version the next commit will be assigned.
    pub fn next_version(&self) -> i64 {
        self.latest_set().map_or(1, |row| row.version + 1)
    }

    /// Insert a subscription row and return its key.
    pub fn insert_subscription(&mut self, row: SubscriptionRow) -> RowKey {
        let key = RowKey(self.next_row_key);
        self.next_row_key += 1;
        self.subscriptions.insert(key, row);
        key
    }

    /// Remove a set row together with the subscription rows it links to.
    pub fn remove_set(&mut self, version: i64) {
        if let Some(row) = self.subscription_sets.remove(&version) {
            for key in row.subscriptions {
                self.subscriptions.remove(&key);
            }
        }
    }

    /// Empty both tables. Row keys are not reused.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.subscription_sets.clear();
    }
}

struct Shared {
    tables: Tables,
    version: i64,
}

/// The host database. Shared (via `Arc`) between application threads and
/// the sync client.
pub struct Database {
    config: DatabaseConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    shared: RwLock<Shared>,

    /// Writer exclusion: true while a write transaction is in flight.
    write_busy: Mutex<bool>,
    write_cv: Condvar,
}

impl Database {
    /// Open an existing database or create a new one.
    pub fn open(config: DatabaseConfig) -> Result<Arc<Self>> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let tables_path = config.path.join(TABLES_FILE);
        let (tables, version, migrated) = if tables_path.exists() {
            Self::load_tables(&tables_path)?
        } else {
            (Tables::default(), 0, false)
        };

        let db = Arc::new(Self {
            config,
            _lock_file: lock_file,
            shared: RwLock::new(Shared { tables, version }),
            write_busy: Mutex::new(false),
            write_cv: Condvar::new(),
        });

        // Rewrite a migrated legacy file in the current format right away.
        if migrated {
            let shared = db.shared.read();
            db.persist(&shared.tables, shared.version)?;
        }

        Ok(db)
    }

    /// Take a value snapshot of both tables. Never blocks writers.
    pub fn begin_read(&self) -> ReadTransaction {
        let shared = self.shared.read();
        ReadTransaction {
            tables: shared.tables.clone(),
            version: shared.version,
        }
    }

    /// Begin a write transaction. Blocks until no other write transaction
    /// is in flight.
    pub fn begin_write(self: &Arc<Self>) -> WriteTransaction {
        let mut busy = self.write_busy.lock();
        while *busy {
            self.write_cv.wait(&mut busy);
        }
        *busy = true;
        drop(busy);

        let shared = self.shared.read();
        WriteTransaction {
            db: Arc::clone(self),
            tables: shared.tables.clone(),
            base_version: shared.version,
            finished: false,
        }
    }

    /// The latest committed version.
    pub fn version(&self) -> i64 {
        self.shared.read().version
    }

    /// The database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn release_writer(&self) {
        *self.write_busy.lock() = false;
        self.write_cv.notify_one();
    }

    fn persist(&self, tables: &Tables, version: i64) -> Result<()> {
        let payload = rmp_serde::to_vec(tables)?;
        let checksum = crc32fast::hash(&payload);

        let path = self.config.path.join(TABLES_FILE);
        let tmp_path = self.config.path.join(format!("{}.tmp", TABLES_FILE));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(DB_MAGIC)?;
        file.write_all(&[FORMAT_CURRENT])?;
        file.write_all(&version.to_le_bytes())?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load_tables(path: &Path) -> Result<(Tables, i64, bool)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != DB_MAGIC {
            return Err(StoreError::InvalidFormat("invalid metadata magic".into()));
        }

        let mut format = [0u8; 1];
        file.read_exact(&mut format)?;

        let mut version_bytes = [0u8; 8];
        file.read_exact(&mut version_bytes)?;
        let version = i64::from_le_bytes(version_bytes);

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&payload) {
            return Err(StoreError::Corruption("metadata checksum mismatch".into()));
        }

        match format[0] {
            FORMAT_CURRENT => {
                let tables: Tables = rmp_serde::from_slice(&payload)?;
                Ok((tables, version, false))
            }
            FORMAT_LEGACY => {
                let legacy: LegacyTables = rmp_serde::from_slice(&payload)?;
                Ok((Self::migrate_legacy(legacy), version, true))
            }
            other => Err(StoreError::InvalidFormat(format!(
                "unsupported metadata format: {}",
                other
            ))),
        }
    }

    /// Legacy files predate the state column. The sole extant version is
    /// inferred `Complete`; anything below it falls into the superseded
    /// range and is trimmed.
    fn migrate_legacy(legacy: LegacyTables) -> Tables {
        let mut tables = Tables {
            next_row_key: legacy.next_row_key,
            subscriptions: BTreeMap::new(),
            subscription_sets: BTreeMap::new(),
        };

        let newest = legacy.subscription_sets.keys().next_back().copied();
        if let Some(version) = newest {
            let row = &legacy.subscription_sets[&version];
            for key in &row.subscriptions {
                if let Some(sub) = legacy.subscriptions.get(key) {
                    tables.subscriptions.insert(*key, sub.clone());
                }
            }
            tables.subscription_sets.insert(
                version,
                SubscriptionSetRow {
                    version,
                    snapshot_version: row.snapshot_version,
                    state: State::Complete.to_storage(),
                    error_str: row.error_str.clone(),
                    subscriptions: row.subscriptions.clone(),
                },
            );
        }

        tables
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join(LOCK_FILE);
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

/// A consistent read snapshot of both tables.
pub struct ReadTransaction {
    tables: Tables,
    version: i64,
}

impl ReadTransaction {
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// The database version this snapshot was taken at.
    pub fn version(&self) -> i64 {
        self.version
    }
}

/// An open write transaction over a staged copy of the tables.
///
/// Dropping the transaction without calling [`commit`](Self::commit) rolls
/// back every staged change.
pub struct WriteTransaction {
    db: Arc<Database>,
    tables: Tables,
    base_version: i64,
    finished: bool,
}

impl WriteTransaction {
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }

    /// The version this transaction started from.
    pub fn base_version(&self) -> i64 {
        self.base_version
    }

    /// The version the database will be at once this transaction commits.
    pub fn commit_version(&self) -> i64 {
        self.base_version + 1
    }

    /// Persist the staged tables and publish them to readers. Returns the
    /// new database version.
    pub fn commit(mut self) -> Result<i64> {
        let version = self.base_version + 1;
        self.db.persist(&self.tables, version)?;

        {
            let mut shared = self.db.shared.write();
            shared.tables = std::mem::take(&mut self.tables);
            shared.version = version;
        }

        self.finished = true;
        self.db.release_writer();
        Ok(version)
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.db.release_writer();
        }
    }
}
