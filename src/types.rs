//! Core types for the subscription store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version value meaning "no such version".
pub const EMPTY_VERSION: i64 = -1;

/// Unique identifier for a subscription.
///
/// Twelve bytes: four bytes of creation seconds, five bytes of per-process
/// entropy, three bytes of a wrapping process counter. Unique within a
/// process without coordination.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub [u8; 12]);

static PROCESS_ENTROPY: OnceLock<[u8; 5]> = OnceLock::new();
static NEXT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

impl SubscriptionId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let entropy = PROCESS_ENTROPY.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(std::process::id().to_le_bytes());
            hasher.update((now.as_nanos() as u64).to_le_bytes());
            let digest = hasher.finalize();
            [digest[0], digest[1], digest[2], digest[3], digest[4]]
        });
        let counter = NEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&(now.as_secs() as u32).to_be_bytes());
        bytes[4..9].copy_from_slice(entropy);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        SubscriptionId(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| StoreError::Deserialization("expected 12-byte id".into()))?;
        Ok(SubscriptionId(arr))
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.to_hex())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Lifecycle state of a subscription set.
///
/// Storage codes are a contract with on-disk data: new states must be
/// appended, never renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Not yet persisted; only valid for a `MutableSubscriptionSet`.
    Uncommitted,
    /// Persisted locally but not acknowledged by the server.
    Pending,
    /// The server is sending the initial state for this set.
    Bootstrapping,
    /// The active set, fully synchronized with the server.
    Complete,
    /// The server rejected this set; see the error string.
    Error,
    /// Overtaken by a newer set and trimmed from local storage. Terminal.
    Superseded,
    /// Bootstrap data received; awaiting the mark that the client has
    /// caught up to history.
    AwaitingMark,
}

impl State {
    pub(crate) fn to_storage(self) -> i64 {
        match self {
            State::Uncommitted => 0,
            State::Pending => 1,
            State::Bootstrapping => 2,
            State::Complete => 3,
            State::Error => 4,
            State::Superseded => 5,
            State::AwaitingMark => 6,
        }
    }

    pub(crate) fn from_storage(code: i64) -> Result<Self> {
        match code {
            0 => Ok(State::Uncommitted),
            1 => Ok(State::Pending),
            2 => Ok(State::Bootstrapping),
            3 => Ok(State::Complete),
            4 => Ok(State::Error),
            5 => Ok(State::Superseded),
            6 => Ok(State::AwaitingMark),
            other => Err(StoreError::Corruption(format!(
                "unknown subscription set state code: {}",
                other
            ))),
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Error | State::Superseded)
    }

    /// Progress order used by state-change notifications. Distinct from the
    /// storage codes: `AwaitingMark` sits between `Bootstrapping` and
    /// `Complete`, and terminal states rank above everything so they
    /// short-circuit any pending notifier.
    pub(crate) fn notification_order(self) -> u8 {
        match self {
            State::Uncommitted => 0,
            State::Pending => 1,
            State::Bootstrapping => 2,
            State::AwaitingMark => 3,
            State::Complete => 4,
            State::Error => 5,
            State::Superseded => 6,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Uncommitted => "Uncommitted",
            State::Pending => "Pending",
            State::Bootstrapping => "Bootstrapping",
            State::Complete => "Complete",
            State::Error => "Error",
            State::Superseded => "Superseded",
            State::AwaitingMark => "AwaitingMark",
        };
        write!(f, "{}", name)
    }
}

/// An opaque query over one object class: a stringified query payload plus
/// the class it ranges over. The store never parses or evaluates it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    object_class_name: String,
    query_string: String,
}

impl Query {
    pub fn new(object_class_name: impl Into<String>, query_string: impl Into<String>) -> Self {
        Self {
            object_class_name: object_class_name.into(),
            query_string: query_string.into(),
        }
    }

    pub fn object_class_name(&self) -> &str {
        &self.object_class_name
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }
}

/// A single query that may be OR'd with other queries on the same object
/// class when sent to the server. Immutable once its set is committed.
#[derive(Clone, Debug)]
pub struct Subscription {
    /// Unique id, assigned at insertion.
    pub id: SubscriptionId,

    /// When this subscription was originally created.
    pub created_at: Timestamp,

    /// Last time an insert-or-assign re-bound this subscription to a new
    /// query.
    pub updated_at: Timestamp,

    /// Dedup key within a set, or `None` for unnamed subscriptions.
    pub name: Option<String>,

    /// The object class the query ranges over.
    pub object_class_name: String,

    /// Opaque serialized query payload.
    pub query_string: String,
}

/// Two subscriptions are equal when they have the same id.
impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscription {}

/// Latest, active, and pending-mark versions read from one consistent
/// snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub latest: i64,
    pub active: i64,
    /// Version currently in `AwaitingMark`, or [`EMPTY_VERSION`].
    pub pending_mark: i64,
}

/// A version the sync client still has to send to the server, paired with
/// the database version it was committed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingVersion {
    pub query_version: i64,
    pub snapshot_version: i64,
}
