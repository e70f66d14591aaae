//! Key/value backend abstraction.
//!
//! The repository talks to its store exclusively through the [`Backend`]
//! trait: point reads, pipelined batch reads, an atomic snapshot of a hash
//! plus a list, atomic multi-operation transactions, and one optimistic
//! compare-and-set primitive. Two implementations are provided:
//!
//! - [`MemoryBackend`] for tests and development
//! - [`RedisBackend`] for production
//!
//! Backend failures are surfaced unchanged; the repository never retries on
//! the caller's behalf except where a compare-and-set loop is specified.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;

use tiller_core::Result;

pub use self::redis::RedisBackend;
pub use memory::MemoryBackend;

/// The runtime type of a key, as reported by the backend.
///
/// Self-healing index repair dispatches on this: a stale id is removed with
/// a set-remove or a sorted-set-remove depending on what the index key
/// actually is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// No value stored under the key.
    Missing,
    /// A plain string value.
    String,
    /// A field-addressed hash.
    Hash,
    /// A list.
    List,
    /// An unordered set.
    Set,
    /// A sorted set.
    SortedSet,
}

/// Where `LInsert` places the new element relative to the pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Insert immediately before the pivot element.
    Before,
    /// Insert immediately after the pivot element.
    After,
}

/// One mutation inside an atomic [`Backend::transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Delete a key of any kind.
    Del {
        /// The key to delete.
        key: String,
    },
    /// Set a plain string value.
    Set {
        /// The key to write.
        key: String,
        /// The value to store.
        value: String,
    },
    /// Write fields into a hash.
    HSet {
        /// The hash key.
        key: String,
        /// Field/value pairs to write.
        fields: Vec<(String, String)>,
    },
    /// Delete fields from a hash.
    HDel {
        /// The hash key.
        key: String,
        /// Field names to delete.
        fields: Vec<String>,
    },
    /// Add a member to a set.
    SAdd {
        /// The set key.
        key: String,
        /// The member to add.
        member: String,
    },
    /// Remove a member from a set.
    SRem {
        /// The set key.
        key: String,
        /// The member to remove.
        member: String,
    },
    /// Add a member to a sorted set.
    ZAdd {
        /// The sorted-set key.
        key: String,
        /// The member's score.
        score: f64,
        /// The member to add.
        member: String,
    },
    /// Remove a member from a sorted set.
    ZRem {
        /// The sorted-set key.
        key: String,
        /// The member to remove.
        member: String,
    },
    /// Append values to the tail of a list.
    RPush {
        /// The list key.
        key: String,
        /// Values to append, in order.
        values: Vec<String>,
    },
    /// Remove all occurrences of a value from a list.
    LRem {
        /// The list key.
        key: String,
        /// The value to remove.
        value: String,
    },
    /// Splice a value into a list relative to a pivot element.
    ///
    /// A no-op when the pivot is not present.
    LInsert {
        /// The list key.
        key: String,
        /// Before or after the pivot.
        position: InsertPosition,
        /// The existing element to splice around.
        pivot: String,
        /// The value to insert.
        value: String,
    },
}

/// Outcome of [`Backend::hset_if_unchanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The field matched the expected value and the write was applied.
    Applied,
    /// The field changed under us; nothing was written.
    Conflict,
}

impl CasOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A key/value store supporting the operations the repository needs.
///
/// ## Atomicity
///
/// [`transaction`](Backend::transaction) applies every operation or none;
/// [`read_hash_and_list`](Backend::read_hash_and_list) observes both keys at
/// one point in time. [`hset_if_unchanged`](Backend::hset_if_unchanged) is
/// the optimistic primitive behind context merges: callers re-read and retry
/// on [`CasOutcome::Conflict`].
///
/// ## Thread Safety
///
/// All methods take `&self` and implementations are `Send + Sync`; a single
/// logical operation never shares its underlying connection with another.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// A short name for log lines, e.g. `memory` or `redis`.
    fn name(&self) -> &str;

    /// Reads a plain string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Cheap existence probe.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reports the runtime type of a key.
    async fn key_kind(&self, key: &str) -> Result<KeyKind>;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Reads the same field from many hashes in one pipelined round trip.
    ///
    /// The result has the same length and order as `keys`.
    async fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>>;

    /// Reads a full hash. Missing keys read as empty.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Reads all members of a set. Missing keys read as empty.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Reads a range of a sorted set, highest score first. Negative `stop`
    /// counts from the end, as in `ZREVRANGE`.
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Reads a range of a list. Negative `stop` counts from the end, as in
    /// `LRANGE`.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Atomically reads a full hash and a full list at one point in time.
    async fn read_hash_and_list(
        &self,
        hash_key: &str,
        list_key: &str,
    ) -> Result<(HashMap<String, String>, Vec<String>)>;

    /// Applies every operation atomically, in order.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Writes `value` into `key.field` only if the field still holds
    /// `expected` (`None` = field absent).
    async fn hset_if_unchanged(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome>;
}
