//! Persistence store port and its backends.
//!
//! The arbitration core only needs two things from a store: an atomic
//! conditional update ("update iff the current value matches a filter"),
//! which is the compare-and-set primitive the Ledger and request lattice are
//! built on, and simple filtered reads in key order.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlCollection;
pub use memory::InMemoryCollection;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::SchedulerError;

/// Key types usable in a [`Collection`].
pub trait StoreKey:
    Ord + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreKey for T where
    T: Ord + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Record types usable in a [`Collection`].
pub trait StoreRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreRecord for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Outcome of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<V> {
    /// Filter matched; carries the stored value after the update.
    Applied(V),
    /// Filter did not match; carries the current value, unchanged.
    Rejected(V),
    /// No record under that key.
    Missing,
}

impl<V> Conditional<V> {
    /// True if the update was written.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// A keyed collection of records with compare-and-set updates.
pub trait Collection<K: StoreKey, V: StoreRecord>: Send + Sync {
    /// Collection name, used in logs and file names.
    fn name(&self) -> &str;

    /// Insert a new record. Fails if the key already exists.
    fn insert(&self, key: K, value: V) -> Result<(), SchedulerError>;

    /// Insert or replace a record unconditionally.
    fn put(&self, key: K, value: V) -> Result<(), SchedulerError>;

    /// Read one record.
    fn get(&self, key: &K) -> Result<Option<V>, SchedulerError>;

    /// All records matching `filter`, in key order.
    fn find(&self, filter: &dyn Fn(&V) -> bool) -> Result<Vec<V>, SchedulerError>;

    /// Atomically apply `update` iff the current record matches `filter`.
    fn update_if(
        &self,
        key: &K,
        filter: &dyn Fn(&V) -> bool,
        update: &mut dyn FnMut(&mut V),
    ) -> Result<Conditional<V>, SchedulerError>;

    /// Number of records.
    fn len(&self) -> Result<usize, SchedulerError> {
        Ok(self.find(&|_| true)?.len())
    }

    /// True if the collection holds no records.
    fn is_empty(&self) -> Result<bool, SchedulerError> {
        Ok(self.len()? == 0)
    }
}
