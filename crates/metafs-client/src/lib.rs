//! MetaFS Client - object-store access for metadata services
//!
//! This crate defines the submission interface the metadata server uses to
//! talk to the object store: compound read/write operations ([`ops`]), the
//! [`ObjectStore`] trait they are submitted through, and the [`Finisher`]
//! that delivers completions serially. [`MemStore`] is a process-local
//! backend used by tests and standalone runs.
//!
//! Submission is continuation-passing: the caller hands over a completion
//! and returns immediately; the completion runs later on the finisher
//! thread, never on the submitting thread.

pub mod finisher;
pub mod mem;
pub mod ops;

pub use finisher::Finisher;
pub use mem::MemStore;
pub use ops::{ReadOp, ReadOutcome, WriteOp};

use metafs_common::Result;
use std::fmt;
use std::time::SystemTime;

/// Name of one object in the store
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an object id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The object name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:?})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool an object is located in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub i64);

/// Snapshot context attached to a mutation
///
/// Metadata objects are written with an empty context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapContext {
    /// Most recent snapshot sequence
    pub seq: u64,
    /// Existing snapshot ids, newest first
    pub snaps: Vec<u64>,
}

/// Completion for a compound read
pub type ReadCompletion = Box<dyn FnOnce(Result<ReadOutcome>) + Send + 'static>;

/// Completion for a compound mutation
pub type MutateCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Asynchronous submission interface to the object store
///
/// Both calls return immediately; the completion is dispatched through the
/// store's finisher once the operation is durable (mutations) or the data
/// is available (reads). A compound mutation is applied atomically.
pub trait ObjectStore: Send + Sync {
    /// Submit a compound read
    fn read(&self, oid: &ObjectId, pool: PoolId, op: ReadOp, on_finish: ReadCompletion);

    /// Submit a compound mutation
    fn mutate(
        &self,
        oid: &ObjectId,
        pool: PoolId,
        op: WriteOp,
        snapc: SnapContext,
        mtime: SystemTime,
        on_finish: MutateCompletion,
    );
}
