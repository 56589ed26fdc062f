//! Compound object operations
//!
//! An operation bundles several sub-operations against one object. The
//! store applies a write operation atomically: either every sub-operation
//! takes effect or none does. Reads return one result slot per requested
//! sub-operation, so a caller can distinguish "the header read failed"
//! from "the whole operation failed".

use bytes::Bytes;
use metafs_common::Result;
use std::collections::{BTreeMap, BTreeSet};

/// One read sub-operation
#[derive(Clone, Debug)]
pub enum ReadAction {
    /// Fetch the object's OMAP header blob
    OmapGetHeader,
    /// Fetch up to `max` OMAP entries with keys strictly greater than
    /// `start`, in key order, restricted to keys beginning with `prefix`
    OmapGetVals {
        start: String,
        prefix: String,
        max: usize,
    },
    /// Fetch the object's full byte payload
    ReadFull,
}

/// Compound read operation against one object
#[derive(Clone, Debug, Default)]
pub struct ReadOp {
    actions: Vec<ReadAction>,
}

impl ReadOp {
    /// Create an empty read operation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an OMAP header read
    #[must_use]
    pub fn omap_get_header(mut self) -> Self {
        self.actions.push(ReadAction::OmapGetHeader);
        self
    }

    /// Add a batched OMAP key-range read
    #[must_use]
    pub fn omap_get_vals(
        mut self,
        start: impl Into<String>,
        prefix: impl Into<String>,
        max: usize,
    ) -> Self {
        self.actions.push(ReadAction::OmapGetVals {
            start: start.into(),
            prefix: prefix.into(),
            max,
        });
        self
    }

    /// Add a full byte-payload read
    #[must_use]
    pub fn read_full(mut self) -> Self {
        self.actions.push(ReadAction::ReadFull);
        self
    }

    /// The sub-operations in submission order
    #[must_use]
    pub fn actions(&self) -> &[ReadAction] {
        &self.actions
    }
}

/// Results of a compound read, one slot per requested sub-operation
///
/// A slot is `None` when the corresponding sub-operation was not part of
/// the request. An object with no OMAP header yields an empty header
/// slot; a missing object fails the whole read with not-found.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// OMAP header bytes, empty if the object has no header
    pub header: Option<Result<Bytes>>,
    /// OMAP entries in key order
    pub values: Option<Result<BTreeMap<String, Bytes>>>,
    /// Full byte payload
    pub data: Option<Result<Bytes>>,
}

/// One write sub-operation
#[derive(Clone, Debug)]
pub enum WriteAction {
    /// Truncate the byte payload to `n` bytes
    Truncate(u64),
    /// Replace the OMAP header blob
    OmapSetHeader(Bytes),
    /// Insert or overwrite OMAP entries
    OmapSet(BTreeMap<String, Bytes>),
    /// Remove OMAP entries by key
    OmapRmKeys(BTreeSet<String>),
}

/// Compound write operation against one object, applied atomically
#[derive(Clone, Debug, Default)]
pub struct WriteOp {
    actions: Vec<WriteAction>,
}

impl WriteOp {
    /// Create an empty write operation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a byte-payload truncate
    #[must_use]
    pub fn truncate(mut self, n: u64) -> Self {
        self.actions.push(WriteAction::Truncate(n));
        self
    }

    /// Add an OMAP header write
    #[must_use]
    pub fn omap_set_header(mut self, header: Bytes) -> Self {
        self.actions.push(WriteAction::OmapSetHeader(header));
        self
    }

    /// Add an OMAP entry upsert
    #[must_use]
    pub fn omap_set(mut self, entries: BTreeMap<String, Bytes>) -> Self {
        self.actions.push(WriteAction::OmapSet(entries));
        self
    }

    /// Add an OMAP entry removal
    #[must_use]
    pub fn omap_rm_keys(mut self, keys: BTreeSet<String>) -> Self {
        self.actions.push(WriteAction::OmapRmKeys(keys));
        self
    }

    /// The sub-operations in application order
    #[must_use]
    pub fn actions(&self) -> &[WriteAction] {
        &self.actions
    }

    /// True if the operation carries no sub-operations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
