//! In-memory object store
//!
//! Process-local [`ObjectStore`] backend. Compound mutations are applied
//! under a single lock, so their atomicity matches the real store, and
//! completions are delivered through the finisher like any other backend.
//! Reading an object that does not exist reports not-found; mutating one
//! creates it.
//!
//! The store keeps an operation log and counters so tests can assert how
//! many operations were submitted and what each one contained, and it can
//! hold completions back to create an "operation in flight" window.

use crate::finisher::{Completion, Finisher};
use crate::ops::{ReadAction, ReadOutcome, WriteAction};
use crate::{MutateCompletion, ObjectId, PoolId, ReadCompletion, ReadOp, SnapContext, WriteOp};
use bytes::Bytes;
use metafs_common::Error;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

#[derive(Clone, Default)]
struct MemObject {
    data: Vec<u8>,
    omap_header: Vec<u8>,
    omap: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MemState {
    objects: HashMap<(i64, String), MemObject>,
    reads: u64,
    mutations: u64,
    read_log: Vec<ReadOp>,
    mutation_log: Vec<WriteOp>,
    hold: bool,
    held: Vec<Completion>,
}

/// In-memory object store backend
pub struct MemStore {
    finisher: Arc<Finisher>,
    state: Mutex<MemState>,
}

impl MemStore {
    /// Create a store delivering completions through `finisher`
    #[must_use]
    pub fn new(finisher: Arc<Finisher>) -> Self {
        Self {
            finisher,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Number of read operations submitted
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Number of mutations submitted
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutations
    }

    /// Every read submitted, in order
    #[must_use]
    pub fn read_log(&self) -> Vec<ReadOp> {
        self.state.lock().read_log.clone()
    }

    /// Every mutation submitted, in order
    #[must_use]
    pub fn mutation_log(&self) -> Vec<WriteOp> {
        self.state.lock().mutation_log.clone()
    }

    /// OMAP header of an object, if it exists
    #[must_use]
    pub fn omap_header(&self, pool: PoolId, oid: &ObjectId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&(pool.0, oid.as_str().to_string()))
            .map(|o| o.omap_header.clone())
    }

    /// Full OMAP image of an object, if it exists
    #[must_use]
    pub fn omap_image(&self, pool: PoolId, oid: &ObjectId) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state
            .lock()
            .objects
            .get(&(pool.0, oid.as_str().to_string()))
            .map(|o| o.omap.clone())
    }

    /// Byte payload of an object, if it exists
    #[must_use]
    pub fn object_data(&self, pool: PoolId, oid: &ObjectId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&(pool.0, oid.as_str().to_string()))
            .map(|o| o.data.clone())
    }

    /// Seed an object's byte payload directly (legacy-format fixtures)
    pub fn put_object_data(&self, pool: PoolId, oid: &ObjectId, data: Vec<u8>) {
        let mut st = self.state.lock();
        st.objects
            .entry((pool.0, oid.as_str().to_string()))
            .or_default()
            .data = data;
    }

    /// Hold completions instead of delivering them (true), or deliver held
    /// completions in order and resume normal dispatch (false).
    ///
    /// Gives tests an "operation in flight" window between submission and
    /// completion.
    pub fn set_hold_completions(&self, hold: bool) {
        let released = {
            let mut st = self.state.lock();
            st.hold = hold;
            if hold {
                Vec::new()
            } else {
                std::mem::take(&mut st.held)
            }
        };
        for completion in released {
            self.finisher.queue(completion);
        }
    }

    fn dispatch(&self, completion: Completion) {
        let mut st = self.state.lock();
        if st.hold {
            st.held.push(completion);
        } else {
            drop(st);
            self.finisher.queue(completion);
        }
    }

    fn execute_read(obj: &MemObject, op: &ReadOp) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        for action in op.actions() {
            match action {
                ReadAction::OmapGetHeader => {
                    outcome.header = Some(Ok(Bytes::from(obj.omap_header.clone())));
                }
                ReadAction::OmapGetVals { start, prefix, max } => {
                    let range = (Bound::Excluded(start.clone()), Bound::Unbounded);
                    let vals: BTreeMap<String, Bytes> = obj
                        .omap
                        .range::<String, _>(range)
                        .filter(|(k, _)| k.starts_with(prefix.as_str()))
                        .take(*max)
                        .map(|(k, v)| (k.clone(), Bytes::from(v.clone())))
                        .collect();
                    outcome.values = Some(Ok(vals));
                }
                ReadAction::ReadFull => {
                    outcome.data = Some(Ok(Bytes::from(obj.data.clone())));
                }
            }
        }
        outcome
    }

    fn apply_mutation(obj: &mut MemObject, op: &WriteOp) {
        for action in op.actions() {
            match action {
                WriteAction::Truncate(n) => {
                    obj.data.resize(*n as usize, 0);
                }
                WriteAction::OmapSetHeader(header) => {
                    obj.omap_header = header.to_vec();
                }
                WriteAction::OmapSet(entries) => {
                    for (k, v) in entries {
                        obj.omap.insert(k.clone(), v.to_vec());
                    }
                }
                WriteAction::OmapRmKeys(keys) => {
                    for k in keys {
                        obj.omap.remove(k);
                    }
                }
            }
        }
    }
}

impl crate::ObjectStore for MemStore {
    fn read(&self, oid: &ObjectId, pool: PoolId, op: ReadOp, on_finish: ReadCompletion) {
        trace!(oid = %oid, actions = op.actions().len(), "mem read");
        let result = {
            let mut st = self.state.lock();
            st.reads += 1;
            st.read_log.push(op.clone());
            st.objects
                .get(&(pool.0, oid.as_str().to_string()))
                .map(|obj| Self::execute_read(obj, &op))
                .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))
        };
        self.dispatch(Box::new(move || on_finish(result)));
    }

    fn mutate(
        &self,
        oid: &ObjectId,
        pool: PoolId,
        op: WriteOp,
        _snapc: SnapContext,
        _mtime: SystemTime,
        on_finish: MutateCompletion,
    ) {
        trace!(oid = %oid, actions = op.actions().len(), "mem mutate");
        {
            let mut st = self.state.lock();
            st.mutations += 1;
            st.mutation_log.push(op.clone());
            let obj = st
                .objects
                .entry((pool.0, oid.as_str().to_string()))
                .or_default();
            Self::apply_mutation(obj, &op);
        }
        self.dispatch(Box::new(move || on_finish(Ok(()))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectStore;
    use std::sync::mpsc;
    use std::time::Duration;

    fn store() -> (Arc<MemStore>, PoolId, ObjectId) {
        let finisher = Arc::new(Finisher::new());
        (
            Arc::new(MemStore::new(finisher)),
            PoolId(1),
            ObjectId::new("obj"),
        )
    }

    fn mutate_sync(store: &MemStore, oid: &ObjectId, pool: PoolId, op: WriteOp) {
        let (tx, rx) = mpsc::channel();
        store.mutate(
            oid,
            pool,
            op,
            SnapContext::default(),
            SystemTime::now(),
            Box::new(move |r| {
                r.unwrap();
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    fn read_sync(store: &MemStore, oid: &ObjectId, pool: PoolId, op: ReadOp) -> ReadOutcome {
        let (tx, rx) = mpsc::channel();
        store.read(
            oid,
            pool,
            op,
            Box::new(move |r| {
                tx.send(r.unwrap()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_read_missing_object_is_not_found() {
        let (store, pool, oid) = store();
        let (tx, rx) = mpsc::channel();
        store.read(
            &oid,
            pool,
            ReadOp::new().omap_get_header().omap_get_vals("", "", 8),
            Box::new(move |r| tx.send(r).unwrap()),
        );
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(res, Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_read_existing_object_with_empty_omap() {
        let (store, pool, oid) = store();
        store.put_object_data(pool, &oid, b"payload".to_vec());
        let outcome = read_sync(
            &store,
            &oid,
            pool,
            ReadOp::new().omap_get_header().omap_get_vals("", "", 8),
        );
        assert!(outcome.header.unwrap().unwrap().is_empty());
        assert!(outcome.values.unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_omap_get_vals_pages_with_exclusive_start() {
        let (store, pool, oid) = store();
        let entries: BTreeMap<String, Bytes> = (1..=4)
            .map(|i| (format!("client.{i}"), Bytes::from(vec![i as u8])))
            .collect();
        mutate_sync(&store, &oid, pool, WriteOp::new().omap_set(entries));

        let first = read_sync(&store, &oid, pool, ReadOp::new().omap_get_vals("", "", 2));
        let first = first.values.unwrap().unwrap();
        assert_eq!(
            first.keys().cloned().collect::<Vec<_>>(),
            vec!["client.1", "client.2"]
        );

        let second = read_sync(
            &store,
            &oid,
            pool,
            ReadOp::new().omap_get_vals("client.2", "", 2),
        );
        let second = second.values.unwrap().unwrap();
        assert_eq!(
            second.keys().cloned().collect::<Vec<_>>(),
            vec!["client.3", "client.4"]
        );
    }

    #[test]
    fn test_compound_mutation_is_applied_in_order() {
        let (store, pool, oid) = store();
        store.put_object_data(pool, &oid, b"legacy blob".to_vec());

        let op = WriteOp::new()
            .truncate(0)
            .omap_set_header(Bytes::from_static(b"hdr"))
            .omap_set(BTreeMap::from([(
                "client.1".to_string(),
                Bytes::from_static(b"v1"),
            )]))
            .omap_rm_keys([String::from("client.1")].into());
        mutate_sync(&store, &oid, pool, op);

        assert_eq!(store.object_data(pool, &oid).unwrap(), Vec::<u8>::new());
        assert_eq!(store.omap_header(pool, &oid).unwrap(), b"hdr".to_vec());
        assert!(store.omap_image(pool, &oid).unwrap().is_empty());
        assert_eq!(store.mutation_count(), 1);
        assert_eq!(store.mutation_log().len(), 1);
    }

    #[test]
    fn test_held_completions_release_in_order() {
        let (store, pool, oid) = store();
        store.set_hold_completions(true);

        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            store.mutate(
                &oid,
                pool,
                WriteOp::new().omap_set_header(Bytes::from(vec![i])),
                SnapContext::default(),
                SystemTime::now(),
                Box::new(move |r| {
                    r.unwrap();
                    tx.send(i).unwrap();
                }),
            );
        }
        assert!(rx.try_recv().is_err());

        store.set_hold_completions(false);
        let order: Vec<u8> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
