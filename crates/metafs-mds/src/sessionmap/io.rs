//! Persistence protocol for the session map
//!
//! Translates load and save intents into compound object operations
//! against this rank's `mds{rank}_sessionmap` object.
//!
//! Loading is a two-phase machine: the first read fetches the OMAP header
//! plus one batch of entries; follow-up reads continue from the last key
//! seen until a short batch signals the end. A missing object is a fresh
//! rank and loads empty. An empty header on an existing object means it
//! predates the OMAP format, and the whole byte payload is read instead;
//! the next save then truncates the payload and writes the OMAP image in
//! the same atomic operation.
//!
//! A save publishes the dirty overlay: the header, an upsert per dirty
//! session in a persisted state, and a key removal per deleted session.
//! I/O failures on either path are fatal to the rank; waiters are only
//! ever released on success.

use super::{Completion, MapState, SessionMap};
use bytes::BytesMut;
use metafs_client::ops::{ReadOp, ReadOutcome, WriteOp};
use metafs_client::{ObjectId, SnapContext};
use metafs_common::encoding::Decoder;
use metafs_common::types::EntityName;
use metafs_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, trace};

/// A composed save, ready for submission outside the state lock
pub(super) struct PendingSave {
    op: WriteOp,
    version: u64,
}

enum LoadStep {
    /// Issue another batched read starting after `last_key`
    Continue { last_key: String },
    /// No OMAP header: fall back to the legacy byte payload
    Legacy,
    /// Load complete; release the waiters
    Done {
        waiters: Vec<Completion>,
        version: u64,
        sessions: usize,
    },
}

impl SessionMap {
    /// Name of this rank's session-map object
    #[must_use]
    pub fn object_name(&self) -> ObjectId {
        ObjectId::new(format!("mds{}_sessionmap", self.shared.rank))
    }

    /// Populate the map from its object, releasing `onload` when done
    ///
    /// Called once at rank startup, before any mutation or save.
    pub fn load(&self, onload: Option<Completion>) {
        debug!(rank = %self.shared.rank, "load");
        if let Some(completion) = onload {
            self.shared.state.lock().waiting_for_load.push(completion);
        }
        self.issue_load(true, String::new());
    }

    fn issue_load(&self, first: bool, start: String) {
        let mut op = ReadOp::new();
        if first {
            op = op.omap_get_header();
        }
        op = op.omap_get_vals(start, "", self.shared.keys_per_op);

        let this = self.clone();
        self.shared.objecter.read(
            &self.object_name(),
            self.shared.pool,
            op,
            Box::new(move |res| this.load_finish(first, res)),
        );
    }

    fn load_finish(&self, first: bool, res: Result<ReadOutcome>) {
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(Error::ObjectNotFound(_)) if first => {
                // Fresh rank: nothing has ever been saved. Start empty at
                // version zero.
                info!(rank = %self.shared.rank, "no session map object, starting empty");
                let waiters = {
                    let mut guard = self.shared.state.lock();
                    let version = guard.store.version;
                    guard.projected = version;
                    guard.committing = version;
                    guard.committed = version;
                    std::mem::take(&mut guard.waiting_for_load)
                };
                for waiter in waiters {
                    waiter();
                }
                return;
            }
            Err(e) => {
                error!(rank = %self.shared.rank, error = %e, "session map load failed");
                panic!("failed to load session map: {e}");
            }
        };

        let step = {
            let mut guard = self.shared.state.lock();
            self.load_finish_locked(&mut guard, first, outcome)
        };

        match step {
            LoadStep::Continue { last_key } => self.issue_load(false, last_key),
            LoadStep::Legacy => self.load_legacy(),
            LoadStep::Done {
                waiters,
                version,
                sessions,
            } => {
                info!(rank = %self.shared.rank, version, sessions, "session map loaded");
                for waiter in waiters {
                    waiter();
                }
            }
        }
    }

    fn load_finish_locked(
        &self,
        st: &mut MapState,
        first: bool,
        outcome: ReadOutcome,
    ) -> LoadStep {
        if first {
            let header = match outcome.header {
                Some(Ok(header)) => header,
                Some(Err(e)) => {
                    error!(rank = %self.shared.rank, error = %e, "error reading session map header");
                    panic!("error reading session map header: {e}");
                }
                None => panic!("session map header missing from read outcome"),
            };

            if header.is_empty() {
                info!(rank = %self.shared.rank, "session map header missing, loading legacy format");
                return LoadStep::Legacy;
            }

            if let Err(e) = st.store.decode_header(&header) {
                error!(rank = %self.shared.rank, error = %e, "corrupt session map header");
                panic!("corrupt session map header: {e}");
            }
            debug!(rank = %self.shared.rank, version = st.store.version, "loaded session map header");
        }

        let values = match outcome.values {
            Some(Ok(values)) => values,
            Some(Err(e)) => {
                error!(rank = %self.shared.rank, error = %e, "error reading session map values");
                panic!("error reading session map values: {e}");
            }
            None => panic!("session map values missing from read outcome"),
        };

        if let Err(e) = st.store.decode_values(&values) {
            error!(rank = %self.shared.rank, error = %e, "corrupt session map values");
            panic!("corrupt session map values: {e}");
        }

        if values.len() == self.shared.keys_per_op {
            let last_key = values
                .keys()
                .next_back()
                .cloned()
                .expect("non-empty batch has a last key");
            debug!(rank = %self.shared.rank, %last_key, "continuing session map load");
            LoadStep::Continue { last_key }
        } else {
            st.rebuild_by_state();
            let version = st.store.version;
            st.projected = version;
            st.committing = version;
            st.committed = version;
            LoadStep::Done {
                waiters: std::mem::take(&mut st.waiting_for_load),
                version,
                sessions: st.store.session_count(),
            }
        }
    }

    /// Read the whole byte payload and decode the legacy image
    fn load_legacy(&self) {
        debug!(rank = %self.shared.rank, "load_legacy");
        let this = self.clone();
        self.shared.objecter.read(
            &self.object_name(),
            self.shared.pool,
            ReadOp::new().read_full(),
            Box::new(move |res| this.load_legacy_finish(res)),
        );
    }

    fn load_legacy_finish(&self, res: Result<ReadOutcome>) {
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(rank = %self.shared.rank, error = %e, "legacy session map load failed");
                panic!("failed to load legacy session map: {e}");
            }
        };
        let data = match outcome.data {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                error!(rank = %self.shared.rank, error = %e, "error reading legacy session map");
                panic!("error reading legacy session map: {e}");
            }
            None => panic!("legacy session map payload missing from read outcome"),
        };

        let (waiters, version, sessions) = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            let now = self.shared.clock.now();
            let mut d = Decoder::new(&data);
            if let Err(e) = st.store.decode_legacy(&mut d, now) {
                error!(rank = %self.shared.rank, error = %e, "corrupt legacy session map");
                panic!("corrupt legacy session map: {e}");
            }

            st.rebuild_by_state();
            let version = st.store.version;
            st.projected = version;
            st.committing = version;
            st.committed = version;

            // Stage every session, past the usual batch cap: the rewrite
            // into the OMAP format must land in one atomic save.
            let names: Vec<EntityName> = st.store.sessions.keys().copied().collect();
            st.dirty_sessions.extend(names);
            st.loaded_legacy = true;

            (
                std::mem::take(&mut st.waiting_for_load),
                version,
                st.store.session_count(),
            )
        };

        info!(rank = %self.shared.rank, version, sessions, "legacy session map loaded");
        for waiter in waiters {
            waiter();
        }
    }

    /// Durably persist at least the state at version `needv`, then release
    /// `on_save`
    ///
    /// If the save already in flight covers `needv`, the completion joins
    /// it and no additional operation is issued. With `needv` of zero a
    /// save is always composed.
    pub fn save(&self, on_save: Completion, needv: u64) {
        let pending = {
            let mut guard = self.shared.state.lock();
            self.compose_save(&mut guard, on_save, needv)
        };
        if let Some(pending) = pending {
            self.submit_save(pending);
        }
    }

    pub(super) fn compose_save(
        &self,
        st: &mut MapState,
        on_save: Completion,
        needv: u64,
    ) -> Option<PendingSave> {
        debug!(rank = %self.shared.rank, needv, version = st.store.version, "save");

        if needv > 0 && st.committing >= needv {
            assert!(st.committing > st.committed);
            st.commit_waiters
                .entry(st.committing)
                .or_default()
                .push(on_save);
            return None;
        }

        let version = st.store.version;
        st.commit_waiters.entry(version).or_default().push(on_save);
        st.committing = version;

        let mut op = WriteOp::new();
        if st.loaded_legacy {
            // Retire the legacy byte image in the same atomic step that
            // writes the OMAP image; older readers then fail out safely on
            // an empty payload.
            debug!(rank = %self.shared.rank, "erasing legacy session map");
            op = op.truncate(0);
            st.loaded_legacy = false;
        }

        let mut header = BytesMut::new();
        st.store.encode_header(&mut header);
        op = op.omap_set_header(header.freeze());

        let mut to_set = BTreeMap::new();
        for name in &st.dirty_sessions {
            let session = st
                .store
                .sessions
                .get(name)
                .expect("dirty session missing from map");
            if session.state().is_persisted() {
                trace!(rank = %self.shared.rank, %name, "updating key");
                let mut value = BytesMut::new();
                session.info.encode(&mut value);
                to_set.insert(name.to_string(), value.freeze());
            } else {
                trace!(
                    rank = %self.shared.rank, %name,
                    state = session.state_name(), "skipping transient session"
                );
            }
        }
        if !to_set.is_empty() {
            op = op.omap_set(to_set);
        }

        let to_remove: BTreeSet<String> =
            st.null_sessions.iter().map(ToString::to_string).collect();
        if !to_remove.is_empty() {
            op = op.omap_rm_keys(to_remove);
        }

        st.dirty_sessions.clear();
        st.null_sessions.clear();

        Some(PendingSave { op, version })
    }

    pub(super) fn submit_save(&self, pending: PendingSave) {
        let PendingSave { op, version } = pending;
        let this = self.clone();
        self.shared.objecter.mutate(
            &self.object_name(),
            self.shared.pool,
            op,
            SnapContext::default(),
            self.shared.clock.now(),
            Box::new(move |res| {
                if let Err(e) = res {
                    error!(error = %e, "session map save failed");
                    panic!("failed to save session map: {e}");
                }
                this.save_finish(version);
            }),
        );
    }

    fn save_finish(&self, version: u64) {
        let waiters = {
            let mut guard = self.shared.state.lock();
            guard.committed = version;
            guard.commit_waiters.remove(&version).unwrap_or_default()
        };
        debug!(rank = %self.shared.rank, version, "save complete");
        for waiter in waiters {
            waiter();
        }
    }
}
