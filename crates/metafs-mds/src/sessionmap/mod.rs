//! Durable per-rank session table
//!
//! One [`SessionMap`] per MDS rank holds the authoritative set of client
//! sessions and persists it as a single object in the metadata pool.
//! Mutations accumulate in memory as a dirty overlay (upserts plus
//! tombstones) and advance a version counter; a save publishes the overlay
//! to the object in one atomic operation.
//!
//! The version lineage has four checkpoints, always ordered
//! `committed <= committing <= version <= projected`:
//! - `projected`: next version promised to in-flight journal events;
//! - `version`: what the in-memory map reflects;
//! - `committing`: the version the save in flight will publish;
//! - `committed`: the version last made durable.
//!
//! Callers waiting on durability register against a version and are
//! released once `committed` reaches it.
//!
//! All mutation entry points assume the daemon's serialized context: they
//! lock the map state for their duration, and I/O completions re-enter
//! through the finisher one at a time.

pub mod store;

mod io;

use crate::session::{Session, SessionState};
use metafs_common::clock::Clock;
use metafs_common::types::{EntityName, RankId};
use metafs_common::MdsConfig;
use metafs_client::{ObjectStore, PoolId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use store::SessionMapStore;

/// Callback released once the awaited event (load or commit) happens
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// The live, rank-owned session table
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Clone)]
pub struct SessionMap {
    shared: Arc<Shared>,
}

struct Shared {
    rank: RankId,
    pool: PoolId,
    keys_per_op: usize,
    objecter: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<MapState>,
}

#[derive(Default)]
struct MapState {
    store: SessionMapStore,
    by_state: HashMap<SessionState, Vec<EntityName>>,
    dirty_sessions: BTreeSet<EntityName>,
    null_sessions: BTreeSet<EntityName>,
    projected: u64,
    committing: u64,
    committed: u64,
    commit_waiters: BTreeMap<u64, Vec<Completion>>,
    waiting_for_load: Vec<Completion>,
    loaded_legacy: bool,
}

impl MapState {
    fn unlink(&mut self, name: &EntityName, state: SessionState) {
        if let Some(list) = self.by_state.get_mut(&state) {
            if let Some(pos) = list.iter().position(|n| n == name) {
                list.remove(pos);
            }
        }
    }

    fn link_tail(&mut self, name: EntityName, state: SessionState) {
        self.by_state.entry(state).or_default().push(name);
    }

    fn rebuild_by_state(&mut self) {
        self.by_state.clear();
        for (name, session) in &self.store.sessions {
            self.by_state.entry(session.state()).or_default().push(*name);
        }
    }

    fn remove_session(&mut self, name: &EntityName) {
        let mut session = self
            .store
            .sessions
            .remove(name)
            .expect("remove_session: unknown session");
        session.trim_completed_requests(0);
        self.unlink(name, session.state());
        self.dirty_sessions.remove(name);
        self.null_sessions.insert(*name);
    }
}

impl SessionMap {
    /// Create an empty map for the rank named in `config`
    #[must_use]
    pub fn new(config: &MdsConfig, objecter: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                rank: config.rank,
                pool: PoolId(config.metadata_pool),
                keys_per_op: config.sessionmap_keys_per_op,
                objecter,
                clock,
                state: Mutex::new(MapState::default()),
            }),
        }
    }

    /// Rank owning this map
    #[must_use]
    pub fn rank(&self) -> RankId {
        self.shared.rank
    }

    /// Version the in-memory map reflects
    #[must_use]
    pub fn version(&self) -> u64 {
        self.shared.state.lock().store.version
    }

    /// Newest version promised to in-flight events
    #[must_use]
    pub fn projected(&self) -> u64 {
        self.shared.state.lock().projected
    }

    /// Version the save in flight will publish
    #[must_use]
    pub fn committing(&self) -> u64 {
        self.shared.state.lock().committing
    }

    /// Version last made durable
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.shared.state.lock().committed
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().store.session_count()
    }

    /// True if a session exists for `name`
    #[must_use]
    pub fn have_session(&self, name: &EntityName) -> bool {
        self.shared.state.lock().store.get(name).is_some()
    }

    /// Run `f` against the session for `name`, if it exists
    pub fn with_session<R>(&self, name: &EntityName, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let guard = self.shared.state.lock();
        guard.store.get(name).map(f)
    }

    /// Run `f` against the session for `name` mutably, if it exists
    ///
    /// State transitions must go through [`SessionMap::set_state`] so the
    /// state index stays consistent.
    pub fn with_session_mut<R>(
        &self,
        name: &EntityName,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut guard = self.shared.state.lock();
        guard.store.get_mut(name).map(f)
    }

    /// Sessions currently in `state`, oldest first
    #[must_use]
    pub fn sessions_in_state(&self, state: SessionState) -> Vec<EntityName> {
        self.shared
            .state
            .lock()
            .by_state
            .get(&state)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert a new session
    ///
    /// Precondition: no session exists for its name.
    pub fn add_session(&self, session: Session) {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let name = session.info.inst.name;
        debug!(rank = %self.shared.rank, %name, "add_session");
        assert!(
            !st.store.sessions.contains_key(&name),
            "add_session: duplicate session {name}"
        );
        st.link_tail(name, session.state());
        st.store.sessions.insert(name, session);
        st.null_sessions.remove(&name);
    }

    /// Remove a session, scheduling its persisted record for deletion
    pub fn remove_session(&self, name: &EntityName) {
        let mut guard = self.shared.state.lock();
        debug!(rank = %self.shared.rank, %name, "remove_session");
        guard.remove_session(name);
    }

    /// Move a session to `state`, returning its transition sequence
    ///
    /// The session joins the tail of the target state's list. Calling with
    /// its current state is a no-op.
    pub fn set_state(&self, name: &EntityName, state: SessionState) -> u64 {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let session = st
            .store
            .sessions
            .get_mut(name)
            .expect("set_state: unknown session");
        let old = session.state();
        if old == state {
            return session.state_seq();
        }
        session.set_state(state);
        let seq = session.state_seq();
        debug!(
            rank = %self.shared.rank, %name,
            from = old.name(), to = state.name(), seq,
            "session state change"
        );
        st.unlink(name, old);
        st.link_tail(*name, state);
        seq
    }

    /// Refresh a session's lease and move it to the tail of its state list
    ///
    /// Precondition: the session is linked (added, not yet removed).
    pub fn touch_session(&self, name: &EntityName) {
        let now = self.shared.clock.now();
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        debug!(rank = %self.shared.rank, %name, "touch_session");
        let state = st
            .store
            .sessions
            .get(name)
            .expect("touch_session: unknown session")
            .state();
        let list = st
            .by_state
            .get_mut(&state)
            .expect("touch_session: session not linked");
        let pos = list
            .iter()
            .position(|n| n == name)
            .expect("touch_session: session not linked");
        let entry = list.remove(pos);
        list.push(entry);
        st.store
            .sessions
            .get_mut(name)
            .expect("session present")
            .last_cap_renew = Some(now);
    }

    /// Stage a session for upsert on the next save and advance the version
    ///
    /// When the staged overlay has already reached the configured batch
    /// size, a preemptive save of the current overlay is issued first; the
    /// session being marked rides the save after it.
    pub fn mark_dirty(&self, name: &EntityName) {
        let pending = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            debug!(
                rank = %self.shared.rank, %name,
                version = st.store.version, "mark_dirty"
            );
            let pending = self.stage_dirty(st, name);
            st.store.version += 1;
            if st.projected < st.store.version {
                st.projected = st.store.version;
            }
            let version = st.store.version;
            if let Some(session) = st.store.sessions.get_mut(name) {
                session.pop_projected_version(version);
            }
            pending
        };
        if let Some(pending) = pending {
            self.submit_save(pending);
        }
    }

    fn stage_dirty(&self, st: &mut MapState, name: &EntityName) -> Option<io::PendingSave> {
        let mut pending = None;
        if st.dirty_sessions.len() >= self.shared.keys_per_op {
            // Flush the staged overlay before it outgrows one OMAP write.
            let version = st.store.version;
            pending = self.compose_save(st, Box::new(|| {}), version);
        }
        debug_assert!(!st.null_sessions.contains(name));
        st.dirty_sessions.insert(*name);
        pending
    }

    /// Reserve the next projected version for a session
    pub fn mark_projected(&self, name: &EntityName) -> u64 {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        st.projected += 1;
        let pv = st.projected;
        debug!(rank = %self.shared.rank, %name, pv, "mark_projected");
        st.store
            .sessions
            .get_mut(name)
            .expect("mark_projected: unknown session")
            .push_projected_version(pv);
        pv
    }

    /// Journal-replay variant of [`SessionMap::mark_dirty`]
    pub fn replay_dirty_session(&self, name: &EntityName) {
        let pending = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;
            debug!(
                rank = %self.shared.rank, %name,
                version = st.store.version, "replay_dirty_session"
            );
            let pending = self.stage_dirty(st, name);
            st.store.version += 1;
            if st.projected < st.store.version {
                st.projected = st.store.version;
            }
            pending
        };
        if let Some(pending) = pending {
            self.submit_save(pending);
        }
    }

    /// Advance the version lineage for a replayed event that touched no
    /// session
    pub fn replay_advance_version(&self) {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        st.store.version += 1;
        if st.projected < st.store.version {
            st.projected = st.store.version;
        }
    }

    /// Remove every session
    pub fn wipe(&self) {
        info!(rank = %self.shared.rank, "wipe start");
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let names: Vec<EntityName> = st.store.sessions.keys().copied().collect();
        for name in &names {
            st.remove_session(name);
        }
        st.projected += 1;
        st.store.version = st.projected;
        debug_assert!(st.by_state.values().all(Vec::is_empty));
        info!(rank = %self.shared.rank, sessions = names.len(), "wipe done");
    }

    /// Clear inode preallocation state on every session
    pub fn wipe_ino_prealloc(&self) {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        for session in st.store.sessions.values_mut() {
            session.pending_prealloc_inos.clear();
            session.info.prealloc_inos.clear();
            session.info.used_inos.clear();
        }
        st.store.version += 1;
        if st.projected < st.store.version {
            st.projected = st.store.version;
        }
    }

    /// Structured debug view of the map and its version lineage
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let guard = self.shared.state.lock();
        let mut dump = guard.store.dump();
        dump["projected"] = json!(guard.projected);
        dump["committing"] = json!(guard.committing);
        dump["committed"] = json!(guard.committed);
        dump
    }

    #[cfg(test)]
    pub(crate) fn dirty_sessions(&self) -> BTreeSet<EntityName> {
        self.shared.state.lock().dirty_sessions.clone()
    }

    #[cfg(test)]
    pub(crate) fn null_sessions(&self) -> BTreeSet<EntityName> {
        self.shared.state.lock().null_sessions.clone()
    }

    #[cfg(test)]
    pub(crate) fn loaded_legacy(&self) -> bool {
        self.shared.state.lock().loaded_legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInfo;
    use metafs_client::{Finisher, MemStore};
    use metafs_common::clock::ManualClock;
    use metafs_common::types::EntityInst;
    use proptest::prelude::*;
    use std::sync::mpsc;
    use std::time::Duration;

    pub(super) struct Harness {
        pub map: SessionMap,
        pub store: Arc<MemStore>,
        pub clock: Arc<ManualClock>,
    }

    pub(super) fn harness(keys_per_op: usize) -> Harness {
        let finisher = Arc::new(Finisher::new());
        let store = Arc::new(MemStore::new(finisher));
        let clock = Arc::new(ManualClock::default());
        harness_with(keys_per_op, Arc::clone(&store), Arc::clone(&clock))
    }

    pub(super) fn harness_with(
        keys_per_op: usize,
        store: Arc<MemStore>,
        clock: Arc<ManualClock>,
    ) -> Harness {
        let config = MdsConfig {
            sessionmap_keys_per_op: keys_per_op,
            ..Default::default()
        };
        let map = SessionMap::new(
            &config,
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Harness { map, store, clock }
    }

    pub(super) fn open_session(id: u64) -> Session {
        let mut session = Session::new(SessionInfo::new(EntityInst::new(
            EntityName::client(id),
            "10.0.0.1:6800".parse().unwrap(),
        )));
        session.set_state(SessionState::Open);
        session
    }

    pub(super) fn save_sync(map: &SessionMap, needv: u64) {
        let (tx, rx) = mpsc::channel();
        map.save(Box::new(move || tx.send(()).unwrap()), needv);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    pub(super) fn load_sync(map: &SessionMap) {
        let (tx, rx) = mpsc::channel();
        map.load(Some(Box::new(move || tx.send(()).unwrap())));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    fn assert_invariants(map: &SessionMap) {
        let committed = map.committed();
        let committing = map.committing();
        let version = map.version();
        let projected = map.projected();
        assert!(
            committed <= committing && committing <= version && version <= projected,
            "version lineage out of order: {committed} {committing} {version} {projected}"
        );

        // Every session sits in exactly one state list, matching its state.
        let mut indexed = 0;
        for state in SessionState::ALL {
            for name in map.sessions_in_state(state) {
                indexed += 1;
                let actual = map.with_session(&name, |s| s.state()).unwrap();
                assert_eq!(actual, state, "session {name} indexed under wrong state");
            }
        }
        assert_eq!(indexed, map.session_count());

        let dirty = map.dirty_sessions();
        let null = map.null_sessions();
        assert!(dirty.is_disjoint(&null));
        for name in &dirty {
            assert!(map.have_session(name), "dirty session {name} not in map");
        }
        for name in &null {
            assert!(!map.have_session(name), "null session {name} still in map");
        }
    }

    #[test]
    fn test_add_and_remove_session() {
        let h = harness(1024);
        let name = EntityName::client(1);

        h.map.add_session(open_session(1));
        assert!(h.map.have_session(&name));
        assert_eq!(h.map.sessions_in_state(SessionState::Open), vec![name]);

        h.map.mark_dirty(&name);
        assert!(h.map.dirty_sessions().contains(&name));

        h.map.remove_session(&name);
        assert!(!h.map.have_session(&name));
        assert!(h.map.sessions_in_state(SessionState::Open).is_empty());
        assert!(!h.map.dirty_sessions().contains(&name));
        assert!(h.map.null_sessions().contains(&name));
    }

    #[test]
    #[should_panic(expected = "duplicate session")]
    fn test_add_session_twice_panics() {
        let h = harness(1024);
        h.map.add_session(open_session(1));
        h.map.add_session(open_session(1));
    }

    #[test]
    fn test_set_state_moves_between_lists() {
        let h = harness(1024);
        for id in 1..=3 {
            h.map.add_session(open_session(id));
        }
        let b = EntityName::client(2);

        let seq = h.map.set_state(&b, SessionState::Stale);
        assert_eq!(seq, 2); // one bump at open, one now
        assert_eq!(
            h.map.sessions_in_state(SessionState::Open),
            vec![EntityName::client(1), EntityName::client(3)]
        );
        assert_eq!(h.map.sessions_in_state(SessionState::Stale), vec![b]);

        // Same-state call is a no-op and keeps the sequence.
        assert_eq!(h.map.set_state(&b, SessionState::Stale), 2);
    }

    #[test]
    fn test_touch_session_refreshes_lru_and_lease() {
        let h = harness(1024);
        for id in 1..=3 {
            h.map.add_session(open_session(id));
        }
        h.clock.advance(Duration::from_secs(30));
        h.map.touch_session(&EntityName::client(1));

        assert_eq!(
            h.map.sessions_in_state(SessionState::Open),
            vec![
                EntityName::client(2),
                EntityName::client(3),
                EntityName::client(1)
            ]
        );
        let renewed = h
            .map
            .with_session(&EntityName::client(1), |s| s.last_cap_renew)
            .unwrap();
        assert_eq!(renewed, Some(h.clock.now()));
    }

    #[test]
    fn test_mark_projected_then_dirty_drains_queue() {
        let h = harness(1024);
        let name = EntityName::client(1);
        h.map.add_session(open_session(1));

        let pv = h.map.mark_projected(&name);
        assert_eq!(pv, 1);
        assert_eq!(h.map.projected(), 1);
        assert_eq!(h.map.version(), 0);

        h.map.mark_dirty(&name);
        assert_eq!(h.map.version(), 1);
        assert_eq!(h.map.projected(), 1);
    }

    #[test]
    fn test_replay_advances_version_and_projected() {
        let h = harness(1024);
        let name = EntityName::client(1);
        h.map.add_session(open_session(1));

        h.map.replay_dirty_session(&name);
        assert_eq!(h.map.version(), 1);
        assert_eq!(h.map.projected(), 1);
        assert!(h.map.dirty_sessions().contains(&name));

        h.map.replay_advance_version();
        assert_eq!(h.map.version(), 2);
        assert_eq!(h.map.projected(), 2);
    }

    #[test]
    fn test_wipe_empties_map_and_bumps_lineage() {
        let h = harness(1024);
        for id in 1..=4 {
            h.map.add_session(open_session(id));
        }
        h.map.wipe();
        assert_eq!(h.map.session_count(), 0);
        assert_eq!(h.map.version(), 1);
        assert_eq!(h.map.projected(), 1);
        assert_eq!(h.map.null_sessions().len(), 4);
        assert_invariants(&h.map);
    }

    #[test]
    fn test_wipe_ino_prealloc_clears_every_session() {
        let h = harness(1024);
        let name = EntityName::client(1);
        h.map.add_session(open_session(1));
        h.map
            .with_session_mut(&name, |s| {
                s.pending_prealloc_inos.insert(10);
                s.info.prealloc_inos.insert(11);
                s.info.used_inos.insert(12);
            })
            .unwrap();

        h.map.wipe_ino_prealloc();
        h.map
            .with_session(&name, |s| {
                assert!(s.pending_prealloc_inos.is_empty());
                assert!(s.info.prealloc_inos.is_empty());
                assert!(s.info.used_inos.is_empty());
            })
            .unwrap();
        assert_eq!(h.map.version(), 1);
        assert_eq!(h.map.projected(), 1);
    }

    #[test]
    fn test_dump_carries_lineage() {
        let h = harness(1024);
        h.map.add_session(open_session(7));
        let dump = h.map.dump();
        assert_eq!(dump["version"], 0);
        assert_eq!(dump["committed"], 0);
        assert_eq!(dump["sessions"][0]["entity"], "client.7");
    }

    #[derive(Clone, Debug)]
    enum MapOp {
        Add(u8),
        Remove(u8),
        SetState(u8, u8),
        Touch(u8),
        MarkProjected(u8),
        MarkDirty(u8),
        ReplayDirty(u8),
        ReplayAdvance,
        Wipe,
        WipeInoPrealloc,
        Save,
    }

    fn map_op() -> impl Strategy<Value = MapOp> {
        prop_oneof![
            4 => (0..8u8).prop_map(MapOp::Add),
            3 => (0..8u8).prop_map(MapOp::Remove),
            3 => (0..8u8, 0..4u8).prop_map(|(s, st)| MapOp::SetState(s, st)),
            3 => (0..8u8).prop_map(MapOp::Touch),
            3 => (0..8u8).prop_map(MapOp::MarkProjected),
            4 => (0..8u8).prop_map(MapOp::MarkDirty),
            2 => (0..8u8).prop_map(MapOp::ReplayDirty),
            2 => Just(MapOp::ReplayAdvance),
            1 => Just(MapOp::Wipe),
            1 => Just(MapOp::WipeInoPrealloc),
            3 => Just(MapOp::Save),
        ]
    }

    // States a live session can be steered into by the daemon; all of them
    // are persisted on save, so the final image matches the live filter.
    const STEERABLE: [SessionState; 4] = [
        SessionState::Open,
        SessionState::Closing,
        SessionState::Stale,
        SessionState::Killing,
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_invariants_hold_across_mutations(ops in proptest::collection::vec(map_op(), 1..40)) {
            let h = harness(3);
            let mut last = (0u64, 0u64, 0u64, 0u64);

            for op in ops {
                match op {
                    MapOp::Add(id) => {
                        let name = EntityName::client(u64::from(id));
                        if !h.map.have_session(&name) {
                            h.map.add_session(open_session(u64::from(id)));
                        }
                    }
                    MapOp::Remove(id) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.remove_session(&name);
                        }
                    }
                    MapOp::SetState(id, state) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.set_state(&name, STEERABLE[state as usize]);
                        }
                    }
                    MapOp::Touch(id) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.touch_session(&name);
                        }
                    }
                    MapOp::MarkProjected(id) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.mark_projected(&name);
                        }
                    }
                    MapOp::MarkDirty(id) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.mark_dirty(&name);
                        }
                    }
                    MapOp::ReplayDirty(id) => {
                        let name = EntityName::client(u64::from(id));
                        if h.map.have_session(&name) {
                            h.map.replay_dirty_session(&name);
                        }
                    }
                    MapOp::ReplayAdvance => h.map.replay_advance_version(),
                    MapOp::Wipe => h.map.wipe(),
                    MapOp::WipeInoPrealloc => h.map.wipe_ino_prealloc(),
                    MapOp::Save => {
                        let at = h.map.version();
                        save_sync(&h.map, 0);
                        prop_assert!(h.map.committed() >= at);
                        prop_assert!(h.map.dirty_sessions().is_empty());
                        prop_assert!(h.map.null_sessions().is_empty());
                    }
                }

                assert_invariants(&h.map);

                let now = (
                    h.map.committed(),
                    h.map.committing(),
                    h.map.version(),
                    h.map.projected(),
                );
                prop_assert!(now.0 >= last.0 && now.1 >= last.1 && now.2 >= last.2 && now.3 >= last.3);
                last = now;
            }
        }
    }
}
