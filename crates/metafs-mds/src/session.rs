//! Client session state
//!
//! One [`Session`] records what a single client has negotiated with this
//! MDS rank: its identity and address, inode preallocation, completed
//! requests, and bookkeeping for capability recall. The persisted subset
//! lives in [`SessionInfo`]; the rest is reconstructed at runtime.

use bytes::BytesMut;
use metafs_common::encoding::{self, Decoder};
use metafs_common::types::EntityInst;
use metafs_common::Result;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::SystemTime;

/// Negotiated state of a client session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session established
    Closed,
    /// Open requested, not yet journaled
    Opening,
    /// Fully established
    Open,
    /// Orderly shutdown in progress
    Closing,
    /// Missed its lease renewal window
    Stale,
    /// Being forcibly evicted
    Killing,
}

impl SessionState {
    /// All states, for index iteration
    pub const ALL: [SessionState; 6] = [
        SessionState::Closed,
        SessionState::Opening,
        SessionState::Open,
        SessionState::Closing,
        SessionState::Stale,
        SessionState::Killing,
    ];

    /// Human-readable state name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Stale => "stale",
            Self::Killing => "killing",
        }
    }

    /// States whose sessions are written out on save; transient states are
    /// skipped until they settle.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        matches!(self, Self::Open | Self::Closing | Self::Stale | Self::Killing)
    }
}

/// Persisted payload of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Client identity and last known address
    pub inst: EntityInst,
    /// Inode numbers handed to the client for its own allocation
    pub prealloc_inos: BTreeSet<u64>,
    /// Preallocated inode numbers the client has consumed
    pub used_inos: BTreeSet<u64>,
    /// Request tids whose results the client may still replay
    pub completed_requests: BTreeSet<u64>,
    /// Free-form metadata the client sent at session open
    pub client_metadata: BTreeMap<String, String>,
}

const SESSION_INFO_STRUCT_V: u8 = 1;
const SESSION_INFO_COMPAT_V: u8 = 1;

impl SessionInfo {
    /// Create an empty payload for `inst`
    #[must_use]
    pub fn new(inst: EntityInst) -> Self {
        Self {
            inst,
            prealloc_inos: BTreeSet::new(),
            used_inos: BTreeSet::new(),
            completed_requests: BTreeSet::new(),
            client_metadata: BTreeMap::new(),
        }
    }

    /// Append the versioned wire representation to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        encoding::encode_frame(buf, SESSION_INFO_STRUCT_V, SESSION_INFO_COMPAT_V, |b| {
            self.inst.encode(b);
            encoding::put_u64_set(b, &self.prealloc_inos);
            encoding::put_u64_set(b, &self.used_inos);
            encoding::put_u64_set(b, &self.completed_requests);
            encoding::put_string_map(b, &self.client_metadata);
        });
    }

    /// Decode the versioned wire representation
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let frame = d.begin_frame(SESSION_INFO_STRUCT_V)?;
        let info = Self {
            inst: EntityInst::decode(d)?,
            prealloc_inos: d.get_u64_set()?,
            used_inos: d.get_u64_set()?,
            completed_requests: d.get_u64_set()?,
            client_metadata: d.get_string_map()?,
        };
        d.finish_frame(&frame)?;
        Ok(info)
    }

    /// Structured debug view
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        json!({
            "inst": self.inst.to_string(),
            "prealloc_inos": self.prealloc_inos,
            "used_inos": self.used_inos,
            "completed_requests": self.completed_requests,
            "client_metadata": self.client_metadata,
        })
    }
}

/// One client session
///
/// Requests and capabilities are owned by other subsystems; the session
/// only indexes them by id so eviction and recall can count them.
#[derive(Clone, Debug)]
pub struct Session {
    /// Persisted payload
    pub info: SessionInfo,
    state: SessionState,
    state_seq: u64,
    /// Last time the client renewed its capability lease
    pub last_cap_renew: Option<SystemTime>,
    /// Inode numbers projected for this session but not yet journaled
    pub pending_prealloc_inos: BTreeSet<u64>,
    requests: BTreeSet<u64>,
    caps: BTreeSet<u64>,
    recalled_at: Option<SystemTime>,
    recall_count: usize,
    recall_release_count: usize,
    projected_versions: VecDeque<u64>,
    human_name: String,
}

impl Session {
    /// Create a closed session around `info`
    #[must_use]
    pub fn new(info: SessionInfo) -> Self {
        let mut session = Self {
            info,
            state: SessionState::Closed,
            state_seq: 0,
            last_cap_renew: None,
            pending_prealloc_inos: BTreeSet::new(),
            requests: BTreeSet::new(),
            caps: BTreeSet::new(),
            recalled_at: None,
            recall_count: 0,
            recall_release_count: 0,
            projected_versions: VecDeque::new(),
            human_name: String::new(),
        };
        session.update_human_name();
        session
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Human-readable state name
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Sequence number of the last state transition
    #[must_use]
    pub fn state_seq(&self) -> u64 {
        self.state_seq
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.state_seq += 1;
        }
    }

    /// True if no session is established
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// True if the session is fully established
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// True if an orderly shutdown is in progress
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state == SessionState::Closing
    }

    /// True if the session missed its renewal window
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state == SessionState::Stale
    }

    /// True if the session is being evicted
    #[must_use]
    pub fn is_killing(&self) -> bool {
        self.state == SessionState::Killing
    }

    /// Index an in-flight request
    pub fn add_request(&mut self, reqid: u64) {
        self.requests.insert(reqid);
    }

    /// Drop an in-flight request
    pub fn remove_request(&mut self, reqid: u64) {
        self.requests.remove(&reqid);
    }

    /// Number of in-flight requests
    #[must_use]
    pub fn get_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Index a capability held by the client
    pub fn add_cap(&mut self, cap: u64) {
        self.caps.insert(cap);
    }

    /// Drop a capability
    pub fn remove_cap(&mut self, cap: u64) {
        self.caps.remove(&cap);
    }

    /// Number of capabilities held by the client
    #[must_use]
    pub fn cap_count(&self) -> usize {
        self.caps.len()
    }

    /// Record that a recall was sent asking the client to drop down to
    /// `new_limit` capabilities.
    ///
    /// Only the first recall of a phase is recorded; the phase ends once
    /// the client releases the requested number of caps. Precondition:
    /// `new_limit < cap_count()`.
    pub fn notify_recall_sent(&mut self, new_limit: usize, now: SystemTime) {
        if self.recalled_at.is_none() {
            assert!(new_limit < self.caps.len());
            self.recalled_at = Some(now);
            self.recall_count = self.caps.len() - new_limit;
            self.recall_release_count = 0;
        }
    }

    /// Record that the client released `n_caps` capabilities
    pub fn notify_cap_release(&mut self, n_caps: usize) {
        if self.recalled_at.is_some() {
            self.recall_release_count += n_caps;
            if self.recall_release_count >= self.recall_count {
                self.recalled_at = None;
                self.recall_count = 0;
                self.recall_release_count = 0;
            }
        }
    }

    /// When the current recall phase began, if one is active
    #[must_use]
    pub fn recalled_at(&self) -> Option<SystemTime> {
        self.recalled_at
    }

    /// Caps the client was asked to release in the current recall phase
    #[must_use]
    pub fn recall_count(&self) -> usize {
        self.recall_count
    }

    /// Caps released so far in the current recall phase
    #[must_use]
    pub fn recall_release_count(&self) -> usize {
        self.recall_release_count
    }

    /// Record a completed request the client may replay
    pub fn add_completed_request(&mut self, tid: u64) {
        self.info.completed_requests.insert(tid);
    }

    /// True if `tid` completed and is still tracked
    #[must_use]
    pub fn have_completed_request(&self, tid: u64) -> bool {
        self.info.completed_requests.contains(&tid)
    }

    /// Drop completed-request tracking below `min_tid`; `0` drops all of it
    pub fn trim_completed_requests(&mut self, min_tid: u64) {
        if min_tid == 0 {
            self.info.completed_requests.clear();
        } else {
            self.info.completed_requests = self.info.completed_requests.split_off(&min_tid);
        }
    }

    /// Replace the client metadata and refresh the presentation name
    pub fn set_client_metadata(&mut self, meta: BTreeMap<String, String>) {
        self.info.client_metadata = meta;
        self.update_human_name();
    }

    /// Decode a persisted payload into this session, keeping its identity
    pub fn decode(&mut self, d: &mut Decoder<'_>) -> Result<()> {
        self.info = SessionInfo::decode(d)?;
        self.update_human_name();
        Ok(())
    }

    pub(crate) fn push_projected_version(&mut self, pv: u64) {
        debug_assert!(self.projected_versions.back() != Some(&pv));
        self.projected_versions.push_back(pv);
    }

    pub(crate) fn pop_projected_version(&mut self, v: u64) {
        if let Some(front) = self.projected_versions.pop_front() {
            debug_assert!(front <= v);
        }
    }

    /// Presentation name derived from client metadata
    ///
    /// Not unique; machine consumers must key on the entity name instead.
    #[must_use]
    pub fn human_name(&self) -> &str {
        &self.human_name
    }

    fn update_human_name(&mut self) {
        if let Some(hostname) = self.info.client_metadata.get("hostname") {
            let mut name = hostname.clone();
            if let Some(entity_id) = self.info.client_metadata.get("entity_id") {
                if !entity_id_is_default(entity_id) {
                    name.push(':');
                    name.push_str(entity_id);
                }
            }
            self.human_name = name;
        } else {
            self.human_name = self.info.inst.name.id().to_string();
        }
    }

    /// Structured debug view
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        json!({
            "entity": self.info.inst.name.to_string(),
            "state": self.state_name(),
            "human_name": self.human_name,
            "info": self.info.dump(),
        })
    }
}

/// The id every client keyring carries unless the operator set one
fn entity_id_is_default(id: &str) -> bool {
    id.is_empty() || id == "admin"
}
