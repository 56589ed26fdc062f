//! Pure index and codec for the session table
//!
//! [`SessionMapStore`] holds the versioned session index and knows how to
//! move it to and from its persisted representations. It performs no I/O;
//! the live map layers durability on top.
//!
//! Two representations exist on disk:
//! - the current one: an OMAP header carrying the map version, plus one
//!   OMAP entry per session keyed by the textual entity name;
//! - a legacy one: the whole map serialized into the object's byte
//!   payload, in one of two historical layouts.

use crate::session::{Session, SessionInfo, SessionState};
use bytes::{BufMut, Bytes, BytesMut};
use metafs_common::encoding::{self, Decoder};
use metafs_common::types::{EntityInst, EntityName};
use metafs_common::{Error, Result};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tracing::{debug, error};

const HEADER_STRUCT_V: u8 = 1;
const HEADER_COMPAT_V: u8 = 1;

/// Sentinel first word marking the newer of the two legacy layouts
const LEGACY_SENTINEL: u64 = u64::MAX;
/// Newest legacy structure version this decoder understands
const LEGACY_STRUCT_V: u8 = 3;

/// Versioned in-memory session index plus persistence codec
#[derive(Default)]
pub struct SessionMapStore {
    pub(crate) version: u64,
    pub(crate) sessions: HashMap<EntityName, Session>,
}

impl SessionMapStore {
    /// Create an empty store at version 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current map version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, name: &EntityName) -> Option<&Session> {
        self.sessions.get(name)
    }

    /// Look up a session mutably
    pub fn get_mut(&mut self, name: &EntityName) -> Option<&mut Session> {
        self.sessions.get_mut(name)
    }

    /// Fetch the session for `inst`, creating a closed one if absent
    pub fn get_or_add_session(&mut self, inst: EntityInst) -> &mut Session {
        self.sessions
            .entry(inst.name)
            .or_insert_with(|| Session::new(SessionInfo::new(inst)))
    }

    /// Encode the OMAP header
    pub fn encode_header(&self, buf: &mut BytesMut) {
        encoding::encode_frame(buf, HEADER_STRUCT_V, HEADER_COMPAT_V, |b| {
            b.put_u64_le(self.version);
        });
    }

    /// Decode the OMAP header, setting the map version
    pub fn decode_header(&mut self, header: &[u8]) -> Result<()> {
        let mut d = Decoder::new(header);
        let frame = d.begin_frame(HEADER_STRUCT_V)?;
        self.version = d.get_u64()?;
        d.finish_frame(&frame)
    }

    /// Decode and insert a batch of OMAP entries
    ///
    /// Call repeatedly while loading; each batch upserts into the index.
    /// New sessions that are still closed are promoted to open, since only
    /// live sessions are ever persisted.
    pub fn decode_values(&mut self, values: &BTreeMap<String, Bytes>) -> Result<()> {
        for (key, value) in values {
            let name: EntityName = key.parse().map_err(|_| {
                error!(%key, "corrupt entity name in session map");
                Error::decode(format!("corrupt entity name '{key}' in session map"))
            })?;

            let session = self.get_or_add_session(EntityInst::unaddressed(name));
            if session.is_closed() {
                session.set_state(SessionState::Open);
            }
            let mut d = Decoder::new(value);
            session.decode(&mut d)?;
        }
        Ok(())
    }

    /// Decode a legacy byte-payload image
    ///
    /// The first word discriminates the layout: the sentinel introduces a
    /// versioned frame of `(name, info)` records; anything else *is* the
    /// map version, followed by a count and bare info records. Every
    /// reconstructed session has its lease renewal stamped to `now`.
    pub fn decode_legacy(&mut self, d: &mut Decoder<'_>, now: SystemTime) -> Result<()> {
        let first = d.get_u64()?;
        if first == LEGACY_SENTINEL {
            let frame = d.begin_frame(LEGACY_STRUCT_V)?;
            if frame.struct_v() < 2 {
                return Err(Error::decode(format!(
                    "legacy session map v{} is older than supported",
                    frame.struct_v()
                )));
            }

            self.version = d.get_u64()?;
            while d.position() < frame.end() {
                let name = EntityName::decode(d)?;
                let session = self.get_or_add_session(EntityInst::unaddressed(name));
                if session.is_closed() {
                    session.set_state(SessionState::Open);
                }
                session.decode(d)?;
                session.last_cap_renew = Some(now);
            }
            d.finish_frame(&frame)
        } else {
            // Oldest layout: the count that follows is an upper bound only.
            self.version = first;
            let n = d.get_u32()?;
            for _ in 0..n {
                if d.is_end() {
                    break;
                }
                let record_start = d.position();
                let info = SessionInfo::decode(d)?;
                let name = info.inst.name;
                let session = if self.sessions.contains_key(&name) {
                    // A client reconnected before the old writer flushed;
                    // re-decode over the existing session so later record
                    // wins without disturbing its identity.
                    debug!(%name, "duplicate legacy session record, recovering");
                    d.seek(record_start);
                    let session = self.sessions.get_mut(&name).expect("session present");
                    session.decode(d)?;
                    session
                } else {
                    self.sessions.entry(name).or_insert_with(|| Session::new(info))
                };
                session.set_state(SessionState::Open);
                session.last_cap_renew = Some(now);
            }
            Ok(())
        }
    }

    /// Structured debug view of every session
    #[must_use]
    pub fn dump(&self) -> serde_json::Value {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.info.inst.name);
        json!({
            "version": self.version,
            "sessions": sessions.iter().map(|s| s.dump()).collect::<Vec<_>>(),
        })
    }

    /// Sample instances for encoding tests
    #[must_use]
    pub fn generate_test_instances() -> Vec<SessionMapStore> {
        let mut populated = SessionMapStore::new();
        populated.version = 9;
        for id in [1u64, 2] {
            let session = populated.get_or_add_session(EntityInst::unaddressed(
                EntityName::client(id),
            ));
            session.set_state(SessionState::Open);
        }
        vec![SessionMapStore::new(), populated]
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// Encode the newer legacy layout (sentinel + versioned frame)
    pub(crate) fn encode_legacy_framed(version: u64, sessions: &[(EntityName, SessionInfo)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(LEGACY_SENTINEL);
        encoding::encode_frame(&mut buf, LEGACY_STRUCT_V, LEGACY_STRUCT_V, |b| {
            b.put_u64_le(version);
            for (name, info) in sessions {
                name.encode(b);
                info.encode(b);
            }
        });
        buf.to_vec()
    }

    /// Encode the oldest legacy layout (bare version + count + records)
    pub(crate) fn encode_legacy_old(version: u64, count: u32, infos: &[SessionInfo]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(version);
        buf.put_u32_le(count);
        for info in infos {
            info.encode(&mut buf);
        }
        buf.to_vec()
    }
}
