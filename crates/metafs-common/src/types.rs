//! Core type definitions for MetaFS
//!
//! This module defines the fundamental identity types used throughout the
//! system: cluster entities, their network instances, and MDS ranks.

use crate::encoding::Decoder;
use crate::error::Result;
use bytes::{BufMut, BytesMut};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Kind of a cluster entity
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Debug,
)]
pub enum EntityKind {
    /// Monitor daemon
    #[display("mon")]
    Mon,
    /// Metadata server daemon
    #[display("mds")]
    Mds,
    /// Object storage daemon
    #[display("osd")]
    Osd,
    /// File system client
    #[display("client")]
    Client,
}

impl EntityKind {
    /// Wire representation (stable, do not renumber)
    #[must_use]
    pub const fn to_wire(self) -> u32 {
        match self {
            Self::Mon => 0x01,
            Self::Mds => 0x02,
            Self::Osd => 0x04,
            Self::Client => 0x08,
        }
    }

    /// Decode the wire representation
    #[must_use]
    pub const fn from_wire(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(Self::Mon),
            0x02 => Some(Self::Mds),
            0x04 => Some(Self::Osd),
            0x08 => Some(Self::Client),
            _ => None,
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "mon" => Some(Self::Mon),
            "mds" => Some(Self::Mds),
            "osd" => Some(Self::Osd),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Stable identity of a cluster entity: kind plus numeric id
///
/// The textual form is `{kind}.{id}`, e.g. `client.4567`. It is used as the
/// OMAP key of persisted sessions, so both directions must stay stable.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{kind}.{id}")]
pub struct EntityName {
    kind: EntityKind,
    id: u64,
}

impl EntityName {
    /// Create an entity name
    #[must_use]
    pub const fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }

    /// Shorthand for a client entity
    #[must_use]
    pub const fn client(id: u64) -> Self {
        Self::new(EntityKind::Client, id)
    }

    /// Shorthand for an MDS entity
    #[must_use]
    pub const fn mds(id: u64) -> Self {
        Self::new(EntityKind::Mds, id)
    }

    /// Entity kind
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Numeric id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Append the wire representation to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.kind.to_wire());
        buf.put_u64_le(self.id);
    }

    /// Decode the wire representation
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let kind = d.get_u32()?;
        let kind = EntityKind::from_wire(kind)
            .ok_or_else(|| crate::Error::decode(format!("unknown entity kind {kind:#x}")))?;
        let id = d.get_u64()?;
        Ok(Self { kind, id })
    }
}

impl fmt::Debug for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityName({self})")
    }
}

impl FromStr for EntityName {
    type Err = EntityNameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (prefix, id) = s.split_once('.').ok_or(EntityNameError::MissingSeparator)?;
        let kind =
            EntityKind::from_prefix(prefix).ok_or_else(|| EntityNameError::UnknownKind(prefix.to_string()))?;
        let id = id
            .parse::<u64>()
            .map_err(|_| EntityNameError::InvalidId(id.to_string()))?;
        Ok(Self { kind, id })
    }
}

/// Errors that can occur when parsing an entity name
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntityNameError {
    #[error("entity name must be '<kind>.<id>'")]
    MissingSeparator,
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),
    #[error("invalid entity id: {0}")]
    InvalidId(String),
}

/// Entity identity plus its current network address
///
/// The name is immutable for the lifetime of a session; the address changes
/// when a client reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInst {
    /// Stable identity
    pub name: EntityName,
    /// Last known address
    pub addr: SocketAddr,
}

impl EntityInst {
    /// Create an instance
    #[must_use]
    pub const fn new(name: EntityName, addr: SocketAddr) -> Self {
        Self { name, addr }
    }

    /// Instance with an unspecified address, used while decoding records
    /// keyed by name only
    #[must_use]
    pub const fn unaddressed(name: EntityName) -> Self {
        Self {
            name,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    /// Append the wire representation to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        crate::encoding::put_string(buf, &self.addr.to_string());
    }

    /// Decode the wire representation
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let name = EntityName::decode(d)?;
        let addr = d.get_string()?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| crate::Error::decode(format!("invalid entity address '{addr}'")))?;
        Ok(Self { name, addr })
    }
}

impl fmt::Display for EntityInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.addr)
    }
}

/// One logical metadata-server shard
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct RankId(pub i32);

impl fmt::Debug for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RankId({})", self.0)
    }
}
