//! MetaFS MDS - the metadata server's session table
//!
//! Each MDS rank owns one [`SessionMap`]: the authoritative, durable table
//! of client sessions, persisted as a single object in the metadata pool.
//! The daemon drives it from its serialized event context: `load` at
//! startup, mutations as clients come and go, `save` on journal segment
//! commit.

pub mod session;
pub mod sessionmap;

pub use session::{Session, SessionInfo, SessionState};
pub use sessionmap::store::SessionMapStore;
pub use sessionmap::{Completion, SessionMap};
