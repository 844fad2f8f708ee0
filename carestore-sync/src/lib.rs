//! Peer-to-peer synchronization for versioned care records
//!
//! Provides:
//! - Knowledge vectors for causality tracking between devices
//! - A versioned record store with transactional edits and SQLite persistence
//! - Revision computation and a merge engine with pluggable conflict resolution
//! - Synchronization against one remote peer with merge, force-push and
//!   force-pull policies
//! - A JSON message peer for connecting stores over any request/reply transport

pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod knowledge;
mod merge;
pub mod peer;
pub mod remote;
pub mod revision;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::{DatabaseConfig, StoreConfig};
pub use database::LocalDatabase;
pub use entity::{
    CarePlan, Contact, Entity, EntityKind, Outcome, OutcomeValue, OutcomeValueType, Patient,
    PersonName, Task, VersionInfo,
};
pub use error::{SyncError, SyncResult};
pub use knowledge::KnowledgeVector;
pub use peer::{reply_to, LoopbackTransport, MessagePeer, PeerMessage, PeerReply, PeerTransport};
pub use remote::{
    ConflictDescriptor, ConflictPolicy, ConflictResolver, LastWriteWins, RemotePeer, RevisionSink,
};
pub use revision::RevisionRecord;
pub use store::{CareStore, StoreState, StoredEntity};
pub use sync::{SyncStats, SyncStatus, SynchronizationPolicy};
pub use telemetry::{init_tracing, LogFormat};
