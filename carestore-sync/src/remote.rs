//! Remote peer contract and conflict resolution policies
//!
//! A store talks to exactly one remote. The remote supplies revisions through a
//! [`RevisionSink`], accepts outgoing revisions, and decides how conflicting
//! versions are resolved while a merge is running.

use crate::entity::{Entity, EntityKind};
use crate::error::{SyncError, SyncResult};
use crate::knowledge::KnowledgeVector;
use crate::revision::RevisionRecord;
use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

/// What to do when a device version and a remote version conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Keep the version already on this device and drop the incoming one
    KeepDevice,
    /// Replace the device version with the incoming one
    KeepRemote,
    /// Abandon the whole merge; nothing from the revision is applied
    AbortMerge,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::KeepDevice => "keepDevice",
            ConflictPolicy::KeepRemote => "keepRemote",
            ConflictPolicy::AbortMerge => "abortMerge",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "keepDevice" => Ok(ConflictPolicy::KeepDevice),
            "keepRemote" => Ok(ConflictPolicy::KeepRemote),
            "abortMerge" => Ok(ConflictPolicy::AbortMerge),
            _ => Err(SyncError::InvalidValue(format!(
                "Unknown conflict policy: {}",
                s
            ))),
        }
    }
}

/// The two versions that could not both be kept. Both have the same kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDescriptor {
    device: Entity,
    remote: Entity,
}

impl ConflictDescriptor {
    pub fn new(device: Entity, remote: Entity) -> SyncResult<Self> {
        if device.kind() != remote.kind() {
            return Err(SyncError::InvalidValue(format!(
                "Conflicting versions must share a kind, got {} and {}",
                device.kind(),
                remote.kind()
            )));
        }

        Ok(Self { device, remote })
    }

    pub fn kind(&self) -> EntityKind {
        self.device.kind()
    }

    /// The version currently stored on this device
    pub fn device(&self) -> &Entity {
        &self.device
    }

    /// The version delivered by the remote
    pub fn remote(&self) -> &Entity {
        &self.remote
    }
}

// Wire shape: {"entity": <kind>, "device": {...}, "remote": {...}}

impl Serialize for ConflictDescriptor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ConflictDescriptor", 3)?;
        state.serialize_field("entity", &self.kind())?;
        state.serialize_field("device", &crate::entity::EntityValue(&self.device))?;
        state.serialize_field("remote", &crate::entity::EntityValue(&self.remote))?;
        state.end()
    }
}

#[derive(Deserialize)]
struct WireDescriptor {
    entity: EntityKind,
    device: serde_json::Value,
    remote: serde_json::Value,
}

impl<'de> Deserialize<'de> for ConflictDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireDescriptor::deserialize(deserializer)?;
        let device = Entity::from_value(wire.entity, wire.device).map_err(de::Error::custom)?;
        let remote = Entity::from_value(wire.entity, wire.remote).map_err(de::Error::custom)?;
        ConflictDescriptor::new(device, remote).map_err(de::Error::custom)
    }
}

/// Decides how a merge conflict is resolved
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn choose_conflict_resolution_policy(
        &self,
        descriptor: &ConflictDescriptor,
    ) -> ConflictPolicy;
}

/// A fixed policy applied to every conflict
#[async_trait]
impl ConflictResolver for ConflictPolicy {
    async fn choose_conflict_resolution_policy(
        &self,
        _descriptor: &ConflictDescriptor,
    ) -> ConflictPolicy {
        *self
    }
}

/// Keeps whichever version was created last. Ties keep the device version.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

#[async_trait]
impl ConflictResolver for LastWriteWins {
    async fn choose_conflict_resolution_policy(
        &self,
        descriptor: &ConflictDescriptor,
    ) -> ConflictPolicy {
        let written = |entity: &Entity| entity.created_date().or_else(|| entity.updated_date());

        if written(descriptor.remote()) > written(descriptor.device()) {
            ConflictPolicy::KeepRemote
        } else {
            ConflictPolicy::KeepDevice
        }
    }
}

/// Receives revision records while a pull is in progress.
///
/// Returning an error tells the remote that the batch was not applied. The
/// remote may stop delivering further batches.
#[async_trait]
pub trait RevisionSink: Send {
    async fn merge(&mut self, record: RevisionRecord) -> SyncResult<()>;
}

/// The other side of a synchronization
#[async_trait]
pub trait RemotePeer: ConflictResolver {
    /// Deliver every revision the remote has that `since` has not seen.
    ///
    /// Batches go through `sink` one at a time, each carrying the remote's
    /// knowledge. The call completes once all batches were delivered.
    async fn pull_revisions(
        &self,
        since: &KnowledgeVector,
        sink: &mut dyn RevisionSink,
    ) -> SyncResult<()>;

    /// Send a revision to the remote. With `overwrite` the remote replaces its
    /// content instead of merging.
    async fn push_revisions(&self, delta: RevisionRecord, overwrite: bool) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Outcome, Task};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn task_created(minutes_ago: i64) -> Entity {
        let mut task = Task::new("walk", Some("Walk 20 minutes".to_string()), None);
        task.version.uuid = Some(Uuid::new_v4());
        task.version.created_date = Some(Utc::now() - Duration::minutes(minutes_ago));
        task.version.updated_date = task.version.created_date;
        task.into()
    }

    #[test]
    fn test_policy_conversion() {
        assert_eq!(ConflictPolicy::KeepRemote.as_str(), "keepRemote");
        assert_eq!(
            ConflictPolicy::from_str("abortMerge").unwrap(),
            ConflictPolicy::AbortMerge
        );
        assert!(ConflictPolicy::from_str("accept_local").is_err());
        assert_eq!(
            serde_json::to_value(ConflictPolicy::KeepDevice).unwrap(),
            "keepDevice"
        );
    }

    #[test]
    fn test_descriptor_requires_same_kind() {
        let outcome = Entity::from(Outcome::new(Uuid::new_v4(), 0, vec![]));
        let result = ConflictDescriptor::new(task_created(1), outcome);
        assert!(matches!(result, Err(SyncError::InvalidValue(_))));
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let descriptor = ConflictDescriptor::new(task_created(5), task_created(1)).unwrap();
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["entity"], "task");
        assert_eq!(json["device"]["id"], "walk");
        assert_eq!(json["remote"]["title"], "Walk 20 minutes");

        let decoded: ConflictDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[tokio::test]
    async fn test_fixed_policy_resolver() {
        let descriptor = ConflictDescriptor::new(task_created(5), task_created(1)).unwrap();
        let policy = ConflictPolicy::AbortMerge
            .choose_conflict_resolution_policy(&descriptor)
            .await;
        assert_eq!(policy, ConflictPolicy::AbortMerge);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let older = task_created(10);
        let newer = task_created(1);

        let remote_newer = ConflictDescriptor::new(older.clone(), newer.clone()).unwrap();
        assert_eq!(
            LastWriteWins
                .choose_conflict_resolution_policy(&remote_newer)
                .await,
            ConflictPolicy::KeepRemote
        );

        let device_newer = ConflictDescriptor::new(newer, older).unwrap();
        assert_eq!(
            LastWriteWins
                .choose_conflict_resolution_policy(&device_newer)
                .await,
            ConflictPolicy::KeepDevice
        );
    }
}
