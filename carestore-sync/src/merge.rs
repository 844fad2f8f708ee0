//! Merge engine: applies a remote revision to the local store
//!
//! A merge runs as one transaction. Every incoming version is either stored,
//! skipped, or handed to the conflict resolver when the device holds a version
//! the author of the revision had not seen. The whole merge rolls back when the
//! resolver aborts or any step fails.

use crate::entity::{Entity, EntityKind, Outcome};
use crate::error::{SyncError, SyncResult};
use crate::remote::{ConflictDescriptor, ConflictPolicy, ConflictResolver};
use crate::revision::RevisionRecord;
use crate::store::{CareStore, Transaction};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

impl CareStore {
    /// Merge a revision received from a peer.
    ///
    /// On success the record's knowledge is folded into the local vector and
    /// the local clock advances by one. On failure nothing changes.
    pub async fn merge_revision<R>(&self, record: &RevisionRecord, resolver: &R) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        self.merge_into(record, resolver, false).await
    }

    /// Drop all content and knowledge, then merge `record` into the empty
    /// store. Both steps commit together.
    pub async fn replace_with_revision<R>(
        &self,
        record: &RevisionRecord,
        resolver: &R,
    ) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        self.merge_into(record, resolver, true).await
    }

    async fn merge_into<R>(&self, record: &RevisionRecord, resolver: &R, reset: bool) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);
        if reset {
            txn.reset();
        }

        let local_since = record.knowledge_vector.clock(self.device_id());
        let mut merge = Merge {
            txn,
            local_since,
            observed: record.entities.iter().filter_map(Entity::uuid).collect(),
            rejected: HashSet::new(),
            applied: 0,
            conflicts: 0,
        };

        for entity in &record.entities {
            merge.apply(entity, resolver).await?;
        }

        let Merge {
            mut txn,
            applied,
            conflicts,
            ..
        } = merge;
        txn.merge_knowledge(&record.knowledge_vector);
        txn.increment_clock();
        let clock = txn.state().clock_time();
        self.commit(txn).await?;

        info!(
            device_id = %self.device_id(),
            replaced = reset,
            received = record.len(),
            applied = applied,
            conflicts = conflicts,
            clock = clock,
            "Merged revision"
        );
        Ok(())
    }
}

struct Merge<'a> {
    txn: Transaction<'a>,
    /// Local clock the author of the revision had already seen
    local_since: u64,
    /// Versions the author of the revision holds; they never conflict
    observed: HashSet<Uuid>,
    /// Incoming versions dropped in favour of the device, with their descendants
    rejected: HashSet<Uuid>,
    applied: usize,
    conflicts: usize,
}

impl Merge<'_> {
    async fn apply<R>(&mut self, entity: &Entity, resolver: &R) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        let uuid = entity.uuid().ok_or_else(|| {
            SyncError::InvalidValue(format!(
                "Cannot merge a {} without a version uuid",
                entity.kind()
            ))
        })?;

        if self.txn.state().contains(uuid) {
            debug!(uuid = %uuid, kind = %entity.kind(), "Skipping known version");
            return Ok(());
        }

        match entity {
            Entity::Outcome(outcome) => self.apply_outcome(entity, outcome, resolver).await,
            _ => self.apply_version(entity, resolver).await,
        }
    }

    /// Versions written here that the revision's author has not seen
    fn unseen_local_versions(&self) -> impl Iterator<Item = &Entity> {
        let observed = &self.observed;
        self.txn
            .state()
            .changed_since(self.local_since)
            .filter(move |local| local.uuid().map_or(false, |uuid| !observed.contains(&uuid)))
    }

    async fn apply_version<R>(&mut self, entity: &Entity, resolver: &R) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        let previous = entity.previous_version_uuids();
        let Some(parent) = previous.first().copied() else {
            return self.insert(entity.clone());
        };

        if self.rejected.contains(&parent) {
            if let Some(uuid) = entity.uuid() {
                self.rejected.insert(uuid);
            }
            debug!(
                parent = %parent,
                uuid = ?entity.uuid(),
                "Skipping version built on a rejected fork"
            );
            return Ok(());
        }

        let fork = self
            .unseen_local_versions()
            .find(|local| {
                local.kind() == entity.kind()
                    && local.logical_id() == entity.logical_id()
                    && local.previous_version_uuids() == previous
                    && local.uuid() != entity.uuid()
            })
            .cloned();

        if let Some(local) = fork {
            return self.resolve(local, entity, resolver).await;
        }

        if !self.txn.state().contains(parent) {
            return Err(SyncError::Fetch(format!(
                "Parent version {} of {} '{}' is not in the store",
                parent,
                entity.kind(),
                entity.logical_id().unwrap_or_default()
            )));
        }

        let stale = self.txn.state().next_versions(parent);
        for next in stale {
            let removed = self.txn.remove_cascading(next);
            debug!(parent = %parent, replaced = %next, removed = removed, "Replacing stale versions");
        }

        self.insert(entity.clone())
    }

    async fn apply_outcome<R>(
        &mut self,
        entity: &Entity,
        outcome: &Outcome,
        resolver: &R,
    ) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        let slot = outcome.slot();
        let conflicting = self
            .unseen_local_versions()
            .filter_map(Entity::as_outcome)
            .filter(|local| local.slot() == slot && local.uuid != outcome.uuid)
            .max_by(|a, b| {
                a.updated_date
                    .cmp(&b.updated_date)
                    .then_with(|| a.uuid.cmp(&b.uuid))
            })
            .cloned();

        if let Some(local) = conflicting {
            return self.resolve(local.into(), entity, resolver).await;
        }

        let has_task = self
            .txn
            .state()
            .get(outcome.task_uuid)
            .map_or(false, |stored| stored.value.kind() == EntityKind::Task);
        if !has_task {
            debug!(
                task_uuid = %outcome.task_uuid,
                index = outcome.task_occurrence_index,
                "Dropping outcome for a task version that is not in the store"
            );
            return Ok(());
        }

        let superseded_at = outcome
            .created_date
            .or(outcome.updated_date)
            .unwrap_or_else(Utc::now);
        let live: Vec<Outcome> = self
            .txn
            .state()
            .outcomes_in_slot(slot)
            .filter(|existing| existing.deleted_date.is_none())
            .cloned()
            .collect();
        for mut existing in live {
            existing.deleted_date = Some(superseded_at);
            self.txn.replace(existing.into())?;
        }

        self.insert(entity.clone())
    }

    async fn resolve<R>(&mut self, device: Entity, remote: &Entity, resolver: &R) -> SyncResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        self.conflicts += 1;
        let descriptor = ConflictDescriptor::new(device, remote.clone())?;
        let policy = resolver.choose_conflict_resolution_policy(&descriptor).await;

        info!(
            kind = %descriptor.kind(),
            device = ?descriptor.device().uuid(),
            remote = ?remote.uuid(),
            policy = policy.as_str(),
            "Resolved merge conflict"
        );

        match policy {
            ConflictPolicy::KeepDevice => {
                if let Some(uuid) = remote.uuid() {
                    self.rejected.insert(uuid);
                }
                Ok(())
            }
            ConflictPolicy::KeepRemote => {
                if let Some(local) = descriptor.device().uuid() {
                    self.txn.remove_cascading(local);
                }
                self.insert(remote.clone())
            }
            ConflictPolicy::AbortMerge => {
                let local = descriptor.device();
                Err(SyncError::Aborted {
                    kind: local.kind(),
                    id: record_label(local),
                    uuid: local.uuid().unwrap_or_default(),
                })
            }
        }
    }

    fn insert(&mut self, entity: Entity) -> SyncResult<()> {
        self.txn.insert(entity)?;
        self.applied += 1;
        Ok(())
    }
}

/// Logical id for chained records, `<task uuid>#<occurrence>` for outcomes
fn record_label(entity: &Entity) -> String {
    match entity {
        Entity::Outcome(outcome) => {
            format!("{}#{}", outcome.task_uuid, outcome.task_occurrence_index)
        }
        other => other.logical_id().unwrap_or_default().to_string(),
    }
}
