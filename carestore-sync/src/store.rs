//! The care store: entity arena, transactions and the revision computer
//!
//! All entity versions live in one arena keyed by version uuid. Each stored
//! version carries the local clock value at which it was written here, which is
//! what the revision computer filters on. Every mutation runs inside a
//! [`Transaction`] that holds the state lock and rolls back unless committed.

use crate::config::StoreConfig;
use crate::database::LocalDatabase;
use crate::entity::{Entity, EntityKind, Outcome};
use crate::error::{SyncError, SyncResult};
use crate::knowledge::KnowledgeVector;
use crate::remote::RemotePeer;
use crate::revision::RevisionRecord;
use crate::sync::SyncStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// A version held by the store together with its local write clock
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub value: Entity,
    /// Local clock value when this version was last written on this device
    pub clock: u64,
}

/// Everything guarded by the store lock.
///
/// The lookup indexes next to the arena are only written through `put` and
/// `take`.
#[derive(Debug)]
pub struct StoreState {
    device_id: Uuid,
    knowledge: KnowledgeVector,
    entities: HashMap<Uuid, StoredEntity>,
    children: HashMap<Uuid, HashSet<Uuid>>,
    lineages: HashMap<(EntityKind, String), HashSet<Uuid>>,
    task_outcomes: HashMap<Uuid, HashSet<Uuid>>,
    pub(crate) sync_status: SyncStatus,
}

impl StoreState {
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            knowledge: KnowledgeVector::new(),
            entities: HashMap::new(),
            children: HashMap::new(),
            lineages: HashMap::new(),
            task_outcomes: HashMap::new(),
            sync_status: SyncStatus::Idle,
        }
    }

    pub(crate) fn restore(
        device_id: Uuid,
        knowledge: KnowledgeVector,
        entities: Vec<StoredEntity>,
    ) -> SyncResult<Self> {
        let mut state = Self::new(device_id);
        state.knowledge = knowledge;
        for stored in entities {
            let uuid = stored.value.uuid().ok_or_else(|| {
                SyncError::InvalidValue("Persisted entity has no version uuid".to_string())
            })?;
            state.put(uuid, stored);
        }
        Ok(state)
    }

    /// Store a version under `uuid`, returning the one it replaced
    fn put(&mut self, uuid: Uuid, stored: StoredEntity) -> Option<StoredEntity> {
        let previous = self.entities.insert(uuid, stored);
        if let Some(previous) = &previous {
            self.unindex(uuid, &previous.value);
        }
        self.index(uuid);
        previous
    }

    fn take(&mut self, uuid: Uuid) -> Option<StoredEntity> {
        let removed = self.entities.remove(&uuid)?;
        self.unindex(uuid, &removed.value);
        Some(removed)
    }

    fn index(&mut self, uuid: Uuid) {
        let Some(stored) = self.entities.get(&uuid) else {
            return;
        };
        let parent = stored.value.version().and_then(|v| v.parent());
        let lineage = stored
            .value
            .logical_id()
            .map(|id| (stored.value.kind(), id.to_string()));
        let task = stored.value.as_outcome().map(|outcome| outcome.task_uuid);

        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(uuid);
        }
        if let Some(lineage) = lineage {
            self.lineages.entry(lineage).or_default().insert(uuid);
        }
        if let Some(task) = task {
            self.task_outcomes.entry(task).or_default().insert(uuid);
        }
    }

    fn unindex(&mut self, uuid: Uuid, entity: &Entity) {
        if let Some(parent) = entity.version().and_then(|v| v.parent()) {
            detach(&mut self.children, &parent, uuid);
        }
        if let Some(id) = entity.logical_id() {
            detach(&mut self.lineages, &(entity.kind(), id.to_string()), uuid);
        }
        if let Some(outcome) = entity.as_outcome() {
            detach(&mut self.task_outcomes, &outcome.task_uuid, uuid);
        }
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn knowledge_vector(&self) -> &KnowledgeVector {
        &self.knowledge
    }

    /// This device's own entry in its knowledge vector
    pub fn clock_time(&self) -> u64 {
        self.knowledge.clock(self.device_id)
    }

    pub fn get(&self, uuid: Uuid) -> Option<&StoredEntity> {
        self.entities.get(&uuid)
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.entities.contains_key(&uuid)
    }

    pub fn entities(&self) -> impl Iterator<Item = &StoredEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Versions written here at or after local clock `since`
    pub fn changed_since(&self, since: u64) -> impl Iterator<Item = &Entity> {
        self.entities
            .values()
            .filter(move |stored| stored.clock >= since)
            .map(|stored| &stored.value)
    }

    /// Build the revision of everything written at or after `since`.
    ///
    /// Tombstones come first, then live versions. Each group is ordered by
    /// updated date with the version uuid breaking ties.
    pub fn compute_revision(&self, since: u64) -> RevisionRecord {
        let (mut tombstones, mut live): (Vec<&Entity>, Vec<&Entity>) =
            self.changed_since(since).partition(|e| e.is_tombstone());

        let order = |a: &&Entity, b: &&Entity| {
            a.updated_date()
                .cmp(&b.updated_date())
                .then_with(|| a.uuid().cmp(&b.uuid()))
        };
        tombstones.sort_by(order);
        live.sort_by(order);

        let entities = tombstones.into_iter().chain(live).cloned().collect();
        RevisionRecord::new(entities, self.knowledge.clone())
    }

    /// Versions whose parent is `uuid`
    pub fn next_versions(&self, uuid: Uuid) -> Vec<Uuid> {
        self.children
            .get(&uuid)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Logical ids of every record of `kind`, tombstoned ones included
    pub fn logical_ids(&self, kind: EntityKind) -> impl Iterator<Item = &str> {
        self.lineages
            .keys()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
    }

    /// The newest version of a logical record that nothing has replaced yet
    pub fn tip(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        let versions: Vec<&Entity> = self
            .lineages
            .get(&(kind, id.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|uuid| self.entities.get(uuid))
            .map(|stored| &stored.value)
            .collect();

        let replaced: HashSet<Uuid> = versions
            .iter()
            .flat_map(|e| e.previous_version_uuids().iter().copied())
            .collect();

        versions
            .into_iter()
            .filter(|e| e.uuid().map_or(false, |uuid| !replaced.contains(&uuid)))
            .max_by(|a, b| {
                a.updated_date()
                    .cmp(&b.updated_date())
                    .then_with(|| a.uuid().cmp(&b.uuid()))
            })
    }

    /// Outcomes recorded against a task version, tombstones included
    pub fn outcomes_of(&self, task_uuid: Uuid) -> impl Iterator<Item = &Outcome> {
        self.task_outcomes
            .get(&task_uuid)
            .into_iter()
            .flatten()
            .filter_map(move |uuid| self.entities.get(uuid))
            .filter_map(|stored| stored.value.as_outcome())
    }

    /// Outcomes stored for a slot, tombstones included
    pub fn outcomes_in_slot(&self, slot: (Uuid, u32)) -> impl Iterator<Item = &Outcome> {
        self.outcomes_of(slot.0)
            .filter(move |outcome| outcome.slot() == slot)
    }

    pub fn live_outcome_in_slot(&self, slot: (Uuid, u32)) -> Option<&Outcome> {
        self.outcomes_in_slot(slot)
            .find(|outcome| outcome.deleted_date.is_none())
    }

    /// Walk parent links from `uuid` back to the first version
    pub fn version_history(&self, uuid: Uuid) -> SyncResult<Vec<Entity>> {
        let mut history = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(uuid);

        while let Some(current) = cursor {
            if !visited.insert(current) {
                return Err(SyncError::InvalidValue(format!(
                    "Version chain through {} contains a cycle",
                    current
                )));
            }
            let Some(stored) = self.entities.get(&current) else {
                if history.is_empty() {
                    return Err(SyncError::NotFound(format!("Version {}", uuid)));
                }
                break;
            };
            history.push(stored.value.clone());
            cursor = stored.value.version().and_then(|v| v.parent());
        }

        Ok(history)
    }
}

fn detach<K: std::hash::Hash + Eq>(index: &mut HashMap<K, HashSet<Uuid>>, key: &K, uuid: Uuid) {
    if let Some(members) = index.get_mut(key) {
        members.remove(&uuid);
        if members.is_empty() {
            index.remove(key);
        }
    }
}

/// What a committed transaction touched, for persistence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// All previous content was dropped before `touched` was applied
    pub reset: bool,
    /// Version uuids written or removed
    pub touched: HashSet<Uuid>,
    pub knowledge_changed: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.touched.is_empty() && !self.knowledge_changed
    }
}

enum Undo {
    Inserted(Uuid),
    Replaced(Uuid, StoredEntity),
    Removed(Uuid, StoredEntity),
    Knowledge(KnowledgeVector),
}

/// An all-or-nothing set of changes to the store state.
///
/// Dropping a transaction without calling [`Transaction::commit`] restores
/// the state it started from.
pub(crate) struct Transaction<'a> {
    state: &'a mut StoreState,
    journal: Vec<Undo>,
    changes: ChangeSet,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(state: &'a mut StoreState) -> Self {
        Self {
            state,
            journal: Vec::new(),
            changes: ChangeSet::default(),
            committed: false,
        }
    }

    pub fn state(&self) -> &StoreState {
        self.state
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Store a new version, written at the current local clock
    pub fn insert(&mut self, value: Entity) -> SyncResult<Uuid> {
        let uuid = value.uuid().ok_or_else(|| {
            SyncError::InvalidValue(format!("{} without a version uuid", value.kind()))
        })?;
        if self.state.contains(uuid) {
            return Err(SyncError::InvalidOperation(format!(
                "Version {} already exists",
                uuid
            )));
        }

        let clock = self.state.clock_time();
        self.state.put(uuid, StoredEntity { value, clock });
        self.journal.push(Undo::Inserted(uuid));
        self.changes.touched.insert(uuid);
        Ok(uuid)
    }

    /// Overwrite an existing version in place and move its clock forward
    pub fn replace(&mut self, value: Entity) -> SyncResult<()> {
        let uuid = value.uuid().ok_or_else(|| {
            SyncError::InvalidValue(format!("{} without a version uuid", value.kind()))
        })?;
        if !self.state.contains(uuid) {
            return Err(SyncError::NotFound(format!("Version {}", uuid)));
        }

        let clock = self.state.clock_time();
        if let Some(previous) = self.state.put(uuid, StoredEntity { value, clock }) {
            self.journal.push(Undo::Replaced(uuid, previous));
        }
        self.changes.touched.insert(uuid);
        Ok(())
    }

    pub fn remove(&mut self, uuid: Uuid) -> Option<Entity> {
        let removed = self.state.take(uuid)?;
        let value = removed.value.clone();
        self.journal.push(Undo::Removed(uuid, removed));
        self.changes.touched.insert(uuid);
        Some(value)
    }

    /// Remove a version and everything that descends from it. Outcomes of
    /// removed task versions go with them.
    pub fn remove_cascading(&mut self, uuid: Uuid) -> usize {
        let mut worklist = vec![uuid];
        let mut removed = 0;

        while let Some(current) = worklist.pop() {
            let Some(entity) = self.remove(current) else {
                continue;
            };
            removed += 1;

            worklist.extend(self.state.next_versions(current));
            if entity.kind() == EntityKind::Task {
                let outcomes: Vec<Uuid> = self
                    .state
                    .outcomes_of(current)
                    .filter_map(|outcome| outcome.uuid)
                    .collect();
                worklist.extend(outcomes);
            }
        }

        removed
    }

    pub fn merge_knowledge(&mut self, other: &KnowledgeVector) {
        self.journal.push(Undo::Knowledge(self.state.knowledge.clone()));
        self.state.knowledge.merge(other);
        self.changes.knowledge_changed = true;
    }

    pub fn increment_clock(&mut self) {
        self.journal.push(Undo::Knowledge(self.state.knowledge.clone()));
        let device = self.state.device_id;
        self.state.knowledge.increment(device);
        self.changes.knowledge_changed = true;
    }

    /// Drop every version and forget all knowledge
    pub fn reset(&mut self) {
        let uuids: Vec<Uuid> = self.state.entities.keys().copied().collect();
        for uuid in uuids {
            self.remove(uuid);
        }
        self.journal.push(Undo::Knowledge(std::mem::take(&mut self.state.knowledge)));
        self.changes.reset = true;
        self.changes.touched.clear();
        self.changes.knowledge_changed = true;
    }

    pub fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Inserted(uuid) => {
                    self.state.take(uuid);
                }
                Undo::Replaced(uuid, previous) | Undo::Removed(uuid, previous) => {
                    self.state.put(uuid, previous);
                }
                Undo::Knowledge(previous) => self.state.knowledge = previous,
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.journal.is_empty() {
            debug!(undone = self.journal.len(), "Rolling back store transaction");
            self.rollback();
        }
    }
}

/// A local store of versioned care records that can synchronize with one remote
pub struct CareStore {
    config: StoreConfig,
    device_id: Uuid,
    pub(crate) state: Mutex<StoreState>,
    database: Option<LocalDatabase>,
    remote: RwLock<Option<Arc<dyn RemotePeer>>>,
    pub(crate) progress: watch::Sender<f64>,
}

impl CareStore {
    /// Open a store, loading persisted content when a database is configured
    pub async fn open(config: StoreConfig) -> SyncResult<Self> {
        let (state, database) = match &config.database {
            Some(db_config) => {
                let database = LocalDatabase::new(db_config).await?;
                let state = match database.load().await? {
                    Some(state) => {
                        if let Some(configured) = config.device_id {
                            if configured != state.device_id() {
                                return Err(SyncError::Configuration(format!(
                                    "Database at {} belongs to device {}, not {}",
                                    db_config.db_path,
                                    state.device_id(),
                                    configured
                                )));
                            }
                        }
                        state
                    }
                    None => {
                        let device_id = config.device_id.unwrap_or_else(Uuid::new_v4);
                        database.initialize_device(device_id).await?;
                        StoreState::new(device_id)
                    }
                };
                (state, Some(database))
            }
            None => (
                StoreState::new(config.device_id.unwrap_or_else(Uuid::new_v4)),
                None,
            ),
        };

        info!(
            store = %config.name,
            device_id = %state.device_id(),
            entities = state.len(),
            clock = state.clock_time(),
            persistent = database.is_some(),
            "Opened care store"
        );

        Ok(Self::assemble(config, state, database))
    }

    /// A store without persistence
    pub fn in_memory(device_id: Uuid) -> Self {
        Self::assemble(
            StoreConfig::in_memory(device_id),
            StoreState::new(device_id),
            None,
        )
    }

    fn assemble(config: StoreConfig, state: StoreState, database: Option<LocalDatabase>) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            config,
            device_id: state.device_id(),
            state: Mutex::new(state),
            database,
            remote: RwLock::new(None),
            progress,
        }
    }

    pub fn with_remote(self, remote: Arc<dyn RemotePeer>) -> Self {
        self.set_remote(Some(remote));
        self
    }

    /// Attach or detach the remote used by synchronization
    pub fn set_remote(&self, remote: Option<Arc<dyn RemotePeer>>) {
        *self.remote.write() = remote;
    }

    pub fn remote(&self) -> Option<Arc<dyn RemotePeer>> {
        self.remote.read().clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub async fn knowledge_vector(&self) -> KnowledgeVector {
        self.state.lock().await.knowledge_vector().clone()
    }

    pub async fn clock_time(&self) -> u64 {
        self.state.lock().await.clock_time()
    }

    /// Number of stored versions, tombstones included
    pub async fn version_count(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn entity(&self, uuid: Uuid) -> Option<Entity> {
        self.state
            .lock()
            .await
            .get(uuid)
            .map(|stored| stored.value.clone())
    }

    /// Current live version of every record of a kind, ordered by id.
    ///
    /// For outcomes this is every live outcome ordered by slot.
    pub async fn fetch_latest(&self, kind: EntityKind) -> Vec<Entity> {
        let state = self.state.lock().await;

        if !kind.is_versioned() {
            let mut outcomes: Vec<&Outcome> = state
                .entities()
                .filter_map(|stored| stored.value.as_outcome())
                .filter(|outcome| outcome.deleted_date.is_none())
                .collect();
            outcomes.sort_by_key(|outcome| outcome.slot());
            return outcomes.into_iter().cloned().map(Entity::from).collect();
        }

        let mut ids: Vec<&str> = state.logical_ids(kind).collect();
        ids.sort_unstable();

        ids.into_iter()
            .filter_map(|id| state.tip(kind, id))
            .filter(|tip| !tip.is_tombstone())
            .cloned()
            .collect()
    }

    /// Live outcomes recorded against a task version, ordered by occurrence
    pub async fn fetch_outcomes(&self, task_uuid: Uuid) -> Vec<Outcome> {
        let state = self.state.lock().await;
        let mut outcomes: Vec<Outcome> = state
            .outcomes_of(task_uuid)
            .filter(|outcome| outcome.deleted_date.is_none())
            .cloned()
            .collect();
        outcomes.sort_by_key(|outcome| outcome.task_occurrence_index);
        outcomes
    }

    /// The version and all of its ancestors, newest first
    pub async fn version_history(&self, uuid: Uuid) -> SyncResult<Vec<Entity>> {
        self.state.lock().await.version_history(uuid)
    }

    /// Add a new record. Versioned records must not already have a live version.
    pub async fn add(&self, entity: impl Into<Entity>) -> SyncResult<Entity> {
        let mut entity = entity.into();
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);

        if let Entity::Outcome(outcome) = &entity {
            let state = txn.state();
            let has_task = state
                .get(outcome.task_uuid)
                .map_or(false, |stored| stored.value.kind() == EntityKind::Task);
            if !has_task {
                return Err(SyncError::NotFound(format!("Task version {}", outcome.task_uuid)));
            }
            if state.live_outcome_in_slot(outcome.slot()).is_some() {
                return Err(SyncError::InvalidOperation(format!(
                    "Occurrence {} of task {} already has an outcome",
                    outcome.task_occurrence_index, outcome.task_uuid
                )));
            }
        } else {
            let kind = entity.kind();
            let id = entity.logical_id().unwrap_or_default().to_string();
            let tip = txn.state().tip(kind, &id).cloned();
            if tip.as_ref().map_or(false, |tip| !tip.is_tombstone()) {
                return Err(SyncError::InvalidOperation(format!(
                    "{} with id '{}' already exists",
                    kind, id
                )));
            }

            // A deleted record that is added again continues its chain
            if let Some(version) = entity.version_mut() {
                version.previous_version_uuids = tip.and_then(|tip| tip.uuid()).into_iter().collect();
            }
        }

        stamp_new_version(&mut entity, Utc::now());
        entity.set_deleted_date(None);
        txn.insert(entity.clone())?;
        self.commit(txn).await?;

        debug!(kind = %entity.kind(), uuid = ?entity.uuid(), "Added record");
        Ok(entity)
    }

    /// Append a new version after the current one. Outcomes replace the live
    /// outcome in their slot.
    pub async fn update(&self, entity: impl Into<Entity>) -> SyncResult<Entity> {
        let mut entity = entity.into();
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);

        if let Entity::Outcome(outcome) = &entity {
            let Some(current) = txn.state().live_outcome_in_slot(outcome.slot()).cloned() else {
                return Err(SyncError::NotFound(format!(
                    "Outcome for occurrence {} of task {}",
                    outcome.task_occurrence_index, outcome.task_uuid
                )));
            };
            txn.replace(superseded(current, now).into())?;
        } else {
            let kind = entity.kind();
            let id = entity.logical_id().unwrap_or_default().to_string();
            let tip = txn
                .state()
                .tip(kind, &id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("{} '{}'", kind, id)))?;
            if tip.is_tombstone() {
                return Err(SyncError::InvalidOperation(format!(
                    "{} '{}' has been deleted",
                    kind, id
                )));
            }
            if let (Some(version), Some(parent)) = (entity.version_mut(), tip.uuid()) {
                version.previous_version_uuids = vec![parent];
            }
        }

        stamp_new_version(&mut entity, now);
        entity.set_deleted_date(None);
        txn.insert(entity.clone())?;
        self.commit(txn).await?;

        debug!(kind = %entity.kind(), uuid = ?entity.uuid(), "Updated record");
        Ok(entity)
    }

    /// Delete a versioned record by appending a tombstone version
    pub async fn delete(&self, kind: EntityKind, id: &str) -> SyncResult<Entity> {
        if !kind.is_versioned() {
            return Err(SyncError::InvalidOperation(
                "Outcomes are deleted by uuid".to_string(),
            ));
        }

        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);

        let tip = txn
            .state()
            .tip(kind, id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{} '{}'", kind, id)))?;
        if tip.is_tombstone() {
            return Err(SyncError::InvalidOperation(format!(
                "{} '{}' has already been deleted",
                kind, id
            )));
        }

        let mut tombstone = tip.clone();
        if let (Some(version), Some(parent)) = (tombstone.version_mut(), tip.uuid()) {
            version.previous_version_uuids = vec![parent];
        }
        stamp_new_version(&mut tombstone, now);
        tombstone.set_deleted_date(Some(now));
        txn.insert(tombstone.clone())?;
        self.commit(txn).await?;

        debug!(kind = %kind, id = id, "Deleted record");
        Ok(tombstone)
    }

    /// Delete an outcome. The stored outcome is tombstoned in place and a
    /// tombstone copy is appended so that peers learn about the deletion.
    pub async fn delete_outcome(&self, uuid: Uuid) -> SyncResult<Entity> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);

        let current = txn
            .state()
            .get(uuid)
            .and_then(|stored| stored.value.as_outcome())
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("Outcome {}", uuid)))?;
        if current.deleted_date.is_some() {
            return Err(SyncError::InvalidOperation(format!(
                "Outcome {} has already been deleted",
                uuid
            )));
        }

        txn.replace(superseded(current.clone(), now).into())?;

        let mut tombstone = Entity::from(current);
        stamp_new_version(&mut tombstone, now);
        tombstone.set_deleted_date(Some(now));
        txn.insert(tombstone.clone())?;
        self.commit(txn).await?;

        debug!(uuid = %uuid, "Deleted outcome");
        Ok(tombstone)
    }

    /// Compute the revision of everything written at or after local clock `since`
    pub async fn compute_revision(&self, since: u64) -> RevisionRecord {
        self.state.lock().await.compute_revision(since)
    }

    /// Compute a revision for a peer and advance the local clock, so that
    /// anything written after this point lands in the next revision.
    ///
    /// The record carries the advanced knowledge vector.
    pub async fn prepare_outgoing_revision(&self, since: u64) -> SyncResult<RevisionRecord> {
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);

        let mut record = txn.state().compute_revision(since);
        txn.increment_clock();
        record.knowledge_vector = txn.state().knowledge_vector().clone();
        self.commit(txn).await?;

        debug!(
            since = since,
            entities = record.len(),
            clock = record.knowledge_vector.clock(self.device_id),
            "Prepared outgoing revision"
        );
        Ok(record)
    }

    /// Remove every version and reset the knowledge vector to empty
    pub async fn reset_content(&self) -> SyncResult<()> {
        let mut guard = self.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);
        let removed = txn.state().len();
        txn.reset();
        self.commit(txn).await?;

        info!(removed = removed, "Cleared store content");
        Ok(())
    }

    /// Persist a transaction's changes, then make them final. On persistence
    /// failure the transaction is dropped and rolls back.
    pub(crate) async fn commit(&self, txn: Transaction<'_>) -> SyncResult<()> {
        if let Some(database) = &self.database {
            if !txn.changes().is_empty() {
                database.persist(txn.state(), txn.changes()).await?;
            }
        }
        txn.commit();
        Ok(())
    }
}

/// Fresh identity and dates for a version about to be stored
fn stamp_new_version(entity: &mut Entity, now: DateTime<Utc>) {
    entity.set_uuid(Uuid::new_v4());
    entity.set_persisted_dates(now, now);
}

/// The outcome marked deleted at `now`, keeping its identity
fn superseded(mut outcome: Outcome, now: DateTime<Utc>) -> Outcome {
    outcome.deleted_date = Some(now);
    outcome.updated_date = Some(now);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{OutcomeValue, OutcomeValueType, Patient, Task};

    fn store() -> CareStore {
        CareStore::in_memory(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_add_assigns_identity() {
        let store = store();
        let added = store
            .add(Task::new("walk", Some("Walk".to_string()), None))
            .await
            .unwrap();

        let uuid = added.uuid().unwrap();
        assert!(added.created_date().is_some());
        assert_eq!(added.created_date(), added.updated_date());
        assert_eq!(store.entity(uuid).await, Some(added));
        assert_eq!(store.version_count().await, 1);
    }

    #[tokio::test]
    async fn test_add_rejects_live_duplicate() {
        let store = store();
        store.add(Patient::new("amy", "Amy", "Frost")).await.unwrap();

        let result = store.add(Patient::new("amy", "Amy", "Frost")).await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
        assert_eq!(store.version_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_chains_versions() {
        let store = store();
        let v1 = store.add(Task::new("walk", Some("Walk".to_string()), None)).await.unwrap();
        let v2 = store
            .update(Task::new("walk", Some("Walk 30 minutes".to_string()), None))
            .await
            .unwrap();

        assert_eq!(v2.previous_version_uuids(), &[v1.uuid().unwrap()]);

        let latest = store.fetch_latest(EntityKind::Task).await;
        assert_eq!(latest, vec![v2.clone()]);

        let history = store.version_history(v2.uuid().unwrap()).await.unwrap();
        assert_eq!(history, vec![v2, v1]);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = store();
        let result = store.update(Patient::new("nobody", "No", "Body")).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_appends_tombstone() {
        let store = store();
        let v1 = store.add(Patient::new("amy", "Amy", "Frost")).await.unwrap();
        let tombstone = store.delete(EntityKind::Patient, "amy").await.unwrap();

        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.previous_version_uuids(), &[v1.uuid().unwrap()]);
        assert!(store.fetch_latest(EntityKind::Patient).await.is_empty());
        assert!(store.update(Patient::new("amy", "Amy", "Frost")).await.is_err());

        let again = store.add(Patient::new("amy", "Amy", "Frost")).await.unwrap();
        assert_eq!(again.previous_version_uuids(), &[tombstone.uuid().unwrap()]);
        assert_eq!(store.fetch_latest(EntityKind::Patient).await, vec![again]);
    }

    #[tokio::test]
    async fn test_outcome_slot_is_exclusive() {
        let store = store();
        let task = store.add(Task::new("glucose", None, None)).await.unwrap();
        let task_uuid = task.uuid().unwrap();
        let reading = |v| vec![OutcomeValue::new(OutcomeValueType::Integer(v)).with_units("mg/dL")];

        store.add(Outcome::new(task_uuid, 0, reading(110))).await.unwrap();
        let duplicate = store.add(Outcome::new(task_uuid, 0, reading(120))).await;
        assert!(matches!(duplicate, Err(SyncError::InvalidOperation(_))));

        let updated = store.update(Outcome::new(task_uuid, 0, reading(120))).await.unwrap();
        let outcomes = store.fetch_outcomes(task_uuid).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(Entity::from(outcomes[0].clone()), updated);

        store.delete_outcome(updated.uuid().unwrap()).await.unwrap();
        assert!(store.fetch_outcomes(task_uuid).await.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_requires_task() {
        let store = store();
        let result = store.add(Outcome::new(Uuid::new_v4(), 0, vec![])).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_compute_revision_order_and_filter() {
        let store = store();
        store.add(Patient::new("amy", "Amy", "Frost")).await.unwrap();
        let first = store.prepare_outgoing_revision(0).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.knowledge_vector.clock(store.device_id()), 1);

        let walk = store.add(Task::new("walk", None, None)).await.unwrap();
        store.delete(EntityKind::Patient, "amy").await.unwrap();

        let delta = store.compute_revision(1).await;
        assert_eq!(delta.len(), 2);
        assert!(delta.entities[0].is_tombstone());
        assert_eq!(delta.entities[1], walk);

        let everything = store.compute_revision(0).await;
        assert_eq!(everything.len(), 3);
    }

    fn patient_version(id: &str, minutes_ago: i64, deleted: bool) -> Entity {
        let written = Utc::now() - chrono::Duration::minutes(minutes_ago);
        let mut patient = Patient::new(id, "Test", "Patient");
        patient.version.uuid = Some(Uuid::new_v4());
        patient.version.created_date = Some(written);
        patient.version.updated_date = Some(written);
        patient.version.deleted_date = deleted.then_some(written);
        patient.into()
    }

    #[test]
    fn test_revision_groups_are_ordered_by_update_time() {
        let mut state = StoreState::new(Uuid::new_v4());
        let versions = [
            patient_version("cy", 1, false),
            patient_version("bob", 5, true),
            patient_version("amy", 9, false),
            patient_version("dee", 2, true),
            patient_version("eve", 4, false),
        ];
        {
            let mut txn = Transaction::begin(&mut state);
            for version in &versions {
                txn.insert(version.clone()).unwrap();
            }
            txn.commit();
        }

        let revision = state.compute_revision(0);
        let ids: Vec<&str> = revision
            .entities
            .iter()
            .map(|e| e.logical_id().unwrap())
            .collect();
        assert_eq!(ids, vec!["bob", "dee", "amy", "eve", "cy"]);
    }

    #[test]
    fn test_indexes_follow_rollback() {
        let mut state = StoreState::new(Uuid::new_v4());
        let first = patient_version("amy", 3, false);
        let first_uuid = first.uuid().unwrap();
        {
            let mut txn = Transaction::begin(&mut state);
            txn.insert(first.clone()).unwrap();
            txn.commit();
        }

        let mut second = patient_version("amy", 1, false);
        second.version_mut().unwrap().previous_version_uuids = vec![first_uuid];
        {
            let mut txn = Transaction::begin(&mut state);
            txn.insert(second.clone()).unwrap();
            assert_eq!(txn.state().next_versions(first_uuid), vec![second.uuid().unwrap()]);
            assert_eq!(txn.state().tip(EntityKind::Patient, "amy"), Some(&second));
        }

        assert!(state.next_versions(first_uuid).is_empty());
        assert_eq!(state.tip(EntityKind::Patient, "amy"), Some(&first));
        assert_eq!(state.logical_ids(EntityKind::Patient).collect::<Vec<_>>(), vec!["amy"]);
        assert_eq!(state.logical_ids(EntityKind::Task).count(), 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_drop() {
        let device = Uuid::new_v4();
        let mut state = StoreState::new(device);

        let mut patient = Patient::new("amy", "Amy", "Frost");
        patient.version.uuid = Some(Uuid::new_v4());
        {
            let mut txn = Transaction::begin(&mut state);
            txn.insert(patient.clone().into()).unwrap();
            txn.increment_clock();
            txn.merge_knowledge(&KnowledgeVector::from_entries([(Uuid::new_v4(), 4)]));
        }

        assert!(state.is_empty());
        assert!(state.knowledge_vector().is_empty());

        {
            let mut txn = Transaction::begin(&mut state);
            txn.insert(patient.into()).unwrap();
            txn.increment_clock();
            txn.commit();
        }
        assert_eq!(state.len(), 1);
        assert_eq!(state.clock_time(), 1);
    }

    #[tokio::test]
    async fn test_cascading_removal() {
        let store = store();
        let v1 = store.add(Task::new("walk", None, None)).await.unwrap();
        let v2 = store.update(Task::new("walk", Some("Longer".to_string()), None)).await.unwrap();
        store
            .add(Outcome::new(v2.uuid().unwrap(), 0, vec![]))
            .await
            .unwrap();

        let mut guard = store.state.lock().await;
        let mut txn = Transaction::begin(&mut guard);
        assert_eq!(txn.remove_cascading(v1.uuid().unwrap()), 3);
        assert!(txn.state().is_empty());
        assert_eq!(txn.changes().touched.len(), 3);
    }

    #[tokio::test]
    async fn test_reset_content() {
        let store = store();
        store.add(Patient::new("amy", "Amy", "Frost")).await.unwrap();
        store.prepare_outgoing_revision(0).await.unwrap();

        store.reset_content().await.unwrap();
        assert_eq!(store.version_count().await, 0);
        assert!(store.knowledge_vector().await.is_empty());
    }
}
