//! Versioned care records
//!
//! Every record kind except outcomes is version-chained: a logical record (`id`)
//! is a sequence of immutable versions (`uuid`), each pointing back at the one
//! it replaced. Deleting a record appends a tombstoned version. Outcomes are not
//! chained; they occupy a slot addressed by the owning task version and the
//! occurrence index inside that task's schedule.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of record carried by an [`Entity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Task,
    Outcome,
    CarePlan,
    Contact,
    Patient,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patient,
        EntityKind::CarePlan,
        EntityKind::Contact,
        EntityKind::Task,
        EntityKind::Outcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Outcome => "outcome",
            EntityKind::CarePlan => "carePlan",
            EntityKind::Contact => "contact",
            EntityKind::Patient => "patient",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "task" => Ok(EntityKind::Task),
            "outcome" => Ok(EntityKind::Outcome),
            "carePlan" => Ok(EntityKind::CarePlan),
            "contact" => Ok(EntityKind::Contact),
            "patient" => Ok(EntityKind::Patient),
            _ => Err(SyncError::InvalidValue(format!("Unknown entity kind: {}", s))),
        }
    }

    /// Whether versions of this kind form a chain through previous-version links
    pub fn is_versioned(&self) -> bool {
        !matches!(self, EntityKind::Outcome)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata shared by every version of a chained record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Identifier of this version. Assigned once persisted, never changed.
    #[serde(default)]
    pub uuid: Option<Uuid>,

    /// Logical identifier shared by all versions of the record
    pub id: String,

    /// Versions this one replaced. The first entry is the parent.
    #[serde(default, rename = "previousVersionUUIDs")]
    pub previous_version_uuids: Vec<Uuid>,

    /// When this version starts governing behavior
    pub effective_date: DateTime<Utc>,

    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_date: Option<DateTime<Utc>>,

    /// Set on tombstones
    #[serde(default)]
    pub deleted_date: Option<DateTime<Utc>>,
}

impl VersionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            uuid: None,
            id: id.into(),
            previous_version_uuids: Vec::new(),
            effective_date: Utc::now(),
            created_date: None,
            updated_date: None,
            deleted_date: None,
        }
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.previous_version_uuids.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    pub given_name: String,
    pub family_name: String,
}

impl PersonName {
    pub fn new(given_name: impl Into<String>, family_name: impl Into<String>) -> Self {
        Self {
            given_name: given_name.into(),
            family_name: family_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub version: VersionInfo,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default = "default_impacts_adherence")]
    pub impacts_adherence: bool,
    #[serde(default)]
    pub care_plan_uuid: Option<Uuid>,
}

fn default_impacts_adherence() -> bool {
    true
}

impl Task {
    pub fn new(id: impl Into<String>, title: Option<String>, care_plan_uuid: Option<Uuid>) -> Self {
        Self {
            version: VersionInfo::new(id),
            title,
            instructions: None,
            impacts_adherence: true,
            care_plan_uuid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarePlan {
    #[serde(flatten)]
    pub version: VersionInfo,
    pub title: String,
    #[serde(default)]
    pub patient_uuid: Option<Uuid>,
}

impl CarePlan {
    pub fn new(id: impl Into<String>, title: impl Into<String>, patient_uuid: Option<Uuid>) -> Self {
        Self {
            version: VersionInfo::new(id),
            title: title.into(),
            patient_uuid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(flatten)]
    pub version: VersionInfo,
    pub name: PersonName,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub care_plan_uuid: Option<Uuid>,
}

impl Contact {
    pub fn new(
        id: impl Into<String>,
        given_name: impl Into<String>,
        family_name: impl Into<String>,
        care_plan_uuid: Option<Uuid>,
    ) -> Self {
        Self {
            version: VersionInfo::new(id),
            name: PersonName::new(given_name, family_name),
            organization: None,
            care_plan_uuid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(flatten)]
    pub version: VersionInfo,
    pub name: PersonName,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
}

impl Patient {
    pub fn new(id: impl Into<String>, given_name: impl Into<String>, family_name: impl Into<String>) -> Self {
        Self {
            version: VersionInfo::new(id),
            name: PersonName::new(given_name, family_name),
            birthday: None,
        }
    }
}

/// A single recorded measurement or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeValueType {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeValue {
    pub value: OutcomeValueType,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
}

impl OutcomeValue {
    pub fn new(value: OutcomeValueType) -> Self {
        Self {
            value,
            units: None,
            kind: None,
            created_date: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

/// Result recorded for one occurrence of a task version.
///
/// `(task_uuid, task_occurrence_index)` addresses the slot; at most one live
/// outcome occupies a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub task_uuid: Uuid,
    pub task_occurrence_index: u32,
    #[serde(default)]
    pub values: Vec<OutcomeValue>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_date: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn new(task_uuid: Uuid, task_occurrence_index: u32, values: Vec<OutcomeValue>) -> Self {
        Self {
            uuid: None,
            task_uuid,
            task_occurrence_index,
            values,
            created_date: None,
            updated_date: None,
            deleted_date: None,
        }
    }

    pub fn slot(&self) -> (Uuid, u32) {
        (self.task_uuid, self.task_occurrence_index)
    }
}

/// Any record the store can hold or exchange with a peer
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Task(Task),
    Outcome(Outcome),
    CarePlan(CarePlan),
    Contact(Contact),
    Patient(Patient),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Task(_) => EntityKind::Task,
            Entity::Outcome(_) => EntityKind::Outcome,
            Entity::CarePlan(_) => EntityKind::CarePlan,
            Entity::Contact(_) => EntityKind::Contact,
            Entity::Patient(_) => EntityKind::Patient,
        }
    }

    /// Version metadata, `None` for outcomes
    pub fn version(&self) -> Option<&VersionInfo> {
        match self {
            Entity::Task(v) => Some(&v.version),
            Entity::CarePlan(v) => Some(&v.version),
            Entity::Contact(v) => Some(&v.version),
            Entity::Patient(v) => Some(&v.version),
            Entity::Outcome(_) => None,
        }
    }

    pub fn version_mut(&mut self) -> Option<&mut VersionInfo> {
        match self {
            Entity::Task(v) => Some(&mut v.version),
            Entity::CarePlan(v) => Some(&mut v.version),
            Entity::Contact(v) => Some(&mut v.version),
            Entity::Patient(v) => Some(&mut v.version),
            Entity::Outcome(_) => None,
        }
    }

    pub fn as_outcome(&self) -> Option<&Outcome> {
        match self {
            Entity::Outcome(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            Entity::Outcome(o) => o.uuid,
            _ => self.version().and_then(|v| v.uuid),
        }
    }

    pub fn logical_id(&self) -> Option<&str> {
        self.version().map(|v| v.id.as_str())
    }

    pub fn previous_version_uuids(&self) -> &[Uuid] {
        self.version()
            .map(|v| v.previous_version_uuids.as_slice())
            .unwrap_or(&[])
    }

    pub fn created_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Outcome(o) => o.created_date,
            _ => self.version().and_then(|v| v.created_date),
        }
    }

    pub fn updated_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Outcome(o) => o.updated_date,
            _ => self.version().and_then(|v| v.updated_date),
        }
    }

    pub fn deleted_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Outcome(o) => o.deleted_date,
            _ => self.version().and_then(|v| v.deleted_date),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_date().is_some()
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        match self {
            Entity::Outcome(o) => o.uuid = Some(uuid),
            other => {
                if let Some(v) = other.version_mut() {
                    v.uuid = Some(uuid);
                }
            }
        }
    }

    pub fn set_deleted_date(&mut self, date: Option<DateTime<Utc>>) {
        match self {
            Entity::Outcome(o) => o.deleted_date = date,
            other => {
                if let Some(v) = other.version_mut() {
                    v.deleted_date = date;
                }
            }
        }
    }

    /// Stamp creation and update dates as the store persists this value
    pub(crate) fn set_persisted_dates(&mut self, created: DateTime<Utc>, updated: DateTime<Utc>) {
        match self {
            Entity::Outcome(o) => {
                o.created_date = Some(created);
                o.updated_date = Some(updated);
            }
            other => {
                if let Some(v) = other.version_mut() {
                    v.created_date = Some(created);
                    v.updated_date = Some(updated);
                }
            }
        }
    }

    /// The record payload without the kind envelope
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(EntityValue(self))
    }

    pub fn from_value(kind: EntityKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::Task => Entity::Task(serde_json::from_value(value)?),
            EntityKind::Outcome => Entity::Outcome(serde_json::from_value(value)?),
            EntityKind::CarePlan => Entity::CarePlan(serde_json::from_value(value)?),
            EntityKind::Contact => Entity::Contact(serde_json::from_value(value)?),
            EntityKind::Patient => Entity::Patient(serde_json::from_value(value)?),
        })
    }
}

impl From<Task> for Entity {
    fn from(value: Task) -> Self {
        Entity::Task(value)
    }
}

impl From<Outcome> for Entity {
    fn from(value: Outcome) -> Self {
        Entity::Outcome(value)
    }
}

impl From<CarePlan> for Entity {
    fn from(value: CarePlan) -> Self {
        Entity::CarePlan(value)
    }
}

impl From<Contact> for Entity {
    fn from(value: Contact) -> Self {
        Entity::Contact(value)
    }
}

impl From<Patient> for Entity {
    fn from(value: Patient) -> Self {
        Entity::Patient(value)
    }
}

/// Serializes only the payload of an entity
pub(crate) struct EntityValue<'a>(pub(crate) &'a Entity);

impl Serialize for EntityValue<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0 {
            Entity::Task(v) => v.serialize(serializer),
            Entity::Outcome(v) => v.serialize(serializer),
            Entity::CarePlan(v) => v.serialize(serializer),
            Entity::Contact(v) => v.serialize(serializer),
            Entity::Patient(v) => v.serialize(serializer),
        }
    }
}

// Wire shape: {"entity": <kind>, "value": {...}, "deletedDate": <timestamp|null>}

impl Serialize for Entity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Entity", 3)?;
        state.serialize_field("entity", &self.kind())?;
        state.serialize_field("value", &EntityValue(self))?;
        state.serialize_field("deletedDate", &self.deleted_date())?;
        state.end()
    }
}

#[derive(Deserialize)]
struct WireEntity {
    entity: EntityKind,
    value: serde_json::Value,
    #[serde(default, rename = "deletedDate")]
    deleted_date: Option<DateTime<Utc>>,
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireEntity::deserialize(deserializer)?;
        let mut entity = Entity::from_value(wire.entity, wire.value).map_err(de::Error::custom)?;
        if entity.deleted_date().is_none() && wire.deleted_date.is_some() {
            entity.set_deleted_date(wire.deleted_date);
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_strings() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.as_str().to_string())
            );
        }
        assert!(EntityKind::from_str("appointment").is_err());
    }

    #[test]
    fn test_task_envelope_shape() {
        let mut task = Task::new("metformin", Some("Take metformin".to_string()), None);
        task.version.uuid = Some(Uuid::new_v4());
        let entity = Entity::from(task);

        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["entity"], "task");
        assert_eq!(json["value"]["id"], "metformin");
        assert_eq!(json["value"]["title"], "Take metformin");
        assert!(json["value"]["previousVersionUUIDs"].is_array());
        assert!(json["deletedDate"].is_null());
    }

    #[test]
    fn test_outcome_decodes_with_tombstone_from_envelope() {
        let task_uuid = Uuid::new_v4();
        let json = serde_json::json!({
            "entity": "outcome",
            "value": {
                "uuid": Uuid::new_v4(),
                "taskUuid": task_uuid,
                "taskOccurrenceIndex": 3,
                "values": [{"value": 120, "units": "mg/dL"}],
            },
            "deletedDate": "2024-03-01T08:00:00Z",
        });

        let entity: Entity = serde_json::from_value(json).unwrap();
        let outcome = entity.as_outcome().unwrap();
        assert_eq!(outcome.slot(), (task_uuid, 3));
        assert_eq!(outcome.values[0].value, OutcomeValueType::Integer(120));
        assert!(entity.is_tombstone());
    }

    #[test]
    fn test_outcome_has_no_version_chain() {
        let entity = Entity::from(Outcome::new(Uuid::new_v4(), 0, vec![]));
        assert!(entity.version().is_none());
        assert!(entity.previous_version_uuids().is_empty());
        assert!(!entity.kind().is_versioned());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let json = serde_json::json!({"entity": "appointment", "value": {}, "deletedDate": null});
        assert!(serde_json::from_value::<Entity>(json).is_err());
    }
}
