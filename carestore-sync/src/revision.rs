//! Revision records: the unit of exchange between devices

use crate::entity::Entity;
use crate::knowledge::KnowledgeVector;
use serde::{Deserialize, Serialize};

/// An ordered batch of entity changes and the author's knowledge at creation.
///
/// Entities are ordered oldest-observed first. Only persisted entities can be
/// shared, so each one carries a version uuid and an updated date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub entities: Vec<Entity>,
    pub knowledge_vector: KnowledgeVector,
}

impl RevisionRecord {
    pub fn new(entities: Vec<Entity>, knowledge_vector: KnowledgeVector) -> Self {
        debug_assert!(
            entities.iter().all(|e| e.uuid().is_some()),
            "revision entities must carry a version uuid"
        );
        debug_assert!(
            entities.iter().all(|e| e.updated_date().is_some()),
            "revision entities must carry an updated date"
        );

        Self {
            entities,
            knowledge_vector,
        }
    }

    /// A record with no entities, used to hand over knowledge only
    pub fn knowledge_only(knowledge_vector: KnowledgeVector) -> Self {
        Self {
            entities: Vec::new(),
            knowledge_vector,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Patient;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_wire_shape() {
        let device = Uuid::new_v4();
        let mut patient = Patient::new("amy", "Amy", "Frost");
        patient.version.uuid = Some(Uuid::new_v4());
        patient.version.created_date = Some(Utc::now());
        patient.version.updated_date = patient.version.created_date;

        let record = RevisionRecord::new(
            vec![patient.into()],
            KnowledgeVector::from_entries([(device, 2)]),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entities"][0]["entity"], "patient");
        assert_eq!(json["entities"][0]["value"]["name"]["givenName"], "Amy");
        assert_eq!(json["knowledgeVector"]["processes"][0]["clock"], 2);

        let decoded: RevisionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_knowledge_only_record() {
        let record = RevisionRecord::knowledge_only(KnowledgeVector::new());
        assert!(record.is_empty());
        assert_eq!(record.len(), 0);
    }
}
