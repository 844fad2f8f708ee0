//! Knowledge Vectors for causality tracking across devices
//!
//! Each device owns one entry in the vector and only ever moves it forward with
//! `increment`. Knowledge received from a peer is folded in with `merge`. The
//! strict partial order tells whether one device has already seen everything
//! another device had seen when it produced a change.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Per-device logical clock map. Absent devices have clock 0.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeVector {
    /// Map of device_id -> clock
    processes: HashMap<Uuid, u64>,
}

impl KnowledgeVector {
    /// Create a new empty knowledge vector
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
        }
    }

    /// Build a vector from explicit `(device, clock)` entries
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Uuid, u64)>,
    {
        Self {
            processes: entries.into_iter().collect(),
        }
    }

    /// Get the clock for a device
    pub fn clock(&self, device: Uuid) -> u64 {
        self.processes.get(&device).copied().unwrap_or(0)
    }

    /// Increment the clock for a device, creating the entry if absent.
    ///
    /// Called by the owning device each time it completes a merge.
    pub fn increment(&mut self, device: Uuid) {
        let entry = self.processes.entry(device).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    /// Merge with another vector (pointwise maximum over the union of devices)
    pub fn merge(&mut self, other: &KnowledgeVector) {
        for (device, clock) in &other.processes {
            let entry = self.processes.entry(*device).or_insert(0);
            *entry = (*entry).max(*clock);
        }
    }

    /// Strict order: every clock in `self` is <= the one in `other` and at
    /// least one is strictly less. If this holds, `other` has seen everything
    /// `self` has seen, so changes stamped with `self` do not conflict with it.
    pub fn happens_before(&self, other: &KnowledgeVector) -> bool {
        self.partial_cmp(other) == Some(Ordering::Less)
    }

    /// Neither vector happened before the other and they are not equal
    pub fn is_concurrent(&self, other: &KnowledgeVector) -> bool {
        self.partial_cmp(other).is_none()
    }

    /// Devices with an entry in this vector
    pub fn devices(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.processes.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.values().all(|clock| *clock == 0)
    }

    fn all_devices<'a>(&'a self, other: &'a KnowledgeVector) -> HashSet<Uuid> {
        self.processes
            .keys()
            .chain(other.processes.keys())
            .copied()
            .collect()
    }
}

impl PartialEq for KnowledgeVector {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for KnowledgeVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;

        for device in self.all_devices(other) {
            match self.clock(device).cmp(&other.clock(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }

        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

// Wire shape: {"processes": [{"id": .., "clock": ..}]}

#[derive(Serialize, Deserialize)]
struct ClockInfo {
    id: Uuid,
    clock: u64,
}

#[derive(Serialize, Deserialize)]
struct WireVector {
    processes: Vec<ClockInfo>,
}

impl Serialize for KnowledgeVector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut processes: Vec<ClockInfo> = self
            .processes
            .iter()
            .map(|(id, clock)| ClockInfo {
                id: *id,
                clock: *clock,
            })
            .collect();
        processes.sort_by_key(|info| info.id);

        WireVector { processes }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KnowledgeVector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireVector::deserialize(deserializer)?;
        let mut vector = KnowledgeVector::new();
        for info in wire.processes {
            let entry = vector.processes.entry(info.id).or_insert(0);
            *entry = (*entry).max(info.clock);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_clock_defaults_to_zero() {
        let vector = KnowledgeVector::new();
        assert_eq!(vector.clock(device(1)), 0);
    }

    #[test]
    fn test_increment() {
        let mut vector = KnowledgeVector::new();
        vector.increment(device(1));
        vector.increment(device(1));
        vector.increment(device(2));
        assert_eq!(vector.clock(device(1)), 2);
        assert_eq!(vector.clock(device(2)), 1);
    }

    #[test]
    fn test_merge() {
        let mut a = KnowledgeVector::from_entries([(device(1), 5), (device(2), 3)]);
        let b = KnowledgeVector::from_entries([(device(1), 3), (device(2), 7), (device(3), 2)]);

        a.merge(&b);

        assert_eq!(a.clock(device(1)), 5);
        assert_eq!(a.clock(device(2)), 7);
        assert_eq!(a.clock(device(3)), 2);
    }

    #[test]
    fn test_strict_order() {
        let a = KnowledgeVector::from_entries([(device(1), 2), (device(2), 3)]);
        let b = KnowledgeVector::from_entries([(device(1), 5), (device(2), 3)]);

        assert!(a < b);
        assert!(!(b < a));
        assert!(a.happens_before(&b));
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let empty = KnowledgeVector::new();
        let zeroed = KnowledgeVector::from_entries([(device(1), 0)]);
        let one = KnowledgeVector::from_entries([(device(1), 1)]);

        assert_eq!(empty, zeroed);
        assert!(empty < one);
        assert!(!(one < empty));
    }

    #[test]
    fn test_concurrent_vectors() {
        let a = KnowledgeVector::from_entries([(device(1), 5), (device(2), 2)]);
        let b = KnowledgeVector::from_entries([(device(1), 3), (device(2), 7)]);

        assert!(!(a < b));
        assert!(!(b < a));
        assert!(a.is_concurrent(&b));
    }

    #[test]
    fn test_wire_shape_is_array_of_processes() {
        let vector = KnowledgeVector::from_entries([(device(2), 4), (device(1), 1)]);
        let json = serde_json::to_value(&vector).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "processes": [
                    {"id": device(1).to_string(), "clock": 1},
                    {"id": device(2).to_string(), "clock": 4},
                ]
            })
        );

        let decoded: KnowledgeVector = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, vector);
    }

    fn arb_vector() -> impl Strategy<Value = KnowledgeVector> {
        prop::collection::vec((0u128..6, 0u64..20), 0..6).prop_map(|entries| {
            KnowledgeVector::from_entries(entries.into_iter().map(|(d, c)| (device(d), c)))
        })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_vector(), b in arb_vector()) {
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(&ab, &ba);

            for d in 0u128..6 {
                prop_assert!(ab.clock(device(d)) >= a.clock(device(d)).max(b.clock(device(d))));
            }
        }

        #[test]
        fn merge_is_idempotent(a in arb_vector()) {
            let mut merged = a.clone();
            merged.merge(&a);
            prop_assert_eq!(merged, a);
        }

        #[test]
        fn strict_order_is_irreflexive_and_asymmetric(a in arb_vector(), b in arb_vector()) {
            prop_assert!(!(a < a));
            if a < b {
                prop_assert!(!(b < a));
            }
        }

        #[test]
        fn increment_adds_exactly_one(a in arb_vector(), d in 0u128..6) {
            let mut incremented = a.clone();
            incremented.increment(device(d));

            for other in 0u128..8 {
                let expected = if other == d { a.clock(device(other)) + 1 } else { a.clock(device(other)) };
                prop_assert_eq!(incremented.clock(device(other)), expected);
            }
        }
    }
}
