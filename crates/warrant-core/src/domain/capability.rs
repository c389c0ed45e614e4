//! Worker capabilities and the sets tasks request.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::string_id;

string_id!(
    /// A coarse ability a worker declares (e.g. "research", "image").
    Capability
);

/// An ordered set of capabilities.
///
/// Tasks request a set; workers declare a set. A worker is eligible for a task
/// only when its set is a superset of the task's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn is_superset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Canonical key of the capability class this set defines.
    ///
    /// Tasks with identical requested sets share a class and are served FIFO.
    pub fn class_key(&self) -> String {
        self.0
            .iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(Capability::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(&["research"], &["research"], true)]
    #[case::strict_superset(&["research", "image"], &["research"], true)]
    #[case::empty_request(&["research"], &[], true)]
    #[case::missing_one(&["research"], &["research", "image"], false)]
    #[case::disjoint(&["image"], &["research"], false)]
    fn worker_set_must_cover_request(
        #[case] worker: &[&str],
        #[case] requested: &[&str],
        #[case] eligible: bool,
    ) {
        let worker: CapabilitySet = worker.iter().copied().collect();
        let requested: CapabilitySet = requested.iter().copied().collect();
        assert_eq!(worker.is_superset_of(&requested), eligible);
    }

    #[test]
    fn class_key_is_order_independent() {
        let a: CapabilitySet = ["research", "image"].into_iter().collect();
        let b: CapabilitySet = ["image", "research"].into_iter().collect();
        assert_eq!(a.class_key(), b.class_key());
        assert_eq!(a.class_key(), "image+research");
    }
}
