use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use ubot_id::NodeNumber;

/// The per-node slots of a multi storage, as read by a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiStorageView {
    slots: BTreeMap<NodeNumber, Bytes>,
}

impl MultiStorageView {
    pub fn new(slots: BTreeMap<NodeNumber, Bytes>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, node: NodeNumber) -> Option<&Bytes> {
        self.slots.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeNumber, &Bytes)> {
        self.slots.iter().map(|(n, b)| (*n, b))
    }

    /// The value held by at least `threshold` slots.
    ///
    /// Returns `None` when no value reaches the threshold, or when two
    /// different values both do.
    pub fn agreed_value(&self, threshold: usize) -> Option<&Bytes> {
        let mut counts: HashMap<&Bytes, usize> = HashMap::new();
        for value in self.slots.values() {
            *counts.entry(value).or_default() += 1;
        }

        let mut agreed = counts
            .into_iter()
            .filter(|(_, count)| *count >= threshold.max(1));
        match (agreed.next(), agreed.next()) {
            (Some((value, _)), None) => Some(value),
            _ => None,
        }
    }
}
