use std::collections::BTreeSet;

use ubot_id::NodeNumber;
use ubot_notification::NodeDescriptor;

use crate::pool::Pool;

/// Tracks which pool members have answered during a phase.
///
/// A phase succeeds early once `required` members answered, and may still
/// succeed at its deadline with `acceptable` answers.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    required: usize,
    acceptable: usize,
    answered: BTreeSet<NodeNumber>,
}

impl PhaseTracker {
    pub fn new(required: usize, acceptable: usize) -> Self {
        Self {
            required,
            acceptable: acceptable.min(required),
            answered: BTreeSet::new(),
        }
    }

    /// Record an answer. Returns false if `node` already answered.
    pub fn record(&mut self, node: NodeNumber) -> bool {
        self.answered.insert(node)
    }

    pub fn answered(&self) -> usize {
        self.answered.len()
    }

    pub fn has_answered(&self, node: NodeNumber) -> bool {
        self.answered.contains(&node)
    }

    pub fn is_ready(&self) -> bool {
        self.answered.len() >= self.required
    }

    pub fn is_acceptable(&self) -> bool {
        self.answered.len() >= self.acceptable
    }

    /// Members of `pool` that have not answered.
    pub fn missing<'p>(&'p self, pool: &'p Pool) -> impl Iterator<Item = &'p NodeDescriptor> {
        pool.members()
            .iter()
            .filter(|member| !self.answered.contains(&member.number))
    }
}
