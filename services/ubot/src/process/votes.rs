use std::collections::HashMap;

use ubot_id::{NodeNumber, ResultHash};
use ubot_notification::RequestKey;

/// Outcome of recording a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    New,
    /// Same hash as this voter's earlier vote.
    Repeated,
    /// Differs from this voter's earlier vote; the earlier one stands.
    Conflicting,
}

/// Hash votes per request, one per voter.
///
/// Votes are kept whatever order they arrive in, including votes for rounds
/// this node has not reached yet.
#[derive(Debug, Default)]
pub struct VoteBook {
    votes: HashMap<RequestKey, HashMap<NodeNumber, ResultHash>>,
}

impl VoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: RequestKey, voter: NodeNumber, hash: ResultHash) -> Vote {
        let round = self.votes.entry(key).or_default();
        match round.get(&voter) {
            None => {
                round.insert(voter, hash);
                Vote::New
            }
            Some(existing) if *existing == hash => Vote::Repeated,
            Some(_) => Vote::Conflicting,
        }
    }

    /// Voters that voted for `hash`.
    pub fn matching(&self, key: &RequestKey, hash: &ResultHash) -> usize {
        self.votes
            .get(key)
            .map_or(0, |round| round.values().filter(|h| *h == hash).count())
    }

    pub fn vote_of(&self, key: &RequestKey, voter: NodeNumber) -> Option<ResultHash> {
        self.votes.get(key).and_then(|round| round.get(&voter).copied())
    }

    pub fn has_voted(&self, key: &RequestKey, voter: NodeNumber) -> bool {
        self.vote_of(key, voter).is_some()
    }

    /// Every `(voter, hash)` recorded for `key`.
    pub fn round(&self, key: &RequestKey) -> impl Iterator<Item = (NodeNumber, ResultHash)> + '_ {
        self.votes
            .get(key)
            .into_iter()
            .flat_map(|round| round.iter().map(|(voter, hash)| (*voter, *hash)))
    }
}
