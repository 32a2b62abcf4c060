//! Pool and quorum selection.
//!
//! Sizes come from a [`SizePolicy`]: a literal count or a percentage of the
//! population, rounded up and clamped to `(0, population]`. The initiator
//! draws the pool; responders adopt the initiator's list verbatim.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ubot_id::NodeNumber;
use ubot_notification::{NetConfig, NodeDescriptor};

/// Pool selection errors. All are raised before any network activity.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoolError {
    #[error("{what} size resolves to zero")]
    ZeroSize { what: &'static str },

    #[error("invalid {what} policy: {reason}")]
    InvalidPolicy { what: &'static str, reason: String },

    #[error("{what} size {requested} exceeds the limit of {limit}")]
    ExceedsLimit {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("cannot draw {requested} nodes from {available} candidates")]
    NotEnoughNodes { requested: usize, available: usize },

    #[error("node {0} is not in the network config")]
    UnknownNode(NodeNumber),

    #[error("node {0} appears twice in the pool")]
    DuplicateMember(NodeNumber),
}

/// How to size a pool or quorum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePolicy {
    /// Literal count.
    Size(usize),
    /// Percentage of the population, rounded up.
    Percentage(f64),
}

impl SizePolicy {
    /// Resolve against a population of `total`.
    fn resolve(&self, what: &'static str, total: usize) -> Result<usize, PoolError> {
        let size = match *self {
            SizePolicy::Size(n) => n.min(total),
            SizePolicy::Percentage(p) => {
                if !p.is_finite() || p < 0.0 {
                    return Err(PoolError::InvalidPolicy {
                        what,
                        reason: format!("percentage {p}"),
                    });
                }
                let size = (p * total as f64 / 100.0).ceil();
                (size as usize).min(total)
            }
        };

        if size == 0 {
            return Err(PoolError::ZeroSize { what });
        }
        Ok(size)
    }
}

/// Pool size for a network of `total_nodes`.
pub fn compute_pool_size(policy: &SizePolicy, total_nodes: usize) -> Result<usize, PoolError> {
    policy.resolve("pool", total_nodes)
}

/// Quorum size for a pool of `pool_size`.
pub fn compute_quorum_size(policy: &SizePolicy, pool_size: usize) -> Result<usize, PoolError> {
    policy.resolve("quorum", pool_size)
}

/// Upper bounds a method may not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_pool_size: usize,
    pub max_quorum_size: usize,
}

/// Resolve pool and quorum sizes and check them against `limits`.
pub fn resolve_sizes(
    pool: &SizePolicy,
    quorum: &SizePolicy,
    limits: SizeLimits,
    total_nodes: usize,
) -> Result<(usize, usize), PoolError> {
    let pool_size = compute_pool_size(pool, total_nodes)?;
    if pool_size > limits.max_pool_size {
        return Err(PoolError::ExceedsLimit {
            what: "pool",
            requested: pool_size,
            limit: limits.max_pool_size,
        });
    }

    let quorum_size = compute_quorum_size(quorum, pool_size)?;
    if quorum_size > limits.max_quorum_size {
        return Err(PoolError::ExceedsLimit {
            what: "quorum",
            requested: quorum_size,
            limit: limits.max_quorum_size,
        });
    }

    Ok((pool_size, quorum_size))
}

/// Fixed, ordered pool membership with position lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    members: Vec<NodeDescriptor>,
    indexes: HashMap<NodeNumber, usize>,
}

impl Pool {
    pub fn new(members: Vec<NodeDescriptor>) -> Result<Self, PoolError> {
        if members.is_empty() {
            return Err(PoolError::ZeroSize { what: "pool" });
        }

        let mut indexes = HashMap::with_capacity(members.len());
        for (position, member) in members.iter().enumerate() {
            if indexes.insert(member.number, position).is_some() {
                return Err(PoolError::DuplicateMember(member.number));
            }
        }
        Ok(Self { members, indexes })
    }

    /// Build a pool from node numbers, resolving each through `net`.
    pub fn from_numbers(numbers: &[NodeNumber], net: &NetConfig) -> Result<Self, PoolError> {
        let members = numbers
            .iter()
            .map(|n| net.get(*n).cloned().ok_or(PoolError::UnknownNode(*n)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(members)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, number: NodeNumber) -> bool {
        self.indexes.contains_key(&number)
    }

    pub fn position(&self, number: NodeNumber) -> Option<usize> {
        self.indexes.get(&number).copied()
    }

    pub fn get(&self, number: NodeNumber) -> Option<&NodeDescriptor> {
        self.position(number).map(|i| &self.members[i])
    }

    pub fn members(&self) -> &[NodeDescriptor] {
        &self.members
    }

    pub fn numbers(&self) -> Vec<NodeNumber> {
        self.members.iter().map(|m| m.number).collect()
    }

    /// Members other than `me`.
    pub fn others(&self, me: NodeNumber) -> impl Iterator<Item = &NodeDescriptor> {
        self.members.iter().filter(move |m| m.number != me)
    }
}

/// Draw a pool of `pool_size` that contains `me` exactly once.
///
/// `pool_size - 1` peers are drawn uniformly without replacement from every
/// other known node; `me` is appended last.
pub fn select_pool<R: Rng + ?Sized>(
    net: &NetConfig,
    me: NodeNumber,
    pool_size: usize,
    rng: &mut R,
) -> Result<Pool, PoolError> {
    let myself = net.get(me).cloned().ok_or(PoolError::UnknownNode(me))?;
    if pool_size == 0 {
        return Err(PoolError::ZeroSize { what: "pool" });
    }

    let candidates: Vec<&NodeDescriptor> = net.others(me).collect();
    let wanted = pool_size - 1;
    if wanted > candidates.len() {
        return Err(PoolError::NotEnoughNodes {
            requested: wanted,
            available: candidates.len(),
        });
    }

    let mut members: Vec<NodeDescriptor> = rand::seq::index::sample(rng, candidates.len(), wanted)
        .into_iter()
        .map(|i| candidates[i].clone())
        .collect();
    members.push(myself);

    Pool::new(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;
    use std::collections::HashSet;

    fn net(n: u32) -> NetConfig {
        NetConfig::new(
            (1..=n)
                .map(|i| NodeDescriptor {
                    number: NodeNumber::new(i),
                    public_key: String::new(),
                    udp_addr: format!("127.0.0.1:{}", 20000 + i).parse().unwrap(),
                    http_url: format!("http://127.0.0.1:{}", 30000 + i),
                })
                .collect(),
        )
        .unwrap()
    }

    #[rstest]
    #[case(SizePolicy::Size(5), 20, 5)]
    #[case(SizePolicy::Size(50), 20, 20)]
    #[case(SizePolicy::Percentage(60.0), 5, 3)]
    #[case(SizePolicy::Percentage(50.0), 5, 3)]
    #[case(SizePolicy::Percentage(100.0), 7, 7)]
    #[case(SizePolicy::Percentage(1.0), 7, 1)]
    #[case(SizePolicy::Percentage(250.0), 4, 4)]
    fn test_size_policy_resolution(
        #[case] policy: SizePolicy,
        #[case] total: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(compute_pool_size(&policy, total).unwrap(), expected);
    }

    #[rstest]
    #[case(SizePolicy::Size(0), 10)]
    #[case(SizePolicy::Percentage(0.0), 10)]
    #[case(SizePolicy::Size(3), 0)]
    fn test_zero_size_is_error(#[case] policy: SizePolicy, #[case] total: usize) {
        assert_eq!(
            compute_quorum_size(&policy, total),
            Err(PoolError::ZeroSize { what: "quorum" })
        );
    }

    #[test]
    fn test_invalid_percentage_rejected() {
        assert!(matches!(
            compute_pool_size(&SizePolicy::Percentage(f64::NAN), 10),
            Err(PoolError::InvalidPolicy { .. })
        ));
        assert!(matches!(
            compute_pool_size(&SizePolicy::Percentage(-5.0), 10),
            Err(PoolError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn test_size_policy_json_shape() {
        let size: SizePolicy = serde_json::from_str(r#"{"size": 5}"#).unwrap();
        let pct: SizePolicy = serde_json::from_str(r#"{"percentage": 60}"#).unwrap();
        assert_eq!(size, SizePolicy::Size(5));
        assert_eq!(pct, SizePolicy::Percentage(60.0));
    }

    #[test]
    fn test_pool_of_five_from_twenty_with_quorum_three() {
        let net = net(20);
        let me = NodeNumber::new(7);
        let limits = SizeLimits {
            max_pool_size: 20,
            max_quorum_size: 20,
        };

        let (pool_size, quorum) = resolve_sizes(
            &SizePolicy::Size(5),
            &SizePolicy::Percentage(60.0),
            limits,
            net.len(),
        )
        .unwrap();
        assert_eq!((pool_size, quorum), (5, 3));

        let pool = select_pool(&net, me, pool_size, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.members().last().unwrap().number, me);
        let distinct: HashSet<_> = pool.numbers().into_iter().collect();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn test_limits_enforced() {
        let limits = SizeLimits {
            max_pool_size: 4,
            max_quorum_size: 2,
        };
        assert_eq!(
            resolve_sizes(&SizePolicy::Size(5), &SizePolicy::Size(1), limits, 10),
            Err(PoolError::ExceedsLimit {
                what: "pool",
                requested: 5,
                limit: 4
            })
        );
        assert_eq!(
            resolve_sizes(&SizePolicy::Size(4), &SizePolicy::Size(3), limits, 10),
            Err(PoolError::ExceedsLimit {
                what: "quorum",
                requested: 3,
                limit: 2
            })
        );
    }

    #[test]
    fn test_pool_rejects_duplicates_and_unknown_nodes() {
        let net = net(3);
        let one = net.get(NodeNumber::new(1)).unwrap().clone();
        assert_eq!(
            Pool::new(vec![one.clone(), one]),
            Err(PoolError::DuplicateMember(NodeNumber::new(1)))
        );
        assert_eq!(
            Pool::from_numbers(&[NodeNumber::new(1), NodeNumber::new(9)], &net),
            Err(PoolError::UnknownNode(NodeNumber::new(9)))
        );
    }

    #[test]
    fn test_pool_positions() {
        let net = net(3);
        let pool = Pool::from_numbers(&[NodeNumber::new(3), NodeNumber::new(1)], &net).unwrap();
        assert_eq!(pool.position(NodeNumber::new(3)), Some(0));
        assert_eq!(pool.position(NodeNumber::new(1)), Some(1));
        assert_eq!(pool.position(NodeNumber::new(2)), None);
        assert_eq!(pool.others(NodeNumber::new(1)).count(), 1);
    }

    #[test]
    fn test_not_enough_nodes() {
        let net = net(3);
        assert_eq!(
            select_pool(&net, NodeNumber::new(1), 4, &mut rand::rng()),
            Err(PoolError::NotEnoughNodes {
                requested: 3,
                available: 2
            })
        );
    }

    proptest! {
        #[test]
        fn prop_valid_policies_respect_bounds(
            total in 1usize..200,
            pool_pct in 0.5f64..=100.0,
            quorum_pct in 0.5f64..=100.0,
        ) {
            let pool = compute_pool_size(&SizePolicy::Percentage(pool_pct), total).unwrap();
            let quorum = compute_quorum_size(&SizePolicy::Percentage(quorum_pct), pool).unwrap();
            prop_assert!(1 <= quorum);
            prop_assert!(quorum <= pool);
            prop_assert!(pool <= total);
        }

        #[test]
        fn prop_selection_is_unique_and_includes_self(
            total in 1u32..40,
            me_seed in any::<u32>(),
            size_seed in any::<usize>(),
            rng_seed in any::<u64>(),
        ) {
            let net = net(total);
            let me = NodeNumber::new(me_seed % total + 1);
            let pool_size = size_seed % total as usize + 1;

            let pool = select_pool(&net, me, pool_size, &mut StdRng::seed_from_u64(rng_seed)).unwrap();
            let numbers = pool.numbers();
            let distinct: HashSet<_> = numbers.iter().copied().collect();

            prop_assert_eq!(numbers.len(), pool_size);
            prop_assert_eq!(distinct.len(), pool_size);
            prop_assert_eq!(numbers.iter().filter(|n| **n == me).count(), 1);
        }
    }
}
