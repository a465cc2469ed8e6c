//! Fault injection policy
//!
//! Decides, per envelope, whether the fabric drops, duplicates or delays it:
//! - Partitions and isolated nodes
//! - Random loss
//! - Duplication
//! - Delay (fixed, uniform or heavy-tailed)
//!
//! Every decision is drawn from one seeded RNG, so the same seed and the same
//! sequence of `decide` calls always yields the same verdicts.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raftsim_core::NodeId;

/// Delay distribution type
#[derive(Clone, Debug, PartialEq, Default)]
pub enum DelayDistribution {
    /// Immediate delivery
    #[default]
    Zero,
    /// Constant delay
    Fixed(Duration),
    /// Uniform over `[min, max]`
    Uniform { min: Duration, max: Duration },
    /// Pareto distribution (heavy tail), capped
    Pareto {
        scale_ms: f64,
        shape: f64,
        cap: Duration,
    },
}

impl DelayDistribution {
    /// Sample a delay value
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        match self {
            DelayDistribution::Zero => Duration::ZERO,
            DelayDistribution::Fixed(delay) => *delay,
            DelayDistribution::Uniform { min, max } => {
                if max <= min {
                    return *min;
                }
                let micros = |d: &Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
                let dist = Uniform::new_inclusive(micros(min), micros(max));
                Duration::from_micros(dist.sample(rng))
            }
            DelayDistribution::Pareto {
                scale_ms,
                shape,
                cap,
            } => {
                let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                let value = scale_ms / u.powf(1.0 / shape.max(f64::EPSILON));
                let capped = value.min(cap.as_secs_f64() * 1000.0).max(0.0);
                Duration::from_secs_f64(capped / 1000.0)
            }
        }
    }
}

/// Network fault configuration
#[derive(Clone, Debug, PartialEq)]
pub struct FaultConfig {
    /// Drop probability (0.0 - 1.0)
    pub drop_rate: f64,
    /// Duplicate probability (0.0 - 1.0)
    pub duplicate_rate: f64,
    /// Delay applied to each delivered copy
    pub delay: DelayDistribution,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::reliable()
    }
}

impl FaultConfig {
    /// No loss, no duplication, immediate delivery
    pub fn reliable() -> Self {
        FaultConfig {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            delay: DelayDistribution::Zero,
        }
    }

    /// Mildly unreliable network
    pub fn lossy() -> Self {
        FaultConfig {
            drop_rate: 0.05,
            duplicate_rate: 0.01,
            delay: DelayDistribution::Uniform {
                min: Duration::from_millis(1),
                max: Duration::from_millis(20),
            },
        }
    }

    /// Hostile network conditions
    pub fn hostile() -> Self {
        FaultConfig {
            drop_rate: 0.3,
            duplicate_rate: 0.05,
            delay: DelayDistribution::Pareto {
                scale_ms: 5.0,
                shape: 1.5,
                cap: Duration::from_millis(250),
            },
        }
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = clamp_rate(rate);
        self
    }

    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = clamp_rate(rate);
        self
    }

    pub fn with_delay(mut self, delay: DelayDistribution) -> Self {
        self.delay = delay;
        self
    }

    fn normalized(mut self) -> Self {
        self.drop_rate = clamp_rate(self.drop_rate);
        self.duplicate_rate = clamp_rate(self.duplicate_rate);
        self
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

/// Directed per-link override of the global drop rate and delay
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LinkFaults {
    pub drop_rate: f64,
    pub delay: DelayDistribution,
}

/// Why an envelope was not delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Sender and receiver are in different partition groups
    Partitioned,
    /// Sender or receiver is isolated from everyone
    Isolated,
    /// Random loss
    Random,
    /// Receiver mailbox was full
    MailboxFull,
    /// Receiver stopped reading its mailbox
    MailboxClosed,
    /// The fabric has been shut down
    Closed,
}

/// Outcome of one policy decision
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Drop(DropReason),
    /// Deliver one copy per delay
    Deliver(Vec<Duration>),
}

struct PolicyState {
    config: FaultConfig,
    /// Unordered blocked pairs, stored as (min, max)
    partitions: HashSet<(NodeId, NodeId)>,
    isolated: HashSet<NodeId>,
    links: HashMap<(NodeId, NodeId), LinkFaults>,
    rng: StdRng,
}

/// Shared, seedable fault policy.
///
/// All mutations take the same lock as `decide`, so a decision always sees
/// either the state before a mutation or the state after it.
pub struct FaultPolicy {
    state: Mutex<PolicyState>,
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl FaultPolicy {
    /// Create a policy with seed
    pub fn new(config: FaultConfig, seed: u64) -> Self {
        FaultPolicy {
            state: Mutex::new(PolicyState {
                config: config.normalized(),
                partitions: HashSet::new(),
                isolated: HashSet::new(),
                links: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Reliable policy with seed
    pub fn seeded(seed: u64) -> Self {
        Self::new(FaultConfig::reliable(), seed)
    }

    /// Snapshot of the global configuration
    pub fn config(&self) -> FaultConfig {
        self.state.lock().config.clone()
    }

    pub fn set_config(&self, config: FaultConfig) {
        self.state.lock().config = config.normalized();
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.state.lock().config.drop_rate = clamp_rate(rate);
    }

    pub fn set_duplicate_rate(&self, rate: f64) {
        self.state.lock().config.duplicate_rate = clamp_rate(rate);
    }

    /// Uniform delay over `[min, max]`
    pub fn set_delay_range(&self, min: Duration, max: Duration) {
        self.set_delay(DelayDistribution::Uniform { min, max });
    }

    pub fn set_delay(&self, delay: DelayDistribution) {
        self.state.lock().config.delay = delay;
    }

    /// Restart the decision sequence from a new seed
    pub fn reseed(&self, seed: u64) {
        self.state.lock().rng = StdRng::seed_from_u64(seed);
    }

    /// Replace the partition set so that nodes in different groups cannot
    /// reach each other. Nodes that appear in no group stay reachable.
    pub fn partition<G, I>(&self, groups: G)
    where
        G: IntoIterator<Item = I>,
        I: IntoIterator<Item = NodeId>,
    {
        let groups: Vec<Vec<NodeId>> = groups
            .into_iter()
            .map(|g| g.into_iter().collect())
            .collect();

        let mut blocked = HashSet::new();
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for a in left {
                    for b in right {
                        if a != b {
                            blocked.insert(pair(*a, *b));
                        }
                    }
                }
            }
        }

        tracing::debug!(groups = groups.len(), blocked_pairs = blocked.len(), "partition applied");
        self.state.lock().partitions = blocked;
    }

    /// Clear partitions and isolation. Rates and link overrides are kept.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.partitions.clear();
        state.isolated.clear();
        tracing::debug!("partitions healed");
    }

    /// Cut a node off from every other node
    pub fn isolate(&self, id: NodeId) {
        self.state.lock().isolated.insert(id);
    }

    pub fn rejoin(&self, id: NodeId) {
        self.state.lock().isolated.remove(&id);
    }

    pub fn set_link_faults(&self, from: NodeId, to: NodeId, faults: LinkFaults) {
        let faults = LinkFaults {
            drop_rate: clamp_rate(faults.drop_rate),
            delay: faults.delay,
        };
        self.state.lock().links.insert((from, to), faults);
    }

    pub fn clear_link_faults(&self) {
        self.state.lock().links.clear();
    }

    /// Whether partitions and isolation currently allow `from -> to`
    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        let state = self.state.lock();
        !state.isolated.contains(&from)
            && !state.isolated.contains(&to)
            && !state.partitions.contains(&pair(from, to))
    }

    /// Decide the fate of one envelope from `from` to `to`
    pub fn decide(&self, from: NodeId, to: NodeId) -> Verdict {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.isolated.contains(&from) || state.isolated.contains(&to) {
            return Verdict::Drop(DropReason::Isolated);
        }
        if state.partitions.contains(&pair(from, to)) {
            return Verdict::Drop(DropReason::Partitioned);
        }

        let (drop_rate, delay) = match state.links.get(&(from, to)) {
            Some(link) => (link.drop_rate, &link.delay),
            None => (state.config.drop_rate, &state.config.delay),
        };

        if state.rng.gen::<f64>() < drop_rate {
            return Verdict::Drop(DropReason::Random);
        }

        let copies = if state.rng.gen::<f64>() < state.config.duplicate_rate {
            2
        } else {
            1
        };

        let delays = (0..copies).map(|_| delay.sample(&mut state.rng)).collect();
        Verdict::Deliver(delays)
    }
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::seeded(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_reliable_policy_delivers_once_immediately() {
        let policy = FaultPolicy::seeded(1);
        for _ in 0..100 {
            assert_eq!(
                policy.decide(NodeId(1), NodeId(2)),
                Verdict::Deliver(vec![Duration::ZERO])
            );
        }
    }

    #[test]
    fn test_partition_blocks_cross_group_only() {
        let policy = FaultPolicy::seeded(7);
        policy.partition([ids(&[1, 2]), ids(&[3, 4, 5])]);

        assert!(policy.is_reachable(NodeId(1), NodeId(2)));
        assert!(policy.is_reachable(NodeId(4), NodeId(5)));
        assert!(!policy.is_reachable(NodeId(1), NodeId(3)));
        assert!(!policy.is_reachable(NodeId(5), NodeId(2)));
        // Unlisted nodes keep full reachability
        assert!(policy.is_reachable(NodeId(6), NodeId(1)));

        assert_eq!(
            policy.decide(NodeId(2), NodeId(4)),
            Verdict::Drop(DropReason::Partitioned)
        );
    }

    #[test]
    fn test_partition_replaces_previous_set() {
        let policy = FaultPolicy::seeded(7);
        policy.partition([ids(&[1]), ids(&[2, 3])]);
        policy.partition([ids(&[1, 2]), ids(&[3])]);

        assert!(policy.is_reachable(NodeId(1), NodeId(2)));
        assert!(!policy.is_reachable(NodeId(2), NodeId(3)));
    }

    #[test]
    fn test_heal_clears_partitions_and_isolation() {
        let policy = FaultPolicy::seeded(7);
        policy.set_drop_rate(0.5);
        policy.partition([ids(&[1]), ids(&[2])]);
        policy.isolate(NodeId(3));
        policy.heal();

        assert!(policy.is_reachable(NodeId(1), NodeId(2)));
        assert!(policy.is_reachable(NodeId(3), NodeId(1)));
        assert_eq!(policy.config().drop_rate, 0.5);
    }

    #[test]
    fn test_isolate_and_rejoin() {
        let policy = FaultPolicy::seeded(7);
        policy.isolate(NodeId(2));
        assert_eq!(
            policy.decide(NodeId(1), NodeId(2)),
            Verdict::Drop(DropReason::Isolated)
        );
        assert_eq!(
            policy.decide(NodeId(2), NodeId(3)),
            Verdict::Drop(DropReason::Isolated)
        );

        policy.rejoin(NodeId(2));
        assert!(policy.is_reachable(NodeId(1), NodeId(2)));
    }

    #[test]
    fn test_full_drop_and_full_duplicate() {
        let policy = FaultPolicy::new(FaultConfig::reliable().with_drop_rate(1.0), 3);
        assert_eq!(
            policy.decide(NodeId(1), NodeId(2)),
            Verdict::Drop(DropReason::Random)
        );

        policy.set_config(FaultConfig::reliable().with_duplicate_rate(1.0));
        assert_eq!(
            policy.decide(NodeId(1), NodeId(2)),
            Verdict::Deliver(vec![Duration::ZERO, Duration::ZERO])
        );
    }

    #[test]
    fn test_rates_are_clamped() {
        let policy = FaultPolicy::seeded(0);
        policy.set_drop_rate(3.0);
        assert_eq!(policy.config().drop_rate, 1.0);
        policy.set_duplicate_rate(-1.0);
        assert_eq!(policy.config().duplicate_rate, 0.0);
        policy.set_drop_rate(f64::NAN);
        assert_eq!(policy.config().drop_rate, 0.0);
    }

    #[test]
    fn test_uniform_delay_within_range() {
        let policy = FaultPolicy::seeded(11);
        policy.set_delay_range(Duration::from_millis(5), Duration::from_millis(15));

        for _ in 0..500 {
            let Verdict::Deliver(delays) = policy.decide(NodeId(1), NodeId(2)) else {
                panic!("reliable policy dropped");
            };
            for d in delays {
                assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(15));
            }
        }
    }

    #[test]
    fn test_uniform_delay_saturates_huge_bounds() {
        let min = Duration::from_micros(u64::MAX - 10);
        let delay = DelayDistribution::Uniform {
            min,
            max: Duration::MAX,
        };
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let d = delay.sample(&mut rng);
            assert!(d >= min && d <= Duration::from_micros(u64::MAX));
        }
    }

    #[test]
    fn test_link_override_applies_to_one_direction() {
        let policy = FaultPolicy::seeded(5);
        policy.set_link_faults(
            NodeId(1),
            NodeId(2),
            LinkFaults {
                drop_rate: 1.0,
                delay: DelayDistribution::Zero,
            },
        );

        assert_eq!(
            policy.decide(NodeId(1), NodeId(2)),
            Verdict::Drop(DropReason::Random)
        );
        assert!(matches!(
            policy.decide(NodeId(2), NodeId(1)),
            Verdict::Deliver(_)
        ));

        policy.clear_link_faults();
        assert!(matches!(
            policy.decide(NodeId(1), NodeId(2)),
            Verdict::Deliver(_)
        ));
    }

    #[test]
    fn test_pareto_delay_is_capped() {
        let mut rng = StdRng::seed_from_u64(42);
        let pareto = DelayDistribution::Pareto {
            scale_ms: 10.0,
            shape: 1.1,
            cap: Duration::from_millis(100),
        };

        let samples: Vec<Duration> = (0..1000).map(|_| pareto.sample(&mut rng)).collect();
        assert!(samples.iter().all(|d| *d <= Duration::from_millis(100)));
        assert!(samples.iter().all(|d| *d >= Duration::from_millis(9)));
    }

    fn arb_config() -> impl Strategy<Value = FaultConfig> {
        (0.0f64..=1.0, 0.0f64..=1.0, 0u64..50).prop_map(|(drop, dup, max_ms)| {
            FaultConfig::reliable()
                .with_drop_rate(drop)
                .with_duplicate_rate(dup)
                .with_delay(DelayDistribution::Uniform {
                    min: Duration::ZERO,
                    max: Duration::from_millis(max_ms),
                })
        })
    }

    proptest! {
        #[test]
        fn test_same_seed_same_verdicts(
            seed in any::<u64>(),
            config in arb_config(),
            sends in proptest::collection::vec((1u64..6, 1u64..6), 1..200),
        ) {
            let a = FaultPolicy::new(config.clone(), seed);
            let b = FaultPolicy::new(config, seed);
            for (from, to) in sends {
                prop_assert_eq!(
                    a.decide(NodeId(from), NodeId(to)),
                    b.decide(NodeId(from), NodeId(to))
                );
            }
        }

        #[test]
        fn test_reachability_matches_group_membership(
            assignment in proptest::collection::vec(0usize..3, 2..8),
        ) {
            let mut groups: Vec<Vec<NodeId>> = vec![Vec::new(); 3];
            for (i, g) in assignment.iter().enumerate() {
                groups[*g].push(NodeId(i as u64 + 1));
            }
            let policy = FaultPolicy::seeded(0);
            policy.partition(groups);

            for (i, gi) in assignment.iter().enumerate() {
                for (j, gj) in assignment.iter().enumerate() {
                    let (a, b) = (NodeId(i as u64 + 1), NodeId(j as u64 + 1));
                    prop_assert_eq!(policy.is_reachable(a, b), gi == gj);
                    prop_assert_eq!(policy.is_reachable(a, b), policy.is_reachable(b, a));
                }
            }
        }
    }
}
