//! Pool policies.
//!
//! A pool policy decides in which order a pool hands out its elements. Every policy is one of
//! two kinds:
//!
//! - **Sorting order** policies keep the pool's selection index ordered by a policy key, hand
//!   out the first elements and then move them back with an updated key. Round robin,
//!   priority and the least used family work this way.
//! - **Value tree** policies give every element a selection value and draw elements without
//!   replacement with a probability proportional to their value. The random and randomized
//!   least used families work this way.
//!
//! The actual selection loop lives in [`PoolNode`](crate::pool::PoolNode), policies only supply
//! the keys, values and per-element state transitions.

mod settings;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use settings::*;

use crate::element::{PoolElementIdentifier, PoolElementNode};

/// Policy type code of round robin.
pub const PPT_ROUNDROBIN: u32 = 0x0000_0001;
/// Policy type code of weighted round robin.
pub const PPT_WEIGHTED_ROUNDROBIN: u32 = 0x0000_0002;
/// Policy type code of random.
pub const PPT_RANDOM: u32 = 0x0000_0003;
/// Policy type code of weighted random.
pub const PPT_WEIGHTED_RANDOM: u32 = 0x0000_0004;
/// Policy type code of priority.
pub const PPT_PRIORITY: u32 = 0x0000_0005;
/// Policy type code of least used.
pub const PPT_LEASTUSED: u32 = 0x4000_0001;
/// Policy type code of least used with degradation.
pub const PPT_LEASTUSED_DEGRADATION: u32 = 0x4000_0002;
/// Policy type code of priority least used.
pub const PPT_PRIORITY_LEASTUSED: u32 = 0x4000_0003;
/// Policy type code of randomized least used.
pub const PPT_RANDOMIZED_LEASTUSED: u32 = 0x4000_0004;
/// Policy type code of randomized priority least used.
pub const PPT_RANDOMIZED_PRIORITY_LEASTUSED: u32 = 0xb000_1001;
/// Policy type code of randomized least used with degradation.
pub const PPT_RANDOMIZED_LEASTUSED_DEGRADATION: u32 = 0xb000_1002;
/// Policy type code of priority least used with degradation.
pub const PPT_PRIORITY_LEASTUSED_DEGRADATION: u32 = 0xb000_1003;
/// Policy type code of randomized priority least used with degradation.
pub const PPT_RANDOMIZED_PRIORITY_LEASTUSED_DEGRADATION: u32 = 0xb000_1004;
/// Policy type code of weighted random with distance penalty.
pub const PPT_WEIGHTED_RANDOM_DPF: u32 = 0xb000_2001;
/// Policy type code of least used with distance penalty.
pub const PPT_LEASTUSED_DPF: u32 = 0xb000_2002;
/// Policy type code of least used with degradation and distance penalty.
pub const PPT_LEASTUSED_DEGRADATION_DPF: u32 = 0xb000_2003;
/// Policy type code of priority least used with distance penalty. Not supported.
pub const PPT_PRIORITY_LEASTUSED_DPF: u32 = 0xb000_2004;
/// Policy type code of priority least used with degradation and distance penalty. Not
/// supported.
pub const PPT_PRIORITY_LEASTUSED_DEGRADATION_DPF: u32 = 0xb000_2005;

/// First sequence number handed out by a pool.
pub const SEQ_NUMBER_START: u32 = 0;

/// How a policy walks its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionMethod {
    /// Take the first elements of the selection index.
    SortingOrder,
    /// Draw elements proportionally to their selection value.
    ValueTree,
}

/// Ordering key of an element in its pool's selection index.
///
/// Keys compare field by field. The element identifier comes last, so keys of distinct
/// elements never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectionKey {
    primary: u64,
    secondary: u64,
    seq: u64,
    identifier: PoolElementIdentifier,
}

impl SelectionKey {
    fn new(primary: u64, secondary: u64, seq: u32, identifier: PoolElementIdentifier) -> Self {
        SelectionKey {
            primary,
            secondary,
            seq: u64::from(seq),
            identifier,
        }
    }

    /// Identifier of the element this key belongs to.
    pub fn identifier(&self) -> PoolElementIdentifier {
        self.identifier
    }
}

/// The supported pool policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolPolicy {
    /// Elements in turn.
    RoundRobin,
    /// Elements in turn, each `weight` times per round.
    WeightedRoundRobin,
    /// Uniformly random.
    Random,
    /// Random, proportional to weight.
    WeightedRandom,
    /// Random, proportional to weight reduced by distance.
    WeightedRandomDpf,
    /// Highest weight first.
    Priority,
    /// Lowest load first.
    LeastUsed,
    /// Lowest load first, with load increased by distance.
    LeastUsedDpf,
    /// Lowest load first, with load increased on every selection.
    LeastUsedDegradation,
    /// Lowest load first, with degradation and distance penalty.
    LeastUsedDegradationDpf,
    /// Lowest sum of load and load degradation first.
    PriorityLeastUsed,
    /// Like priority least used, with degradation.
    PriorityLeastUsedDegradation,
    /// Random, proportional to unused capacity.
    RandomizedLeastUsed,
    /// Random, proportional to unused capacity after degradation.
    RandomizedLeastUsedDegradation,
    /// Random, proportional to unused capacity after load degradation.
    RandomizedPriorityLeastUsed,
    /// Random, proportional to unused capacity after load degradation and degradation.
    RandomizedPriorityLeastUsedDegradation,
}

impl PoolPolicy {
    /// All policies, in lookup order.
    pub const ALL: [PoolPolicy; 16] = [
        PoolPolicy::RoundRobin,
        PoolPolicy::WeightedRoundRobin,
        PoolPolicy::Random,
        PoolPolicy::WeightedRandom,
        PoolPolicy::WeightedRandomDpf,
        PoolPolicy::Priority,
        PoolPolicy::LeastUsed,
        PoolPolicy::LeastUsedDpf,
        PoolPolicy::LeastUsedDegradation,
        PoolPolicy::LeastUsedDegradationDpf,
        PoolPolicy::PriorityLeastUsed,
        PoolPolicy::PriorityLeastUsedDegradation,
        PoolPolicy::RandomizedLeastUsed,
        PoolPolicy::RandomizedLeastUsedDegradation,
        PoolPolicy::RandomizedPriorityLeastUsed,
        PoolPolicy::RandomizedPriorityLeastUsedDegradation,
    ];

    /// Looks up a policy by its type code.
    pub fn from_type(policy_type: u32) -> Option<PoolPolicy> {
        PoolPolicy::ALL
            .into_iter()
            .find(|policy| policy.type_code() == policy_type)
    }

    /// Looks up a policy by its name.
    pub fn from_name(name: &str) -> Option<PoolPolicy> {
        PoolPolicy::ALL.into_iter().find(|policy| policy.name() == name)
    }

    /// Type code carried in policy parameters.
    pub fn type_code(self) -> u32 {
        match self {
            PoolPolicy::RoundRobin => PPT_ROUNDROBIN,
            PoolPolicy::WeightedRoundRobin => PPT_WEIGHTED_ROUNDROBIN,
            PoolPolicy::Random => PPT_RANDOM,
            PoolPolicy::WeightedRandom => PPT_WEIGHTED_RANDOM,
            PoolPolicy::WeightedRandomDpf => PPT_WEIGHTED_RANDOM_DPF,
            PoolPolicy::Priority => PPT_PRIORITY,
            PoolPolicy::LeastUsed => PPT_LEASTUSED,
            PoolPolicy::LeastUsedDpf => PPT_LEASTUSED_DPF,
            PoolPolicy::LeastUsedDegradation => PPT_LEASTUSED_DEGRADATION,
            PoolPolicy::LeastUsedDegradationDpf => PPT_LEASTUSED_DEGRADATION_DPF,
            PoolPolicy::PriorityLeastUsed => PPT_PRIORITY_LEASTUSED,
            PoolPolicy::PriorityLeastUsedDegradation => PPT_PRIORITY_LEASTUSED_DEGRADATION,
            PoolPolicy::RandomizedLeastUsed => PPT_RANDOMIZED_LEASTUSED,
            PoolPolicy::RandomizedLeastUsedDegradation => PPT_RANDOMIZED_LEASTUSED_DEGRADATION,
            PoolPolicy::RandomizedPriorityLeastUsed => PPT_RANDOMIZED_PRIORITY_LEASTUSED,
            PoolPolicy::RandomizedPriorityLeastUsedDegradation => {
                PPT_RANDOMIZED_PRIORITY_LEASTUSED_DEGRADATION
            }
        }
    }

    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            PoolPolicy::RoundRobin => "RoundRobin",
            PoolPolicy::WeightedRoundRobin => "WeightedRoundRobin",
            PoolPolicy::Random => "Random",
            PoolPolicy::WeightedRandom => "WeightedRandom",
            PoolPolicy::WeightedRandomDpf => "WeightedRandomDPF",
            PoolPolicy::Priority => "Priority",
            PoolPolicy::LeastUsed => "LeastUsed",
            PoolPolicy::LeastUsedDpf => "LeastUsedDPF",
            PoolPolicy::LeastUsedDegradation => "LeastUsedDegradation",
            PoolPolicy::LeastUsedDegradationDpf => "LeastUsedDegradationDPF",
            PoolPolicy::PriorityLeastUsed => "PriorityLeastUsed",
            PoolPolicy::PriorityLeastUsedDegradation => "PriorityLeastUsedDegradation",
            PoolPolicy::RandomizedLeastUsed => "RandomizedLeastUsed",
            PoolPolicy::RandomizedLeastUsedDegradation => "RandomizedLeastUsedDegradation",
            PoolPolicy::RandomizedPriorityLeastUsed => "RandomizedPriorityLeastUsed",
            PoolPolicy::RandomizedPriorityLeastUsedDegradation => {
                "RandomizedPriorityLeastUsedDegradation"
            }
        }
    }

    /// Number of selected elements whose state is updated per selection when the caller
    /// does not limit it.
    pub fn default_max_increment(self) -> usize {
        match self {
            PoolPolicy::Random | PoolPolicy::WeightedRandom | PoolPolicy::WeightedRandomDpf => 0,
            _ => 1,
        }
    }

    /// Returns `true` for policies that take the element's distance into account.
    pub fn uses_distance(self) -> bool {
        matches!(
            self,
            PoolPolicy::WeightedRandomDpf
                | PoolPolicy::LeastUsedDpf
                | PoolPolicy::LeastUsedDegradationDpf
        )
    }

    /// Selection strategy of the policy.
    pub fn selection_method(self) -> SelectionMethod {
        match self {
            PoolPolicy::Random
            | PoolPolicy::WeightedRandom
            | PoolPolicy::WeightedRandomDpf
            | PoolPolicy::RandomizedLeastUsed
            | PoolPolicy::RandomizedLeastUsedDegradation
            | PoolPolicy::RandomizedPriorityLeastUsed
            | PoolPolicy::RandomizedPriorityLeastUsedDegradation => SelectionMethod::ValueTree,
            _ => SelectionMethod::SortingOrder,
        }
    }

    /// Position of an element in the selection index.
    pub fn selection_key(self, node: &PoolElementNode) -> SelectionKey {
        let pps = &node.policy_settings;
        let id = node.identifier;
        let seq = node.seq_number;
        match self {
            PoolPolicy::RoundRobin => SelectionKey::new(0, 0, seq, id),
            PoolPolicy::WeightedRoundRobin => SelectionKey::new(
                u64::from(node.round_counter),
                u64::from(node.virtual_counter),
                seq,
                id,
            ),
            PoolPolicy::Priority => {
                SelectionKey::new(u64::from(PPV_MAX_WEIGHT - pps.weight), 0, seq, id)
            }
            PoolPolicy::LeastUsed => SelectionKey::new(u64::from(pps.load), 0, seq, id),
            PoolPolicy::LeastUsedDpf => {
                let penalty = load_penalty(pps.distance, pps.load_dpf);
                let value = rint_capped(f64::from(pps.load) + penalty, PPV_MAX_LOAD);
                SelectionKey::new(value, 0, seq, id)
            }
            PoolPolicy::LeastUsedDegradation => {
                SelectionKey::new(get_sum(pps.load, node.degradation, 0), 0, seq, id)
            }
            PoolPolicy::LeastUsedDegradationDpf => {
                let penalty = load_penalty(pps.distance, pps.load_dpf);
                let value = rint_capped(
                    f64::from(pps.load) + f64::from(node.degradation) + penalty,
                    PPV_MAX_LOAD,
                );
                SelectionKey::new(value, 0, seq, id)
            }
            PoolPolicy::PriorityLeastUsed => {
                SelectionKey::new(get_sum(pps.load, pps.load_degradation, 0), 0, seq, id)
            }
            PoolPolicy::PriorityLeastUsedDegradation => SelectionKey::new(
                get_sum(pps.load, pps.load_degradation, node.degradation),
                0,
                seq,
                id,
            ),
            PoolPolicy::Random
            | PoolPolicy::WeightedRandom
            | PoolPolicy::WeightedRandomDpf
            | PoolPolicy::RandomizedLeastUsed
            | PoolPolicy::RandomizedLeastUsedDegradation
            | PoolPolicy::RandomizedPriorityLeastUsed
            | PoolPolicy::RandomizedPriorityLeastUsedDegradation => {
                SelectionKey::new(0, 0, 0, id)
            }
        }
    }

    /// Draw weight of an element for value tree policies, `0` for sorting order policies.
    pub fn selection_value(self, node: &PoolElementNode) -> u64 {
        let pps = &node.policy_settings;
        match self {
            PoolPolicy::Random => 1,
            PoolPolicy::WeightedRandom => u64::from(pps.weight),
            PoolPolicy::WeightedRandomDpf => {
                let dpf = f64::from(pps.distance)
                    * (f64::from(pps.weight_dpf) / f64::from(PPV_MAX_WEIGHT_DPF));
                let value = i64::from(pps.weight) - (f64::from(pps.weight) * dpf).round_ties_even() as i64;
                if value < 0 {
                    1
                } else {
                    (value as u64).min(u64::from(PPV_MAX_WEIGHT))
                }
            }
            PoolPolicy::RandomizedLeastUsed => value_fraction(PPV_MAX_LOAD, pps.load, 0, 0),
            PoolPolicy::RandomizedLeastUsedDegradation => {
                value_fraction(PPV_MAX_LOAD, pps.load, node.degradation, 0)
            }
            PoolPolicy::RandomizedPriorityLeastUsed => {
                value_fraction(PPV_MAX_LOAD, pps.load, pps.load_degradation, 0)
            }
            PoolPolicy::RandomizedPriorityLeastUsedDegradation => value_fraction(
                PPV_MAX_LOAD,
                pps.load,
                pps.load_degradation,
                node.degradation,
            ),
            _ => 0,
        }
    }

    /// Initializes policy state of an element joining a pool.
    ///
    /// `current_round` is the round counter of the pool's first element in selection order.
    pub(crate) fn init(self, node: &mut PoolElementNode, current_round: Option<u32>) {
        if self == PoolPolicy::WeightedRoundRobin {
            node.round_counter = current_round.unwrap_or(SEQ_NUMBER_START);
            node.virtual_counter = node.policy_settings.weight;
        }
    }

    /// Advances policy state of a selected element.
    pub(crate) fn update(self, node: &mut PoolElementNode) {
        match self {
            PoolPolicy::WeightedRoundRobin => {
                if node.virtual_counter > 1 {
                    node.virtual_counter -= 1;
                } else {
                    node.round_counter = node.round_counter.wrapping_add(1);
                    node.virtual_counter = node.policy_settings.weight;
                }
            }
            PoolPolicy::LeastUsedDegradation
            | PoolPolicy::LeastUsedDegradationDpf
            | PoolPolicy::PriorityLeastUsedDegradation => {
                node.degradation = get_sum(
                    node.degradation,
                    node.policy_settings.load_degradation,
                    0,
                ) as u32;
            }
            _ => {}
        }
    }

    /// Returns `true` if the policy runs a preparation step before each selection.
    pub(crate) fn needs_prepare(self) -> bool {
        self == PoolPolicy::WeightedRoundRobin
    }
}

impl fmt::Display for PoolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for PoolPolicy {
    type Error = crate::error::RegistrarError;

    fn try_from(policy_type: u32) -> Result<Self, Self::Error> {
        PoolPolicy::from_type(policy_type).ok_or(crate::error::RegistrarError::InvalidPoolPolicy)
    }
}

/// Sum of three values, saturated to the load range.
fn get_sum(v1: u32, v2: u32, v3: u32) -> u64 {
    (u64::from(v1) + u64::from(v2) + u64::from(v3)).min(u64::from(PPV_MAX_LOAD))
}

/// `base - v1 - v2 - v3`, clamped to `1..=PPV_MAX_WEIGHT`.
fn value_fraction(base: u32, v1: u32, v2: u32, v3: u32) -> u64 {
    let v = i64::from(base) - i64::from(v1) - i64::from(v2) - i64::from(v3);
    v.clamp(1, i64::from(PPV_MAX_WEIGHT)) as u64
}

fn load_penalty(distance: u32, load_dpf: u32) -> f64 {
    let dpf = f64::from(distance) * (f64::from(load_dpf) / f64::from(PPV_MAX_LOAD_DPF));
    dpf * f64::from(PPV_MAX_LOAD)
}

fn rint_capped(value: f64, max: u32) -> u64 {
    (value.round_ties_even() as u64).min(u64::from(max))
}
