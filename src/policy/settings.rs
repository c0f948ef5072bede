use std::{fmt, ops::RangeInclusive};

use serde::{Deserialize, Serialize};

/// Largest weight.
pub const PPV_MAX_WEIGHT: u32 = u32::MAX;
/// Largest load.
pub const PPV_MAX_LOAD: u32 = u32::MAX;
/// Largest load degradation.
pub const PPV_MAX_LOAD_DEGRADATION: u32 = u32::MAX;
/// Largest load distance penalty factor.
pub const PPV_MAX_LOAD_DPF: u32 = u32::MAX;
/// Largest weight distance penalty factor.
pub const PPV_MAX_WEIGHT_DPF: u32 = u32::MAX;

const WEIGHT_RANGE: RangeInclusive<u32> = 0..=PPV_MAX_WEIGHT;
const LOAD_RANGE: RangeInclusive<u32> = 0..=PPV_MAX_LOAD;
const LOAD_DEGRADATION_RANGE: RangeInclusive<u32> = 0..=PPV_MAX_LOAD_DEGRADATION;

/// Load balancing parameters announced by a pool element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolPolicySettings {
    /// Policy type code, see [`PoolPolicy::type_code`](super::PoolPolicy::type_code).
    pub policy_type: u32,
    /// Weight or priority.
    pub weight: u32,
    /// Current load, `PPV_MAX_LOAD` is 100%.
    pub load: u32,
    /// Load increase per selection.
    pub load_degradation: u32,
    /// Load distance penalty factor.
    pub load_dpf: u32,
    /// Weight distance penalty factor.
    pub weight_dpf: u32,
    /// Distance between the element and the registrar.
    pub distance: u32,
}

impl PoolPolicySettings {
    /// Creates zeroed settings for a policy type.
    pub fn new(policy_type: u32) -> Self {
        PoolPolicySettings {
            policy_type,
            ..Default::default()
        }
    }

    /// Resets all fields to zero.
    pub fn clear(&mut self) {
        *self = PoolPolicySettings::default();
    }

    /// Returns `true` if any policy parameter differs.
    ///
    /// The policy type is not compared.
    pub fn differs(&self, other: &PoolPolicySettings) -> bool {
        self.weight != other.weight
            || self.load != other.load
            || self.load_degradation != other.load_degradation
            || self.load_dpf != other.load_dpf
            || self.weight_dpf != other.weight_dpf
            || self.distance != other.distance
    }

    /// Checks the value ranges of weight, load and load degradation.
    pub fn is_valid(&self) -> bool {
        WEIGHT_RANGE.contains(&self.weight)
            && LOAD_RANGE.contains(&self.load)
            && LOAD_DEGRADATION_RANGE.contains(&self.load_degradation)
    }

    /// Returns `true` if these settings can be used with the given policy type.
    pub fn adapt(&self, policy_type: u32) -> bool {
        self.policy_type == policy_type
    }
}

impl fmt::Display for PoolPolicySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t=${:02x} [w={} l={:.3}%(${:08x}) ldeg={:.3}%(${:08x}) ldpf={:.6}(${:08x}) wdpf={:.6}(${:08x}) dist={}]",
            self.policy_type,
            self.weight,
            100.0 * f64::from(self.load) / f64::from(PPV_MAX_LOAD),
            self.load,
            100.0 * f64::from(self.load_degradation) / f64::from(PPV_MAX_LOAD_DEGRADATION),
            self.load_degradation,
            f64::from(self.load_dpf) / f64::from(PPV_MAX_LOAD_DPF),
            self.load_dpf,
            f64::from(self.weight_dpf) / f64::from(PPV_MAX_WEIGHT_DPF),
            self.weight_dpf,
            self.distance,
        )
    }
}
