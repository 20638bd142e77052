//! Pool policies: how a registrar picks pool elements for a pool user.
//!
//! A [`PoolPolicySettings`] value is the policy type plus whichever numeric
//! parameters that type uses. Parameters a type does not use are always
//! zero; [`PoolPolicySettings::normalized`] enforces that and the decoder
//! only ever produces normalized values.

use std::fmt;

use crate::buffer::MessageBuffer;
use crate::error::RspError;
use crate::wire::ParameterType;

/// Every supported policy, keyed by its 32-bit wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PolicyType {
    RoundRobin = 0x0000_0001,
    WeightedRoundRobin = 0x0000_0002,
    Random = 0x0000_0003,
    WeightedRandom = 0x0000_0004,
    Priority = 0x0000_0005,
    LeastUsed = 0x4000_0001,
    LeastUsedDegradation = 0x4000_0002,
    PriorityLeastUsed = 0x4000_0003,
    RandomizedLeastUsed = 0x4000_0004,
    RandomizedPriorityLeastUsed = 0xb000_1001,
    RandomizedLeastUsedDegradation = 0xb000_1002,
    PriorityLeastUsedDegradation = 0xb000_1003,
    RandomizedPriorityLeastUsedDegradation = 0xb000_1004,
    WeightedRandomDpf = 0xb000_2001,
    LeastUsedDpf = 0xb000_2002,
    LeastUsedDegradationDpf = 0xb000_2003,
}

/// One numeric policy parameter, in wire order within a policy TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyParameter {
    /// Weight, or the priority for [`PolicyType::Priority`].
    Weight,
    Load,
    LoadDegradation,
    LoadDpf,
    WeightDpf,
    Distance,
}

use PolicyParameter::*;

impl PolicyType {
    pub const ALL: [PolicyType; 16] = [
        PolicyType::RoundRobin,
        PolicyType::WeightedRoundRobin,
        PolicyType::Random,
        PolicyType::WeightedRandom,
        PolicyType::Priority,
        PolicyType::LeastUsed,
        PolicyType::LeastUsedDegradation,
        PolicyType::PriorityLeastUsed,
        PolicyType::RandomizedLeastUsed,
        PolicyType::RandomizedPriorityLeastUsed,
        PolicyType::RandomizedLeastUsedDegradation,
        PolicyType::PriorityLeastUsedDegradation,
        PolicyType::RandomizedPriorityLeastUsedDegradation,
        PolicyType::WeightedRandomDpf,
        PolicyType::LeastUsedDpf,
        PolicyType::LeastUsedDegradationDpf,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Result<Self, RspError> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.tag() == tag)
            .ok_or(RspError::UnsupportedPoolPolicy)
    }

    /// Parameters that follow the tag on the wire.
    pub fn parameters(self) -> &'static [PolicyParameter] {
        match self {
            PolicyType::RoundRobin | PolicyType::Random => &[],
            PolicyType::WeightedRoundRobin | PolicyType::WeightedRandom | PolicyType::Priority => {
                &[Weight]
            }
            PolicyType::LeastUsed | PolicyType::RandomizedLeastUsed => &[Load],
            PolicyType::LeastUsedDegradation
            | PolicyType::PriorityLeastUsed
            | PolicyType::PriorityLeastUsedDegradation
            | PolicyType::RandomizedLeastUsedDegradation
            | PolicyType::RandomizedPriorityLeastUsed
            | PolicyType::RandomizedPriorityLeastUsedDegradation => &[Load, LoadDegradation],
            PolicyType::WeightedRandomDpf => &[Weight, WeightDpf, Distance],
            PolicyType::LeastUsedDpf => &[Load, LoadDpf, Distance],
            PolicyType::LeastUsedDegradationDpf => &[Load, LoadDegradation, LoadDpf, Distance],
        }
    }

    /// Load-based policies, whose elements must report load changes.
    pub fn is_adaptive(self) -> bool {
        self.parameters().contains(&Load)
    }

    pub fn name(self) -> &'static str {
        match self {
            PolicyType::RoundRobin => "RoundRobin",
            PolicyType::WeightedRoundRobin => "WeightedRoundRobin",
            PolicyType::Random => "Random",
            PolicyType::WeightedRandom => "WeightedRandom",
            PolicyType::Priority => "Priority",
            PolicyType::LeastUsed => "LeastUsed",
            PolicyType::LeastUsedDegradation => "LeastUsedDegradation",
            PolicyType::PriorityLeastUsed => "PriorityLeastUsed",
            PolicyType::RandomizedLeastUsed => "RandomizedLeastUsed",
            PolicyType::RandomizedPriorityLeastUsed => "RandomizedPriorityLeastUsed",
            PolicyType::RandomizedLeastUsedDegradation => "RandomizedLeastUsedDegradation",
            PolicyType::PriorityLeastUsedDegradation => "PriorityLeastUsedDegradation",
            PolicyType::RandomizedPriorityLeastUsedDegradation => {
                "RandomizedPriorityLeastUsedDegradation"
            }
            PolicyType::WeightedRandomDpf => "WeightedRandomDPF",
            PolicyType::LeastUsedDpf => "LeastUsedDPF",
            PolicyType::LeastUsedDegradationDpf => "LeastUsedDegradationDPF",
        }
    }
}

/// Load values are fractions of this maximum.
pub const PPV_MAX_LOAD: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolPolicySettings {
    pub policy_type: PolicyType,
    pub weight: u32,
    pub load: u32,
    pub load_degradation: u32,
    pub load_dpf: u32,
    pub weight_dpf: u32,
    pub distance: u32,
}

impl Default for PoolPolicySettings {
    fn default() -> Self {
        Self::new(PolicyType::RoundRobin)
    }
}

impl PoolPolicySettings {
    /// Settings of `policy_type` with every parameter zero.
    pub fn new(policy_type: PolicyType) -> Self {
        Self {
            policy_type,
            weight: 0,
            load: 0,
            load_degradation: 0,
            load_dpf: 0,
            weight_dpf: 0,
            distance: 0,
        }
    }

    pub fn weighted(policy_type: PolicyType, weight: u32) -> Self {
        Self {
            weight,
            ..Self::new(policy_type)
        }
        .normalized()
    }

    pub fn loaded(policy_type: PolicyType, load: u32, load_degradation: u32) -> Self {
        Self {
            load,
            load_degradation,
            ..Self::new(policy_type)
        }
        .normalized()
    }

    pub fn get(&self, parameter: PolicyParameter) -> u32 {
        match parameter {
            Weight => self.weight,
            Load => self.load,
            LoadDegradation => self.load_degradation,
            LoadDpf => self.load_dpf,
            WeightDpf => self.weight_dpf,
            Distance => self.distance,
        }
    }

    fn slot(&mut self, parameter: PolicyParameter) -> &mut u32 {
        match parameter {
            Weight => &mut self.weight,
            Load => &mut self.load,
            LoadDegradation => &mut self.load_degradation,
            LoadDpf => &mut self.load_dpf,
            WeightDpf => &mut self.weight_dpf,
            Distance => &mut self.distance,
        }
    }

    /// Copy with every parameter the policy type does not use cleared.
    pub fn normalized(&self) -> Self {
        let mut normalized = Self::new(self.policy_type);
        for parameter in self.policy_type.parameters() {
            *normalized.slot(*parameter) = self.get(*parameter);
        }
        normalized
    }

    pub fn is_adaptive(&self) -> bool {
        self.policy_type.is_adaptive()
    }

    /// Whether an element with these settings may join a pool using `other`.
    pub fn is_compatible_with(&self, other: &PoolPolicySettings) -> bool {
        self.policy_type == other.policy_type
    }
}

impl fmt::Display for PoolPolicySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.policy_type.name())?;
        for parameter in self.policy_type.parameters() {
            let value = self.get(*parameter);
            match parameter {
                Weight if self.policy_type == PolicyType::Priority => write!(f, " priority={value}")?,
                Weight => write!(f, " weight={value}")?,
                Load => write!(f, " load={:.3}%", percent(value))?,
                LoadDegradation => write!(f, " degradation={:.3}%", percent(value))?,
                LoadDpf => write!(f, " load_dpf={value:#010x}")?,
                WeightDpf => write!(f, " weight_dpf={value:#010x}")?,
                Distance => write!(f, " distance={value}")?,
            }
        }
        Ok(())
    }
}

fn percent(value: u32) -> f64 {
    100.0 * f64::from(value) / f64::from(PPV_MAX_LOAD)
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Write a complete pool policy parameter.
pub fn encode_policy(buffer: &mut MessageBuffer, settings: &PoolPolicySettings) -> Result<(), RspError> {
    let start = buffer.begin_tlv(ParameterType::PoolPolicy.wire_code())?;
    buffer.put_u32(settings.policy_type.tag())?;
    for parameter in settings.policy_type.parameters() {
        buffer.put_u32(settings.get(*parameter))?;
    }
    buffer.finish_tlv(start)
}

/// Read a pool policy parameter payload (the bytes after the TLV header).
/// Bytes past the parameters the type uses are ignored.
pub fn decode_policy(payload: &[u8]) -> Result<PoolPolicySettings, RspError> {
    let mut words = payload
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
    let tag = words.next().ok_or(RspError::InvalidValue)?;
    let policy_type = PolicyType::from_tag(tag)?;
    let mut settings = PoolPolicySettings::new(policy_type);
    for parameter in policy_type.parameters() {
        *settings.slot(*parameter) = words.next().ok_or(RspError::InvalidValue)?;
    }
    Ok(settings)
}
