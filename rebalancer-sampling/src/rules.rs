//! Sampling rules handed to the ingestion edge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The identifier of a [`SamplingRule`].
///
/// Bias rules use fixed, reserved identifiers so that outcomes can be attributed to them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct RuleId(pub u32);

impl RuleId {
    /// The rule that samples all traces of a project at a uniform rate.
    pub const UNIFORM: Self = Self(1000);
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Defines what a sampling rule applies to.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RuleType {
    /// Applies to all transactions in a trace, decided at the trace root.
    Trace,
    /// Applies to individual transaction events.
    Transaction,
}

/// How a matching rule determines the sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SamplingValue {
    /// A direct sample rate to apply.
    SampleRate {
        /// The sample rate.
        value: f64,
    },
}

/// A condition that matches when all inner conditions match.
///
/// Bias rules never narrow down their scope, so the only condition needed here is the empty
/// conjunction which matches everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum RuleCondition {
    /// Matches if all inner conditions match.
    And {
        /// Inner conditions. Empty matches everything.
        inner: Vec<RuleCondition>,
    },
}

impl RuleCondition {
    /// A condition that matches everything.
    pub fn all() -> Self {
        Self::And { inner: Vec::new() }
    }
}

/// A sampling rule in the format consumed by the ingestion edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRule {
    /// The sample rate to apply when this rule matches.
    pub sampling_value: SamplingValue,
    /// What the rule applies to.
    #[serde(rename = "type")]
    pub ty: RuleType,
    /// Inactive rules are ignored.
    pub active: bool,
    /// The condition to match.
    pub condition: RuleCondition,
    /// The unique identifier of this rule.
    pub id: RuleId,
}

impl SamplingRule {
    /// Creates the rule that samples every trace of a project at `sample_rate`.
    pub fn uniform(sample_rate: f64) -> Self {
        Self {
            sampling_value: SamplingValue::SampleRate { value: sample_rate },
            ty: RuleType::Trace,
            active: true,
            condition: RuleCondition::all(),
            id: RuleId::UNIFORM,
        }
    }
}
