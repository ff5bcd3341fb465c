use crate::{
    core::{AllocateError, Policy, PortRange},
    k8s::annotations,
};
use std::{collections::BTreeMap, str::FromStr};
use tracing::warn;

/// Process-wide settings used when a pod omits the corresponding annotation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Defaults {
    pub policy: Policy,
    pub min_port: u16,
    pub max_port: u16,
    pub stride: u32,
}

/// The allocation settings of a single pod.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PodConfig {
    pub policy: Policy,
    pub range: PortRange,
    pub stride: u32,
}

// === impl Defaults ===

impl Defaults {
    pub fn range(&self) -> Result<PortRange, AllocateError> {
        PortRange::new(self.min_port, self.max_port)
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            policy: Policy::Index,
            min_port: 7000,
            max_port: 8000,
            stride: 10,
        }
    }
}

// === impl PodConfig ===

impl PodConfig {
    /// Reads a pod's allocation settings from its annotations.
    ///
    /// Numeric annotations that fail to parse are ignored in favor of the default. An unknown
    /// policy, or a range that is empty once resolved, is rejected.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        defaults: &Defaults,
    ) -> Result<Self, AllocateError> {
        let policy = match annotations.get(annotations::POLICY) {
            Some(policy) => policy.parse()?,
            None => defaults.policy,
        };
        let min = parse_or(annotations, annotations::MIN_PORT, defaults.min_port);
        let max = parse_or(annotations, annotations::MAX_PORT, defaults.max_port);
        let stride = parse_or(annotations, annotations::STRIDE, defaults.stride);

        Ok(Self {
            policy,
            range: PortRange::new(min, max)?,
            stride,
        })
    }
}

fn parse_or<T>(annotations: &BTreeMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    let Some(value) = annotations.get(key) else {
        return default;
    };
    match value.trim().parse() {
        Ok(v) => v,
        Err(error) => {
            warn!(%key, %value, %error, %default, "Ignoring invalid annotation");
            default
        }
    }
}
