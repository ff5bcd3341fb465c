use crate::Protocol;
use std::{collections::BTreeMap, fmt, num::NonZeroU16};

/// Identifies the host an instance is placed on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostId {
    Node(String),

    /// The instance has not been scheduled yet, so no physical host can be checked. Conflicts
    /// are approximated across the whole namespace.
    Unscheduled,
}

/// A host port declared by an existing instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeclaredPort {
    pub host_port: NonZeroU16,
    pub protocol: Protocol,
}

/// A workload instance as observed in cluster state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub namespace: String,
    pub name: String,
    pub host: HostId,

    /// Set when the instance has been marked for deletion.
    pub terminating: bool,

    /// Host ports currently declared by the instance's spec. For an allocation target, these are
    /// the ports it holds that are not being allocated.
    pub ports: Vec<DeclaredPort>,

    /// Host ports previously assigned to the instance, by port name.
    pub recorded: BTreeMap<String, NonZeroU16>,
}

/// Extracts the ordinal from a trailing `-<N>` suffix, e.g. `app-3`. Names without a numeric
/// suffix have ordinal 0.
pub fn parse_ordinal(name: &str) -> u32 {
    name.rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .unwrap_or(0)
}

// === impl HostId ===

impl HostId {
    pub fn from_node_name(node_name: Option<&str>) -> Self {
        match node_name {
            Some(name) if !name.is_empty() => Self::Node(name.to_string()),
            _ => Self::Unscheduled,
        }
    }

    /// Indicates whether ports on `other` may conflict with ports on this host.
    pub(crate) fn overlaps(&self, other: &HostId) -> bool {
        match self {
            Self::Unscheduled => true,
            Self::Node(_) => self == other,
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(name) => name.fmt(f),
            Self::Unscheduled => "unscheduled".fmt(f),
        }
    }
}

// === impl Instance ===

impl Instance {
    pub fn new(namespace: impl ToString, name: impl ToString, host: HostId) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            host,
            terminating: false,
            ports: Vec::new(),
            recorded: BTreeMap::new(),
        }
    }

    pub fn ordinal(&self) -> u32 {
        parse_ordinal(&self.name)
    }
}
