use crate::AllocateError;
use std::{fmt, num::NonZeroU16};

/// A `HashSet` specialized for ports.
///
/// Because ports are `u16` values, this type avoids the overhead of actually
/// hashing ports.
pub type PortSet = std::collections::HashSet<NonZeroU16, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Because ports are single `NonZeroU16` values, we don't have to hash them; we can just use
/// the integer values as hashes directly.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

/// The transport protocol of a host port. Ports are exclusive per host and protocol.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Describes how a host port is chosen for a port request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Reuse the port recorded by a predecessor with the same name if it is still free;
    /// otherwise take the lowest free port in range.
    Dynamic,

    /// Use the host port declared on the request.
    Static,

    /// Use the container port as the host port.
    Passthrough,

    /// `min + ordinal * stride + position`, where `position` is the request's index in its batch.
    Index,
}

/// An inclusive range of host ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRange {
    min: NonZeroU16,
    max: NonZeroU16,
}

/// A single port that an instance wants exposed on its host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRequest {
    /// Identifies the port within its instance.
    pub name: String,

    pub container_port: u16,

    pub protocol: Protocol,

    pub policy: Policy,

    /// The host port declared by the workload. Only consulted by the `Static` policy.
    pub host_port: Option<NonZeroU16>,
}

/// The host port assigned to a `PortRequest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub container_port: u16,
    pub host_port: NonZeroU16,
    pub protocol: Protocol,
}

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = AllocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            s => Err(AllocateError::InvalidRequest(format!(
                "unsupported protocol: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Policy ===

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "Dynamic",
            Self::Static => "Static",
            Self::Passthrough => "Passthrough",
            Self::Index => "Index",
        }
    }
}

impl std::str::FromStr for Policy {
    type Err = AllocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dynamic" => Ok(Self::Dynamic),
            "Static" => Ok(Self::Static),
            "Passthrough" => Ok(Self::Passthrough),
            "Index" => Ok(Self::Index),
            s => Err(AllocateError::InvalidRequest(format!(
                "unsupported port policy: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, AllocateError> {
        let min = NonZeroU16::new(min)
            .ok_or_else(|| AllocateError::InvalidRequest("min-port must not be 0".to_string()))?;
        let max = NonZeroU16::new(max)
            .ok_or_else(|| AllocateError::InvalidRequest("max-port must not be 0".to_string()))?;
        if min > max {
            return Err(AllocateError::InvalidRequest(format!(
                "min-port {min} must not exceed max-port {max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> NonZeroU16 {
        self.min
    }

    pub fn max(&self) -> NonZeroU16 {
        self.max
    }

    /// Iterates over all ports in the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NonZeroU16> {
        (self.min.get()..=self.max.get()).filter_map(NonZeroU16::new)
    }

    /// Returns the port `offset` ports above `min`, if it falls within the range.
    pub(crate) fn offset(&self, offset: u64) -> Option<NonZeroU16> {
        let port = u64::from(self.min.get()).checked_add(offset)?;
        if port > u64::from(self.max.get()) {
            return None;
        }
        u16::try_from(port).ok().and_then(NonZeroU16::new)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
