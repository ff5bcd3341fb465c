use crate::{HostId, PortRange, Protocol};
use std::num::NonZeroU16;
use thiserror::Error;

/// Describes why an allocation call was aborted. No assignment from an aborted call is ever
/// returned.
#[derive(Debug, Error)]
pub enum AllocateError {
    /// A policy's required input was missing or malformed.
    #[error("invalid port request: {0}")]
    InvalidRequest(String),

    /// The `Index` policy computed a port beyond the end of the range.
    #[error("port {port} for {name:?} (ordinal {ordinal}, stride {stride}) exceeds max-port {max}")]
    RangeExceeded {
        name: String,
        port: u64,
        ordinal: u32,
        stride: u32,
        max: NonZeroU16,
    },

    /// The `Dynamic` policy found no free port in the range.
    #[error("exhausted available {protocol} ports in range {range}")]
    RangeExhausted { protocol: Protocol, range: PortRange },

    #[error("port {port}/{protocol} is already in use on {host}")]
    PortConflict {
        port: NonZeroU16,
        protocol: Protocol,
        host: HostId,
    },

    /// Cluster state could not be listed.
    #[error("cluster state unavailable: {0:#}")]
    StateUnavailable(anyhow::Error),
}

// === impl AllocateError ===

impl AllocateError {
    /// A short, stable name for the error, suitable for use as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::RangeExceeded { .. } => "range_exceeded",
            Self::RangeExhausted { .. } => "range_exhausted",
            Self::PortConflict { .. } => "port_conflict",
            Self::StateUnavailable(_) => "state_unavailable",
        }
    }

    /// Indicates whether the same call may succeed later without any change to its inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidRequest(_) | Self::RangeExceeded { .. } => false,
            Self::RangeExhausted { .. } | Self::PortConflict { .. } | Self::StateUnavailable(_) => {
                true
            }
        }
    }
}
