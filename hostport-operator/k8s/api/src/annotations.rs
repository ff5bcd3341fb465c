//! Pod annotations that configure host port allocation.

/// Must be set to `"true"` for a pod's ports to be allocated.
pub const ENABLED: &str = "hostport.io/enabled";

/// One of `Dynamic`, `Static`, `Passthrough` or `Index`.
pub const POLICY: &str = "hostport.io/policy";

pub const MIN_PORT: &str = "hostport.io/min-port";

pub const MAX_PORT: &str = "hostport.io/max-port";

/// The number of host ports reserved for each ordinal under the `Index` policy.
pub const STRIDE: &str = "hostport.io/stride";

/// Prefixes the annotations recording each assigned host port, by port name, e.g.
/// `hostport.io/allocated-http: "7000"`.
pub const ALLOCATED_PREFIX: &str = "hostport.io/allocated-";

/// Formats the annotation key that records the host port assigned to `port_name`.
pub fn allocated(port_name: &str) -> String {
    format!("{ALLOCATED_PREFIX}{port_name}")
}
