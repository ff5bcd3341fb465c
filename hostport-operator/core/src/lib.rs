//! Host port allocation
//!
//! The allocator hands out host ports to workload instances as they are admitted, guaranteeing
//! that no two instances on the same host are ever assigned the same port/protocol pair.
//!
//! Allocation state is never persisted. Before each decision the allocator lists the instances
//! visible in the target's namespace and rebuilds the set of ports in use on the target host:
//!
//! ```text
//! [ ListInstances ] -> [ reconcile ] -> ( HostPorts, StickyPorts ) -> [ Allocator ] -> [ Assignment ]
//! ```
//!
//! Every allocation call runs under a single process-wide lock that spans the scan, so concurrent
//! admissions are strictly serialized.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod allocator;
mod conflict;
mod error;
mod instance;
pub mod metrics;
mod ports;
mod reconcile;


pub use self::{
    allocator::Allocator,
    conflict::{ConflictMap, HostPorts},
    error::AllocateError,
    instance::{parse_ordinal, DeclaredPort, HostId, Instance},
    ports::{Assignment, Policy, PortHasher, PortRange, PortRequest, PortSet, Protocol},
};

/// Models the read-only view of cluster state that the allocator reconciles against.
#[async_trait::async_trait]
pub trait ListInstances: Send + Sync {
    /// Lists every instance in the given namespace, including instances that are terminating.
    async fn list_instances(&self, namespace: &str) -> anyhow::Result<Vec<Instance>>;
}
