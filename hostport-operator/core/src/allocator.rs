use crate::{
    metrics::AllocatorMetrics,
    reconcile::{self, Reconciled, StickyPorts},
    AllocateError, Assignment, ConflictMap, HostId, HostPorts, Instance, ListInstances, Policy,
    PortRange, PortRequest, Protocol,
};
use std::{num::NonZeroU16, time::Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

/// Allocates host ports for instances.
///
/// Calls to [`Allocator::allocate`] are serialized by a single lock that is held while cluster
/// state is scanned, so no two calls can observe state in between each other's decisions.
#[derive(Debug)]
pub struct Allocator<L> {
    lister: L,
    conflicts: Mutex<ConflictMap>,
    metrics: AllocatorMetrics,
}

/// The in-progress state of a single allocation call.
struct Batch<'a> {
    host: &'a HostId,
    ports: HostPorts,
    sticky: &'a StickyPorts,
    range: PortRange,
    ordinal: u32,
    stride: u32,
}

// === impl Allocator ===

impl<L> Allocator<L> {
    pub fn new(lister: L, metrics: AllocatorMetrics) -> Self {
        Self {
            lister,
            conflicts: Mutex::new(ConflictMap::default()),
            metrics,
        }
    }

    /// Returns the ports known to be in use on `host`, as of the most recent call targeting it.
    pub async fn used_ports(&self, host: &HostId, protocol: Protocol) -> Vec<u16> {
        self.conflicts
            .lock()
            .await
            .get(host)
            .map(|ports| ports.ports(protocol))
            .unwrap_or_default()
    }
}

impl<L: ListInstances> Allocator<L> {
    /// Assigns a host port to each request, in order.
    ///
    /// Either every request is assigned or an error is returned; a failed call leaves no trace of
    /// its in-progress assignments.
    #[instrument(
        skip_all,
        fields(
            ns = %target.namespace,
            name = %target.name,
            host = %target.host,
        )
    )]
    pub async fn allocate(
        &self,
        target: &Instance,
        requests: &[PortRequest],
        range: PortRange,
        ordinal: u32,
        stride: u32,
    ) -> Result<Vec<Assignment>, AllocateError> {
        let started = Instant::now();
        let mut conflicts = self.conflicts.lock().await;

        let instances = match self.lister.list_instances(&target.namespace).await {
            Ok(instances) => instances,
            Err(error) => {
                warn!(%error, "Failed to list instances");
                let error = AllocateError::StateUnavailable(error);
                self.metrics.aborted(None, &error);
                self.metrics.observe(None, started.elapsed());
                return Err(error);
            }
        };
        trace!(instances = instances.len(), "Listed instances");

        let Reconciled { ports, sticky } = reconcile::reconcile(target, instances);
        let mut batch = Batch {
            host: &target.host,
            ports: ports.clone(),
            sticky: &sticky,
            range,
            ordinal,
            stride,
        };

        let mut assignments = Vec::with_capacity(requests.len());
        for (position, request) in requests.iter().enumerate() {
            match batch.assign(position, request) {
                Ok(assignment) => {
                    debug!(
                        port = %assignment.name,
                        host_port = %assignment.host_port,
                        protocol = %assignment.protocol,
                        policy = %request.policy,
                        "Assigned"
                    );
                    assignments.push(assignment);
                }
                Err(error) => {
                    info!(%error, port = %request.name, policy = %request.policy, "Allocation aborted");
                    if let AllocateError::PortConflict { protocol, .. } = &error {
                        self.metrics.conflict(&target.host, *protocol);
                    }
                    self.metrics.aborted(Some(request.policy), &error);
                    self.metrics.observe(Some(request.policy), started.elapsed());
                    conflicts.replace(target.host.clone(), ports);
                    return Err(error);
                }
            }
        }

        for (request, assignment) in requests.iter().zip(&assignments) {
            self.metrics.allocated(request.policy, assignment.protocol);
        }
        conflicts.replace(target.host.clone(), batch.ports);
        self.metrics
            .observe(requests.first().map(|r| r.policy), started.elapsed());

        Ok(assignments)
    }
}

// === impl Batch ===

impl Batch<'_> {
    fn assign(
        &mut self,
        position: usize,
        request: &PortRequest,
    ) -> Result<Assignment, AllocateError> {
        let protocol = request.protocol;
        let host_port = match request.policy {
            Policy::Static => request.host_port.ok_or_else(|| {
                AllocateError::InvalidRequest(format!(
                    "static policy requires hostPort to be set for port {:?}",
                    request.name
                ))
            })?,

            Policy::Passthrough => NonZeroU16::new(request.container_port).ok_or_else(|| {
                AllocateError::InvalidRequest(format!(
                    "passthrough policy requires containerPort to be set for port {:?}",
                    request.name
                ))
            })?,

            Policy::Index => self.index(position, request)?,

            Policy::Dynamic => self.dynamic(request)?,
        };

        // Static and Passthrough ports are not chosen with regard to the ports in use, so every
        // policy's result is checked here.
        if !self.ports.mark_used(protocol, host_port) {
            return Err(AllocateError::PortConflict {
                port: host_port,
                protocol,
                host: self.host.clone(),
            });
        }

        Ok(Assignment {
            name: request.name.clone(),
            container_port: request.container_port,
            host_port,
            protocol,
        })
    }

    fn index(&self, position: usize, request: &PortRequest) -> Result<NonZeroU16, AllocateError> {
        let offset = u64::from(self.ordinal)
            .saturating_mul(u64::from(self.stride))
            .saturating_add(position as u64);
        self.range
            .offset(offset)
            .ok_or_else(|| AllocateError::RangeExceeded {
                name: request.name.clone(),
                port: u64::from(self.range.min().get()).saturating_add(offset),
                ordinal: self.ordinal,
                stride: self.stride,
                max: self.range.max(),
            })
    }

    fn dynamic(&self, request: &PortRequest) -> Result<NonZeroU16, AllocateError> {
        if let Some(&port) = self.sticky.get(&request.name) {
            if !self.ports.is_used(request.protocol, port) {
                debug!(port = %request.name, host_port = %port, "Reusing recorded port");
                return Ok(port);
            }
            debug!(port = %request.name, host_port = %port, "Recorded port is in use");
        }

        self.ports
            .first_free(request.protocol, &self.range)
            .ok_or(AllocateError::RangeExhausted {
                protocol: request.protocol,
                range: self.range,
            })
    }
}
