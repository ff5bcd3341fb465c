use crate::{DeclaredPort, HostPorts, Instance};
use ahash::AHashMap as HashMap;
use std::num::NonZeroU16;
use tracing::{debug, trace};

/// Host ports recorded by a predecessor of the target instance, by port name.
pub(crate) type StickyPorts = HashMap<String, NonZeroU16>;

/// The state rebuilt from a scan for a single allocation call.
#[derive(Debug, Default)]
pub(crate) struct Reconciled {
    pub ports: HostPorts,
    pub sticky: StickyPorts,
}

/// Rebuilds the ports in use on `target`'s host from a scan of `instances`, and extracts the
/// assignments recorded by any instance sharing `target`'s name.
///
/// Ports declared by `target` itself are held outside of the batch and are always marked as used:
/// the target is not part of the scan until it has been admitted.
///
/// A same-named instance that is terminating is the outgoing incarnation of `target`: its ports
/// are not marked as used so that its replacement may reclaim them.
pub(crate) fn reconcile(
    target: &Instance,
    instances: impl IntoIterator<Item = Instance>,
) -> Reconciled {
    let mut reconciled = Reconciled::default();

    for DeclaredPort {
        host_port,
        protocol,
    } in &target.ports
    {
        trace!(port = %host_port, %protocol, "Port held by target");
        reconciled.ports.mark_used(*protocol, *host_port);
    }

    for instance in instances {
        if instance.namespace != target.namespace || !target.host.overlaps(&instance.host) {
            trace!(instance = %instance.name, host = %instance.host, "Skipping instance");
            continue;
        }

        if instance.name == target.name {
            reconciled.sticky.extend(
                instance
                    .recorded
                    .iter()
                    .map(|(name, port)| (name.clone(), *port)),
            );

            if instance.terminating {
                debug!(recorded = ?instance.recorded, "Releasing ports of terminating predecessor");
                continue;
            }
        }

        for DeclaredPort {
            host_port,
            protocol,
        } in instance.ports
        {
            trace!(instance = %instance.name, port = %host_port, %protocol, "Port in use");
            reconciled.ports.mark_used(protocol, host_port);
        }
    }

    reconciled
}
