use crate::{HostId, PortRange, PortSet, Protocol};
use ahash::AHashMap as HashMap;
use std::num::NonZeroU16;

/// The host ports known to be in use on each host, by protocol.
///
/// Entries are replaced wholesale each time an allocation targets a host; the map is a cache of
/// the latest scan and is never the source of truth.
#[derive(Debug, Default)]
pub struct ConflictMap {
    hosts: HashMap<HostId, HostPorts>,
}

/// The host ports in use on a single host, by protocol.
#[derive(Clone, Debug, Default)]
pub struct HostPorts {
    by_protocol: HashMap<Protocol, PortSet>,
}

// === impl ConflictMap ===

impl ConflictMap {
    pub fn get(&self, host: &HostId) -> Option<&HostPorts> {
        self.hosts.get(host)
    }

    pub(crate) fn replace(&mut self, host: HostId, ports: HostPorts) {
        self.hosts.insert(host, ports);
    }
}

// === impl HostPorts ===

impl HostPorts {
    pub fn is_used(&self, protocol: Protocol, port: NonZeroU16) -> bool {
        self.by_protocol
            .get(&protocol)
            .is_some_and(|ports| ports.contains(&port))
    }

    /// Marks a port as used, returning false if it was already marked.
    pub fn mark_used(&mut self, protocol: Protocol, port: NonZeroU16) -> bool {
        self.by_protocol.entry(protocol).or_default().insert(port)
    }

    /// Returns the lowest port in `range` that is not in use.
    pub fn first_free(&self, protocol: Protocol, range: &PortRange) -> Option<NonZeroU16> {
        range.iter().find(|port| !self.is_used(protocol, *port))
    }

    /// Returns the ports in use for `protocol`, in ascending order.
    pub fn ports(&self, protocol: Protocol) -> Vec<u16> {
        let mut ports = self
            .by_protocol
            .get(&protocol)
            .into_iter()
            .flatten()
            .map(|p| p.get())
            .collect::<Vec<_>>();
        ports.sort_unstable();
        ports
    }
}
