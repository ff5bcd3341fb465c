use crate::annotations;
use anyhow::{Context, Result};
use hostport_operator_core::{
    AllocateError, DeclaredPort, HostId, Instance, ListInstances, Protocol,
};
use k8s_openapi::api::core::v1::{ContainerPort, Pod};
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use std::{collections::BTreeMap, num::NonZeroU16};
use tracing::{debug, trace};

/// Lists pods from the Kubernetes API.
#[derive(Clone)]
pub struct PodLister {
    client: Client,
}

// === impl PodLister ===

impl PodLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ListInstances for PodLister {
    async fn list_instances(&self, namespace: &str) -> Result<Vec<Instance>> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list pods in namespace {namespace}"))?;
        debug!(%namespace, pods = pods.items.len(), "Listed pods");
        Ok(pods.items.iter().map(instance).collect())
    }
}

/// Describes a pod as an allocation instance.
pub fn instance(pod: &Pod) -> Instance {
    let spec = pod.spec.as_ref();
    let host = HostId::from_node_name(spec.and_then(|s| s.node_name.as_deref()));

    let mut instance = Instance::new(pod.namespace().unwrap_or_default(), pod.name_any(), host);
    instance.terminating = pod.metadata.deletion_timestamp.is_some();
    instance.ports = spec
        .into_iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(declared_port)
        .collect();
    instance.recorded = recorded_ports(pod.annotations());
    instance
}

/// Reads a container port's protocol. An unset protocol is TCP.
pub fn protocol(port: &ContainerPort) -> Result<Protocol, AllocateError> {
    match port.protocol.as_deref() {
        None | Some("") => Ok(Protocol::default()),
        Some(protocol) => protocol.parse(),
    }
}

/// Reads the host ports recorded in `hostport.io/allocated-<name>` annotations.
pub fn recorded_ports(annotations: &BTreeMap<String, String>) -> BTreeMap<String, NonZeroU16> {
    annotations
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(annotations::ALLOCATED_PREFIX)?;
            match value.parse::<NonZeroU16>() {
                Ok(port) => Some((name.to_string(), port)),
                Err(error) => {
                    trace!(%key, %value, %error, "Ignoring invalid recorded port");
                    None
                }
            }
        })
        .collect()
}

fn declared_port(port: &ContainerPort) -> Option<DeclaredPort> {
    let host_port = port
        .host_port
        .and_then(|p| u16::try_from(p).ok())
        .and_then(NonZeroU16::new)?;
    match protocol(port) {
        Ok(protocol) => Some(DeclaredPort {
            host_port,
            protocol,
        }),
        Err(error) => {
            trace!(%host_port, %error, "Ignoring host port");
            None
        }
    }
}
