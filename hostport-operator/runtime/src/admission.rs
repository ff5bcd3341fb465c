use crate::{
    config::{Defaults, PodConfig},
    core::{AllocateError, Allocator, Assignment, ListInstances, Policy, PortRequest},
    k8s::{self, annotations, Pod, PodSpec, Resource, ResourceExt},
    metrics::{Outcome, WebhookMetrics},
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use std::{collections::HashSet, num::NonZeroU16, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Assigns host ports to pods as they are admitted.
pub struct Admission<L> {
    allocator: Arc<Allocator<L>>,
    defaults: Defaults,
    metrics: WebhookMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Locates a requested port within the pod spec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Slot {
    container: usize,
    port: usize,
}

type Review = kube::core::admission::AdmissionReview<Pod>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<Pod>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<kube::core::DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<L> Clone for Admission<L> {
    fn clone(&self) -> Self {
        Self {
            allocator: self.allocator.clone(),
            defaults: self.defaults,
            metrics: self.metrics.clone(),
        }
    }
}

impl<L> tower::Service<Request<hyper::body::Incoming>> for Admission<L>
where
    L: ListInstances + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        if !is_review(&req) {
            debug!(method = %req.method(), path = req.uri().path(), "Not found");
            let mut rsp = Response::new(Body::default());
            *rsp.status_mut() = http::StatusCode::NOT_FOUND;
            return Box::pin(future::ready(Ok(rsp)));
        }

        let admission = self.clone();
        Box::pin(async move {
            let body = req.into_body().collect().await?.to_bytes();
            let review = admission.review(&body).await;
            let mut rsp = Response::new(Body::from(serde_json::to_vec(&review)?));
            rsp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            Ok(rsp)
        })
    }
}

impl<L> Admission<L> {
    pub(crate) fn new(
        allocator: Arc<Allocator<L>>,
        defaults: Defaults,
        metrics: WebhookMetrics,
    ) -> Self {
        Self {
            allocator,
            defaults,
            metrics,
        }
    }
}

impl<L: ListInstances> Admission<L> {
    /// Answers an encoded `AdmissionReview`. Undecodable reviews are answered as invalid.
    async fn review(&self, body: &[u8]) -> AdmissionReview {
        let review = match serde_json::from_slice::<Review>(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to decode admission review");
                self.metrics.record(Outcome::Errored);
                return AdmissionResponse::invalid(error).into_review();
            }
        };

        let req: AdmissionRequest = match review.try_into() {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "Admission review carries no request");
                self.metrics.record(Outcome::Errored);
                return AdmissionResponse::invalid(error).into_review();
            }
        };
        trace!(?req);

        let rsp = self.admit(req).await;
        debug!(uid = %rsp.uid, allowed = rsp.allowed, "Reviewed");
        rsp.into_review()
    }

    async fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<Pod>(&req) {
            self.metrics.record(Outcome::Errored);
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        let rsp = AdmissionResponse::from(&req);
        let Some(pod) = req.object else {
            self.metrics.record(Outcome::Errored);
            return rsp.deny("admission request missing 'object'");
        };
        // Pods created by controllers may not carry their namespace until they are persisted.
        let ns = pod.namespace().or(req.namespace).unwrap_or_default();
        let name = pod.name_any();

        let mutated = match self.mutate(ns.clone(), &pod).await {
            Ok(Some(mutated)) => mutated,
            Ok(None) => {
                self.metrics.record(Outcome::Allowed);
                return rsp;
            }
            Err(error) => {
                info!(
                    %error,
                    %ns,
                    %name,
                    kind = error.kind(),
                    retryable = error.is_retryable(),
                    "Denied"
                );
                self.metrics.record(Outcome::Denied);
                return rsp.deny(error);
            }
        };

        let patch = match diff(&pod, &mutated) {
            Ok(patch) => patch,
            Err(error) => {
                warn!(%error, %ns, %name, "Failed to compute pod patch");
                self.metrics.record(Outcome::Errored);
                return rsp.deny(error);
            }
        };
        match rsp.clone().with_patch(patch) {
            Ok(rsp) => {
                self.metrics.record(Outcome::Allowed);
                rsp
            }
            Err(error) => {
                warn!(%error, %ns, %name, "Failed to serialize pod patch");
                self.metrics.record(Outcome::Errored);
                rsp.deny(error)
            }
        }
    }

    /// Returns the pod with its ports assigned, or `None` if the pod is left unchanged.
    async fn mutate(&self, ns: String, pod: &Pod) -> Result<Option<Pod>, AllocateError> {
        let annotations = pod.annotations();
        if annotations.get(annotations::ENABLED).map(String::as_str) != Some("true") {
            trace!("Host port allocation not enabled");
            return Ok(None);
        }

        let config = PodConfig::from_annotations(annotations, &self.defaults)?;
        let (slots, requests): (Vec<_>, Vec<_>) = match pod.spec.as_ref() {
            Some(spec) => port_requests(spec, config.policy)?.into_iter().unzip(),
            None => Default::default(),
        };
        if requests.is_empty() {
            debug!("No ports need allocation");
            return Ok(None);
        }

        let mut target = k8s::pod::instance(pod);
        if target.namespace.is_empty() {
            target.namespace = ns;
        }
        // The pod keeps the host ports it declares outside of this batch.
        target.ports.retain(|declared| {
            !requests.iter().any(|r| {
                r.host_port == Some(declared.host_port) && r.protocol == declared.protocol
            })
        });
        let ordinal = target.ordinal();
        let assignments = self
            .allocator
            .allocate(&target, &requests, config.range, ordinal, config.stride)
            .await?;

        let mut pod = pod.clone();
        apply(&mut pod, &slots, &assignments);
        Ok(Some(pod))
    }
}

/// Collects the ports of a pod that need a host port under `policy`.
///
/// Ports that already declare a host port are only requested under the `Static` policy, which
/// validates the declared port instead of choosing one. Requested ports must have distinct names,
/// since assignments are recorded by name.
fn port_requests(
    spec: &PodSpec,
    policy: Policy,
) -> Result<Vec<(Slot, PortRequest)>, AllocateError> {
    let mut requests = Vec::new();
    let mut names = HashSet::new();
    for (c, container) in spec.containers.iter().enumerate() {
        for (p, port) in container.ports.iter().flatten().enumerate() {
            if port.container_port == 0 {
                continue;
            }

            let host_port = port
                .host_port
                .and_then(|hp| u16::try_from(hp).ok())
                .and_then(NonZeroU16::new);
            if host_port.is_some() && policy != Policy::Static {
                trace!(
                    container = %container.name,
                    port = port.container_port,
                    "Skipping port with a declared hostPort"
                );
                continue;
            }

            let container_port = u16::try_from(port.container_port).map_err(|_| {
                AllocateError::InvalidRequest(format!(
                    "invalid containerPort {} in container {:?}",
                    port.container_port, container.name
                ))
            })?;
            let name = match port.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => container_port.to_string(),
            };
            if !names.insert(name.clone()) {
                return Err(AllocateError::InvalidRequest(format!(
                    "duplicate port name {name:?} in container {:?}",
                    container.name
                )));
            }

            requests.push((
                Slot {
                    container: c,
                    port: p,
                },
                PortRequest {
                    name,
                    container_port,
                    protocol: k8s::pod::protocol(port)?,
                    policy,
                    host_port,
                },
            ));
        }
    }
    Ok(requests)
}

/// Applies assignments to the pod. Host networking requires each container port to equal its
/// host port.
fn apply(pod: &mut Pod, slots: &[Slot], assignments: &[Assignment]) {
    let spec = pod.spec.get_or_insert_with(Default::default);
    spec.host_network = Some(true);
    for (slot, assignment) in slots.iter().zip(assignments) {
        let port = spec
            .containers
            .get_mut(slot.container)
            .and_then(|c| c.ports.as_mut())
            .and_then(|ports| ports.get_mut(slot.port));
        if let Some(port) = port {
            let host_port = i32::from(assignment.host_port.get());
            port.host_port = Some(host_port);
            port.container_port = host_port;
        }
    }

    let annotations = pod.annotations_mut();
    for assignment in assignments {
        annotations.insert(
            annotations::allocated(&assignment.name),
            assignment.host_port.to_string(),
        );
    }
}

fn diff(original: &Pod, mutated: &Pod) -> serde_json::Result<json_patch::Patch> {
    let original = serde_json::to_value(original)?;
    let mutated = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(&original, &mutated))
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn is_review<B>(req: &Request<B>) -> bool {
    req.method() == http::Method::POST && req.uri().path() == "/"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{metrics::AllocatorMetrics, DeclaredPort, HostId, Instance, Protocol};
    use serde_json::json;

    struct Pods(Vec<Instance>);

    struct Unavailable;

    #[async_trait::async_trait]
    impl ListInstances for Pods {
        async fn list_instances(&self, namespace: &str) -> anyhow::Result<Vec<Instance>> {
            Ok(self
                .0
                .iter()
                .filter(|i| i.namespace == namespace)
                .cloned()
                .collect())
        }
    }

    #[async_trait::async_trait]
    impl ListInstances for Unavailable {
        async fn list_instances(&self, _: &str) -> anyhow::Result<Vec<Instance>> {
            anyhow::bail!("connection refused")
        }
    }

    fn admission<L>(lister: L) -> Admission<L> {
        Admission::new(
            Arc::new(Allocator::new(lister, AllocatorMetrics::default())),
            Defaults::default(),
            WebhookMetrics::default(),
        )
    }

    fn running(name: &str, node: &str, host_port: u16) -> Instance {
        let mut instance = Instance::new("ns-0", name, HostId::Node(node.to_string()));
        instance.ports.push(DeclaredPort {
            host_port: NonZeroU16::new(host_port).unwrap(),
            protocol: Protocol::Tcp,
        });
        instance
    }

    fn mk_pod(
        name: &str,
        annotations: serde_json::Value,
        ports: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": "ns-0",
                "name": name,
                "annotations": annotations,
            },
            "spec": {
                "containers": [{
                    "name": "server",
                    "image": "server:latest",
                    "ports": ports,
                }],
            },
        })
    }

    fn mk_review(pod: &serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "5d3bc1a2-9c0e-4c3e-8a51-7f6a2b0e1c44",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": pod["metadata"]["name"],
                "namespace": "ns-0",
                "operation": "CREATE",
                "userInfo": { "username": "system:serviceaccount:kube-system:replicaset-controller" },
                "object": pod,
                "dryRun": false,
            },
        })
    }

    fn mk_request(pod: &serde_json::Value) -> AdmissionRequest {
        let review: Review =
            serde_json::from_value(mk_review(pod)).expect("review must deserialize");
        review.try_into().expect("review must carry a request")
    }

    fn patched(pod: &serde_json::Value, rsp: &AdmissionResponse) -> serde_json::Value {
        let bytes = rsp.patch.as_ref().expect("response must carry a patch");
        let patch: json_patch::Patch = serde_json::from_slice(bytes).unwrap();
        let mut doc = pod.clone();
        json_patch::patch(&mut doc, &patch.0).unwrap();
        doc
    }

    #[tokio::test]
    async fn not_enabled() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-0",
            json!({}),
            json!([{ "name": "game", "containerPort": 7777 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
        assert_eq!(admission.metrics.count(Outcome::Allowed), 1);
    }

    #[tokio::test]
    async fn index_policy() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-2",
            json!({ "hostport.io/enabled": "true" }),
            json!([
                { "name": "game", "containerPort": 7777, "protocol": "UDP" },
                { "containerPort": 9090 },
                { "name": "debug", "containerPort": 6060, "hostPort": 6060 },
            ]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(rsp.allowed);
        let pod = patched(&pod, &rsp);
        assert_eq!(pod["spec"]["hostNetwork"], json!(true));
        assert_eq!(
            pod["spec"]["containers"][0]["ports"],
            json!([
                { "name": "game", "containerPort": 7020, "hostPort": 7020, "protocol": "UDP" },
                { "containerPort": 7021, "hostPort": 7021 },
                { "name": "debug", "containerPort": 6060, "hostPort": 6060 },
            ])
        );
        assert_eq!(
            pod["metadata"]["annotations"],
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/allocated-game": "7020",
                "hostport.io/allocated-9090": "7021",
            })
        );
        assert_eq!(admission.metrics.count(Outcome::Allowed), 1);
    }

    #[tokio::test]
    async fn static_policy() {
        let admission = admission(Pods(vec![running("lobby-0", "node-1", 7501)]));
        let pod = mk_pod(
            "lobby-1",
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/policy": "Static",
            }),
            json!([{ "name": "lobby", "containerPort": 8080, "hostPort": 7500 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(rsp.allowed);
        let pod = patched(&pod, &rsp);
        assert_eq!(
            pod["spec"]["containers"][0]["ports"][0],
            json!({ "name": "lobby", "containerPort": 7500, "hostPort": 7500 })
        );
        assert_eq!(
            pod["metadata"]["annotations"]["hostport.io/allocated-lobby"],
            json!("7500")
        );
    }

    #[tokio::test]
    async fn static_policy_conflict() {
        let admission = admission(Pods(vec![running("lobby-0", "node-1", 7500)]));
        let pod = mk_pod(
            "lobby-1",
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/policy": "Static",
            }),
            json!([{ "name": "lobby", "containerPort": 8080, "hostPort": 7500 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
        assert!(rsp.patch.is_none());
        assert_eq!(admission.metrics.count(Outcome::Denied), 1);
    }

    #[tokio::test]
    async fn static_policy_requires_host_port() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "lobby-0",
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/policy": "Static",
            }),
            json!([{ "name": "lobby", "containerPort": 8080 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
        assert_eq!(admission.metrics.count(Outcome::Denied), 1);
    }

    #[tokio::test]
    async fn no_ports() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-0",
            json!({ "hostport.io/enabled": "true" }),
            json!([{ "name": "debug", "containerPort": 6060, "hostPort": 6060 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[tokio::test]
    async fn unknown_policy() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-0",
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/policy": "Random",
            }),
            json!([{ "name": "game", "containerPort": 7777 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
        assert_eq!(admission.metrics.count(Outcome::Denied), 1);
    }

    #[tokio::test]
    async fn unsupported_protocol() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-0",
            json!({ "hostport.io/enabled": "true" }),
            json!([{ "name": "game", "containerPort": 7777, "protocol": "SCTP" }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
    }

    #[tokio::test]
    async fn state_unavailable() {
        let admission = admission(Unavailable);
        let pod = mk_pod(
            "game-0",
            json!({ "hostport.io/enabled": "true" }),
            json!([{ "name": "game", "containerPort": 7777 }]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
        assert_eq!(admission.metrics.count(Outcome::Denied), 1);
    }

    #[tokio::test]
    async fn uses_request_namespace() {
        let admission = admission(Pods(vec![running("game-0", "node-1", 7000)]));
        let mut pod = mk_pod(
            "game-0",
            json!({ "hostport.io/enabled": "true" }),
            json!([{ "name": "game", "containerPort": 7777 }]),
        );
        pod["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("namespace");

        // The running pod shares the name but is not terminating, so its port stays taken.
        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
    }

    #[test]
    fn requests_by_policy() {
        let spec: PodSpec = serde_json::from_value(json!({
            "containers": [
                {
                    "name": "a",
                    "ports": [
                        { "name": "game", "containerPort": 7777 },
                        { "containerPort": 0 },
                    ],
                },
                {
                    "name": "b",
                    "ports": [{ "containerPort": 8080, "hostPort": 8080 }],
                },
            ],
        }))
        .unwrap();

        let requests = port_requests(&spec, Policy::Dynamic).unwrap();
        assert_eq!(
            requests,
            vec![(
                Slot {
                    container: 0,
                    port: 0
                },
                PortRequest {
                    name: "game".to_string(),
                    container_port: 7777,
                    protocol: Protocol::Tcp,
                    policy: Policy::Dynamic,
                    host_port: None,
                }
            )]
        );

        let requests = port_requests(&spec, Policy::Static).unwrap();
        let slots = requests.iter().map(|(s, _)| *s).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                Slot {
                    container: 0,
                    port: 0
                },
                Slot {
                    container: 1,
                    port: 0
                },
            ]
        );
        assert_eq!(requests[1].1.name, "8080");
        assert_eq!(requests[1].1.host_port, NonZeroU16::new(8080));
    }

    #[tokio::test]
    async fn declared_host_ports_are_kept() {
        let admission = admission(Pods(vec![]));
        let pod = mk_pod(
            "game-0",
            json!({
                "hostport.io/enabled": "true",
                "hostport.io/policy": "Dynamic",
            }),
            json!([
                { "name": "debug", "containerPort": 6060, "hostPort": 7000 },
                { "name": "game", "containerPort": 7777 },
            ]),
        );

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(rsp.allowed);
        let pod = patched(&pod, &rsp);
        assert_eq!(
            pod["spec"]["containers"][0]["ports"],
            json!([
                { "name": "debug", "containerPort": 6060, "hostPort": 7000 },
                { "name": "game", "containerPort": 7001, "hostPort": 7001 },
            ])
        );
        assert_eq!(
            admission
                .allocator
                .used_ports(&HostId::Unscheduled, Protocol::Tcp)
                .await,
            vec![7000, 7001]
        );
    }

    #[tokio::test]
    async fn duplicate_port_names() {
        let admission = admission(Pods(vec![]));
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": "ns-0",
                "name": "game-0",
                "annotations": { "hostport.io/enabled": "true" },
            },
            "spec": {
                "containers": [
                    { "name": "a", "ports": [{ "containerPort": 8080 }] },
                    { "name": "b", "ports": [{ "containerPort": 8080 }] },
                ],
            },
        });

        let rsp = admission.admit(mk_request(&pod)).await;
        assert!(!rsp.allowed);
        assert!(rsp.patch.is_none());
        assert_eq!(admission.metrics.count(Outcome::Denied), 1);
    }

    #[tokio::test]
    async fn encoded_reviews() {
        let admission = admission(Pods(vec![]));

        let review = admission.review(b"{\"kind\": ").await;
        let rsp = review.response.expect("review must carry a response");
        assert!(!rsp.allowed);
        assert_eq!(admission.metrics.count(Outcome::Errored), 1);

        let pod = mk_pod(
            "game-0",
            json!({ "hostport.io/enabled": "true" }),
            json!([{ "name": "game", "containerPort": 7777 }]),
        );
        let body = serde_json::to_vec(&mk_review(&pod)).unwrap();
        let review = admission.review(&body).await;
        let rsp = review.response.expect("review must carry a response");
        assert!(rsp.allowed);
        assert_eq!(rsp.uid, "5d3bc1a2-9c0e-4c3e-8a51-7f6a2b0e1c44");
        assert_eq!(
            patched(&pod, &rsp)["metadata"]["annotations"]["hostport.io/allocated-game"],
            json!("7000")
        );
    }

    #[test]
    fn review_route() {
        let req = |method: http::Method, path: &str| {
            Request::builder().method(method).uri(path).body(()).unwrap()
        };
        assert!(is_review(&req(http::Method::POST, "/")));
        assert!(!is_review(&req(http::Method::GET, "/")));
        assert!(!is_review(&req(http::Method::POST, "/mutate-pods")));
    }

    #[test]
    fn rejects_duplicate_names() {
        let spec: PodSpec = serde_json::from_value(json!({
            "containers": [{
                "name": "a",
                "ports": [
                    { "name": "game", "containerPort": 7777 },
                    { "name": "game", "containerPort": 7778, "protocol": "UDP" },
                ],
            }],
        }))
        .unwrap();
        let error = port_requests(&spec, Policy::Index).unwrap_err();
        assert!(
            matches!(error, AllocateError::InvalidRequest(_)),
            "{error}"
        );
    }
}
