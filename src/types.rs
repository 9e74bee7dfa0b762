use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Annotation whose presence turns a capture on. Its value is the rotation limit.
pub const CAPTURE_ANNOTATION: &str = "tcpdump.antrea.io";

/// Pod identity. Keyed by namespace/name rather than UID: a pod recreated under
/// the same name maps onto the same capture artifacts.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Point-in-time view of a pod, reduced to what the capture controller reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSnapshot {
    pub key: PodKey,
    pub annotations: BTreeMap<String, String>,
    /// Runtime container ids (`<runtime>://<id>`), one per container status,
    /// in status order. A status without an id yet is recorded as "".
    pub container_ids: Vec<String>,
    /// Set once deletion has been requested upstream.
    pub deletion_requested: bool,
    pub resource_version: Option<String>,
    pub node_name: Option<String>,
}

impl PodSnapshot {
    pub fn from_pod(pod: &Pod) -> Self {
        let key = PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any());

        let container_ids = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| cs.container_id.clone().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            key,
            annotations: pod.annotations().clone(),
            container_ids,
            deletion_requested: pod.metadata.deletion_timestamp.is_some(),
            resource_version: pod.resource_version(),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        }
    }

    pub fn capture_annotation(&self) -> Option<&str> {
        self.annotations.get(CAPTURE_ANNOTATION).map(String::as_str)
    }

    pub fn is_scheduled_on(&self, node: &str) -> bool {
        self.node_name.as_deref() == Some(node)
    }
}
