use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::GroupVersionResource;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Deployment => "Deployment",
        }
    }

    /// Resolves the kind behind an admission resource descriptor. Exact
    /// group/version/resource matches come first; a descriptor without a
    /// version falls back to the plain resource name.
    pub fn from_resource(gvr: &GroupVersionResource) -> Option<Self> {
        SUPPORTED_RESOURCES
            .iter()
            .find(|(group, version, resource, _)| {
                gvr.group == *group && gvr.version == *version && gvr.resource == *resource
            })
            .map(|(.., kind)| *kind)
            .or_else(|| {
                if !gvr.version.is_empty() {
                    return None;
                }
                match gvr.resource.as_str() {
                    "pods" => Some(ResourceKind::Pod),
                    "deployments" => Some(ResourceKind::Deployment),
                    _ => None,
                }
            })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SUPPORTED_RESOURCES: [(&str, &str, &str, ResourceKind); 5] = [
    ("", "v1", "pods", ResourceKind::Pod),
    ("apps", "v1", "deployments", ResourceKind::Deployment),
    ("apps", "v1beta1", "deployments", ResourceKind::Deployment),
    ("apps", "v1beta2", "deployments", ResourceKind::Deployment),
    ("extensions", "v1beta1", "deployments", ResourceKind::Deployment),
];

/// A decoded admission object that carries a pod template.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TargetResource {
    Pod(Pod),
    Deployment(Deployment),
}

impl TargetResource {
    pub fn decode(kind: ResourceKind, raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_slice(raw)?;
        // Typed decoding rejects any apiVersion but the current one, so legacy
        // deployment group versions are decoded by shape alone.
        if let Some(object) = value.as_object_mut() {
            object.remove("apiVersion");
            object.remove("kind");
        }
        Ok(match kind {
            ResourceKind::Pod => TargetResource::Pod(serde_json::from_value(value)?),
            ResourceKind::Deployment => TargetResource::Deployment(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            TargetResource::Pod(_) => ResourceKind::Pod,
            TargetResource::Deployment(_) => ResourceKind::Deployment,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            TargetResource::Pod(pod) => &pod.metadata,
            TargetResource::Deployment(deployment) => &deployment.metadata,
        }
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            TargetResource::Pod(pod) => pod.spec.as_ref(),
            TargetResource::Deployment(deployment) => deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.spec.as_ref()),
        }
    }

    /// The pod spec to inject into, created empty when the object has none.
    pub fn pod_spec_mut(&mut self) -> &mut PodSpec {
        match self {
            TargetResource::Pod(pod) => pod.spec.get_or_insert_with(Default::default),
            TargetResource::Deployment(deployment) => deployment
                .spec
                .get_or_insert_with(Default::default)
                .template
                .spec
                .get_or_insert_with(Default::default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvr(group: &str, version: &str, resource: &str) -> GroupVersionResource {
        GroupVersionResource::gvr(group, version, resource)
    }

    #[test]
    fn test_kind_from_resource() {
        let cases = [
            (gvr("", "v1", "pods"), Some(ResourceKind::Pod)),
            (gvr("apps", "v1", "deployments"), Some(ResourceKind::Deployment)),
            (gvr("apps", "v1beta2", "deployments"), Some(ResourceKind::Deployment)),
            (gvr("extensions", "v1beta1", "deployments"), Some(ResourceKind::Deployment)),
            (gvr("", "", "pods"), Some(ResourceKind::Pod)),
            (gvr("", "", "deployments"), Some(ResourceKind::Deployment)),
            (gvr("apps", "v1", "statefulsets"), None),
            (gvr("", "v2", "pods"), None),
            (gvr("", "v1", "services"), None),
        ];

        for (gvr, expected) in cases {
            assert_eq!(ResourceKind::from_resource(&gvr), expected, "{gvr:?}");
        }
    }

    #[test]
    fn test_decode_deployment_pod_spec() {
        let raw = br#"{
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "annotations": {"a": "b"}},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "web", "image": "nginx"}]}
                }
            }
        }"#;

        let mut resource = TargetResource::decode(ResourceKind::Deployment, raw).unwrap();

        assert_eq!(resource.kind(), ResourceKind::Deployment);
        assert_eq!(resource.meta().name.as_deref(), Some("web"));
        assert_eq!(resource.pod_spec().unwrap().containers[0].name, "web");
        resource.pod_spec_mut().containers.clear();
        assert!(resource.pod_spec().unwrap().containers.is_empty());
    }

    #[test]
    fn test_decode_legacy_deployment() {
        let raw = br#"{
            "apiVersion": "extensions/v1beta1",
            "kind": "Deployment",
            "metadata": {"name": "legacy"},
            "spec": {
                "selector": {"matchLabels": {"app": "legacy"}},
                "template": {"spec": {"containers": [{"name": "app"}]}}
            }
        }"#;

        let resource = TargetResource::decode(ResourceKind::Deployment, raw).unwrap();
        assert_eq!(resource.meta().name.as_deref(), Some("legacy"));
        assert_eq!(resource.pod_spec().unwrap().containers.len(), 1);
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let raw = br#"{"apiVersion": "v1", "kind": "Pod", "spec": {"containers": "nope"}}"#;
        assert!(TargetResource::decode(ResourceKind::Pod, raw).is_err());
    }

    #[test]
    fn test_serializes_as_inner_object() {
        let raw = br#"{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "spec": {"containers": []}
        }"#;
        let resource = TargetResource::decode(ResourceKind::Pod, raw).unwrap();

        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["kind"], "Pod");
        assert_eq!(value["metadata"]["name"], "p");
    }
}
