use k8s_openapi::api::core::v1::PodSpec;

use crate::sidecar::{RESERVED_VOLUMES, Sidecar};

/// Injects `sidecar` into `pod_spec`, replacing any earlier injection.
///
/// Containers sharing the sidecar's name or image and volumes with a reserved
/// name are dropped before the fresh sidecar and its volumes are appended, so
/// applying this repeatedly leaves exactly one copy of each. Everything else
/// keeps its relative order.
pub fn inject(pod_spec: &mut PodSpec, sidecar: Sidecar) {
    let Sidecar { container, volumes } = sidecar;

    pod_spec.containers.retain(|existing| {
        existing.name != container.name
            && (existing.image.is_none() || existing.image != container.image)
    });
    pod_spec.containers.push(container);

    let pod_volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    pod_volumes.retain(|v| !RESERVED_VOLUMES.contains(&v.name.as_str()));
    pod_volumes.extend(volumes);
}
