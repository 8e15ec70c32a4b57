use json_patch::Patch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, SerializePatchError};
use kube::core::{DynamicObject, GroupVersionResource};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::annotations::{
    ANNOTATION_CA_MAP, ANNOTATION_IMAGE, ANNOTATION_INJECT, ANNOTATION_INSTANCE,
    ANNOTATION_SECRET, has_annotation_value, resolve_string,
};
use crate::config::MutationOptions;
use crate::handlers::{Mutator, NeedsMutation};
use crate::patch::{self, PatchError};
use crate::pod_spec;
use crate::resource::{ResourceKind, TargetResource};
use crate::sidecar::{SidecarError, SidecarSettings, SidecarTemplate};

/// Control plane namespaces are never mutated.
pub const EXCLUDED_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("wrong resource type {resource}")]
    WrongResource { resource: String },
    #[error("failed to re-encode admitted object: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: ResourceKind,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
    #[error("failed to compute patch: {0}")]
    Patch(#[from] PatchError),
    #[error("failed to serialize patch: {0}")]
    SerializePatch(#[from] SerializePatchError),
}

pub struct SidecarInjector {
    options: MutationOptions,
    template: SidecarTemplate,
}

impl SidecarInjector {
    pub fn new(options: MutationOptions) -> Self {
        Self {
            options,
            template: SidecarTemplate::new(),
        }
    }

    /// Runs one admission request through namespace exclusion, decoding, the
    /// inject annotation gate and sidecar injection. `Ok(None)` means the
    /// request is allowed unchanged.
    pub fn review(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<Option<Patch>, MutationError> {
        if !self.needs_mutation(request) {
            debug!(
                uid = %request.uid,
                namespace = ?request.namespace,
                "namespace is excluded from injection"
            );
            return Ok(None);
        }

        let kind = ResourceKind::from_resource(&request.resource).ok_or_else(|| {
            MutationError::WrongResource {
                resource: describe(&request.resource),
            }
        })?;

        let Some(object) = request.object.as_ref() else {
            debug!(uid = %request.uid, operation = ?request.operation, "request carries no object");
            return Ok(None);
        };
        let raw = serde_json::to_vec(object).map_err(MutationError::Encode)?;
        let mut resource = TargetResource::decode(kind, &raw)
            .map_err(|source| MutationError::Decode { kind, source })?;

        if !self.should_mutate(resource.meta()) {
            debug!(
                uid = %request.uid,
                kind = %resource.kind(),
                "inject annotation gate declined mutation"
            );
            return Ok(None);
        }

        let settings = self.settings(resource.meta());
        let sidecar = self.template.build(&settings)?;
        info!(
            uid = %request.uid,
            kind = %resource.kind(),
            containers = resource.pod_spec().map_or(0, |spec| spec.containers.len()),
            image = %settings.image,
            instance = %settings.instance,
            "injecting sidecar"
        );
        let original = resource.clone();
        pod_spec::inject(resource.pod_spec_mut(), sidecar);

        Ok(patch::compute_patch(&original, &resource)?)
    }

    fn should_mutate(&self, meta: &ObjectMeta) -> bool {
        if self.options.require_annotation {
            has_annotation_value(meta, ANNOTATION_INJECT, "true")
        } else {
            !has_annotation_value(meta, ANNOTATION_INJECT, "false")
        }
    }

    fn settings(&self, meta: &ObjectMeta) -> SidecarSettings {
        let options = &self.options;
        SidecarSettings {
            image: resolve_string(meta, ANNOTATION_IMAGE, &options.default_image),
            instance: resolve_string(meta, ANNOTATION_INSTANCE, &options.default_instance),
            secret_name: optional(resolve_string(
                meta,
                ANNOTATION_SECRET,
                &options.default_secret_name,
            )),
            ca_config_map: optional(resolve_string(
                meta,
                ANNOTATION_CA_MAP,
                &options.default_ca_config_map,
            )),
            cpu_request: optional(options.cpu_request.clone()),
            memory_request: optional(options.memory_request.clone()),
        }
    }
}

impl NeedsMutation for SidecarInjector {
    fn needs_mutation(&self, request: &AdmissionRequest<DynamicObject>) -> bool {
        !request
            .namespace
            .as_deref()
            .is_some_and(|ns| EXCLUDED_NAMESPACES.contains(&ns))
    }
}

impl Mutator for SidecarInjector {
    fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        let result = self.review(request).and_then(|patch| match patch {
            Some(patch) => Ok(response.clone().with_patch(patch)?),
            None => Ok(response.clone()),
        });

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(uid = %request.uid, name = %request.name, "denied: {e}");
                response.deny(e.to_string())
            }
        }
    }
}

fn optional(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn describe(gvr: &GroupVersionResource) -> String {
    format!("{}/{}/{}", gvr.group, gvr.version, gvr.resource)
}
