use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

pub const DEFAULT_IMAGE: &str = "gcr.io/cloudsql-docker/gce-proxy:1.33.1";
pub const CONTAINER_NAME: &str = "cloud-sql-proxy";

pub const SCRATCH_VOLUME: &str = "cloudsql";
pub const CREDENTIALS_VOLUME: &str = "sql-service-token-account";
pub const CA_VOLUME: &str = "sql-ca-certificates";

/// Volumes owned by the sidecar. Any pod volume with one of these names is
/// replaced on injection.
pub const RESERVED_VOLUMES: [&str; 3] = [SCRATCH_VOLUME, CREDENTIALS_VOLUME, CA_VOLUME];

const PROXY_BINARY: &str = "/cloud_sql_proxy";
const SCRATCH_MOUNT_PATH: &str = "/cloudsql";
const CREDENTIALS_MOUNT_PATH: &str = "/credentials";
const CREDENTIALS_FILE: &str = "/credentials/credentials.json";
const CA_MOUNT_PATH: &str = "/etc/ssl/certs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SidecarError {
    #[error("no database instance configured via defaults or annotation {annotation}")]
    MissingInstance { annotation: &'static str },
}

/// Per-request values resolved from annotations and process defaults.
#[derive(Debug, Clone, Default)]
pub struct SidecarSettings {
    pub image: String,
    pub instance: String,
    pub secret_name: Option<String>,
    pub ca_config_map: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
}

/// The container and volumes to inject into one pod spec.
#[derive(Debug, Clone)]
pub struct Sidecar {
    pub container: Container,
    pub volumes: Vec<Volume>,
}

/// Base container and volume definitions, built once and shared by every
/// request. `build` works on clones only.
#[derive(Debug, Clone)]
pub struct SidecarTemplate {
    container: Container,
    volumes: Vec<Volume>,
    credentials_volume: Volume,
    ca_volume: Volume,
}

impl Default for SidecarTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl SidecarTemplate {
    pub fn new() -> Self {
        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(DEFAULT_IMAGE.to_string()),
            command: Some(vec![
                PROXY_BINARY.to_string(),
                format!("-dir={SCRATCH_MOUNT_PATH}"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: SCRATCH_VOLUME.to_string(),
                mount_path: SCRATCH_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let scratch_volume = Volume {
            name: SCRATCH_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };

        let credentials_volume = Volume {
            name: CREDENTIALS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource::default()),
            ..Default::default()
        };

        let ca_volume = Volume {
            name: CA_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource::default()),
            ..Default::default()
        };

        Self {
            container,
            volumes: vec![scratch_volume],
            credentials_volume,
            ca_volume,
        }
    }

    pub fn build(&self, settings: &SidecarSettings) -> Result<Sidecar, SidecarError> {
        if settings.instance.is_empty() {
            return Err(SidecarError::MissingInstance {
                annotation: crate::annotations::ANNOTATION_INSTANCE,
            });
        }

        let mut container = self.container.clone();
        let mut volumes = self.volumes.clone();
        let mut command = container.command.take().unwrap_or_default();
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);

        container.image = Some(settings.image.clone());

        if let Some(secret_name) = non_empty(&settings.secret_name) {
            mounts.push(VolumeMount {
                name: CREDENTIALS_VOLUME.to_string(),
                mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                ..Default::default()
            });
            let mut volume = self.credentials_volume.clone();
            if let Some(secret) = volume.secret.as_mut() {
                secret.secret_name = Some(secret_name.to_string());
            }
            volumes.push(volume);
            command.push(format!("-credential_file={CREDENTIALS_FILE}"));
        }

        if let Some(config_map) = non_empty(&settings.ca_config_map) {
            mounts.push(VolumeMount {
                name: CA_VOLUME.to_string(),
                mount_path: CA_MOUNT_PATH.to_string(),
                ..Default::default()
            });
            let mut volume = self.ca_volume.clone();
            if let Some(source) = volume.config_map.as_mut() {
                source.name = config_map.to_string();
            }
            volumes.push(volume);
        }

        command.push(format!(
            "-instances={}=tcp:127.0.0.1:3306",
            settings.instance
        ));
        container.command = Some(command);
        container.resources = resource_requests(settings);

        Ok(Sidecar { container, volumes })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn resource_requests(settings: &SidecarSettings) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = non_empty(&settings.cpu_request) {
        requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if let Some(memory) = non_empty(&settings.memory_request) {
        requests.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    if requests.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    })
}
