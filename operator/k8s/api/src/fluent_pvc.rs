use k8s_openapi::api::{
    batch::v1::JobSpec,
    core::v1::{Container, EnvVar, PersistentVolumeClaimSpec, Volume, VolumeMount},
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Describes how pods selected by name are given a claim, a log-shipping
/// sidecar and a finalization job.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "fluent-pvc-operator.tech.zozo.com",
    version = "v1alpha1",
    kind = "FluentPVC",
    root = "FluentPvc",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct FluentPvcSpec {
    /// Template of the claim provisioned for each pod.
    pub pvc_spec_template: PersistentVolumeClaimSpec,

    /// Template of the job that drains the claim once its pod is gone.
    pub pvc_finalizer_job_spec_template: JobSpec,

    /// Name of the pod volume that mounts the claim.
    pub pvc_volume_name: String,

    /// Path at which every container mounts the claim.
    pub pvc_volume_mount_path: String,

    pub sidecar_container_template: Container,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_envs: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_volume_mounts: Vec<VolumeMount>,

    /// Deletes a running pod once its sidecar has exited with a failure.
    #[serde(default)]
    pub delete_pod_if_sidecar_container_termination_detected: bool,
}
