#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod condition;
pub mod fluent_pvc;
pub mod inject;
pub mod job;
pub mod keys;
pub mod owner;

pub use self::{
    binding::{FluentPvcBinding, FluentPvcBindingSpec, FluentPvcBindingStatus, ObjectIdentity},
    condition::{Condition, ConditionType, Conditions, Phase},
    fluent_pvc::{FluentPvc, FluentPvcSpec},
    job::Completion,
};
pub use k8s_openapi::{
    api::{
        self,
        batch::v1::{Job, JobSpec, JobStatus},
        core::v1::{
            Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodStatus, Volume, VolumeMount,
        },
        storage::v1::StorageClass,
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    Resource,
};

use chrono::{DateTime, Utc};

/// The API group shared by every custom resource of the operator.
pub const GROUP: &str = "fluent-pvc-operator.tech.zozo.com";

/// The served version of the custom resources.
pub const VERSION: &str = "v1alpha1";

/// Names the pod's lifecycle phase as reported in `status.phase`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Reads the phase of a pod. A pod without a reported phase has not been
    /// picked up by the kubelet yet and is considered pending.
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            None | Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some(_) => Self::Unknown,
        }
    }
}

/// Returns true if the object was created more than `window` before `now`.
/// Objects without a creation timestamp are never considered old.
pub fn created_before(
    meta: &ObjectMeta,
    window: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(Time(created)) = meta.creation_timestamp.as_ref() else {
        return false;
    };
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(*created) > window
}
