#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
mod binding;
mod controller;
mod metrics;
mod pod;
mod resync;
pub mod store;
mod volume;


pub use self::{
    admission::Admission,
    args::Args,
    binding::BindingReconciler,
    controller::Reconcile,
    metrics::{AdmissionMetrics, ReconcileMetrics},
    pod::PodReconciler,
    resync::Resync,
    store::{KubeStore, Store},
    volume::VolumeReconciler,
};
pub use fluent_pvc_operator_k8s_api as k8s;
pub use fluent_pvc_operator_k8s_index as index;

use thiserror::Error;

/// Errors returned by a reconcile.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),

    #[error("FluentPVC {0} not found")]
    FluentPvcNotFound(String),

    #[error("{kind} {name} has not been persisted")]
    Unpersisted { kind: &'static str, name: String },

    #[error("{count} pods are labeled for binding {binding}")]
    AmbiguousPod { count: usize, binding: String },

    #[error("pod {pod} has no status for container {container}")]
    MissingContainerStatus { pod: String, container: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Conflicts mean another writer got there first; the reconcile is simply
    /// retried against fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(store::Error::Conflict(_)))
    }
}
