//! Owned-job index
//!
//! The binding and volume reconcilers need to find the finalization jobs that belong to a binding
//! without listing jobs on every run. This crate maintains that lookup from the job watch: each
//! `Job` is keyed by its namespace and the name of the `FluentPVCBinding` named by its controller
//! owner reference.
//!
//! ```text
//! [ Job ] --controller--> [ FluentPVCBinding ]
//! ```
//!
//! Jobs without a binding controller are ignored. A job whose controller changes is moved to its
//! new owner. The index is only ever written by the watch task; reconcilers take read locks.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;

use ahash::AHashMap as HashMap;
use fluent_pvc_operator_k8s_api::{owner, Completion, FluentPvcBinding, Job, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds jobs by namespace.
#[derive(Debug, Default)]
pub struct Index {
    namespaces: HashMap<String, NamespaceIndex>,
}

/// A job as seen by the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedJob {
    pub name: String,
    pub uid: Option<String>,
    pub completion: Option<Completion>,
}

#[derive(Debug, Default)]
struct NamespaceIndex {
    /// Jobs by the name of their controlling binding, then by job name.
    by_owner: HashMap<String, BTreeMap<String, OwnedJob>>,

    /// The controlling binding of each indexed job.
    owners: HashMap<String, String>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Returns the jobs controlled by the named binding, ordered by name.
    pub fn owned_by(&self, namespace: &str, binding: &str) -> Vec<OwnedJob> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.by_owner.get(binding))
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The total number of indexed jobs.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(|ns| ns.owners.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    fn remove(&mut self, namespace: &str, name: &str) {
        let Some(ns) = self.namespaces.get_mut(namespace) else {
            return;
        };
        ns.remove(name);
        if ns.owners.is_empty() {
            self.namespaces.remove(namespace);
        }
    }
}

impl kubert::index::IndexNamespacedResource<Job> for Index {
    fn apply(&mut self, job: Job) {
        let Some(namespace) = job.namespace() else {
            tracing::warn!(job = %job.name_any(), "Job has no namespace");
            return;
        };
        let name = job.name_unchecked();

        let owner = owner::controller_of(&job.metadata)
            .filter(|r| owner::is_kind::<FluentPvcBinding>(r))
            .map(|r| r.name.clone());
        let Some(owner) = owner else {
            // The job may have been released by its binding.
            self.remove(&namespace, &name);
            return;
        };

        let entry = OwnedJob {
            name: name.clone(),
            uid: job.uid(),
            completion: Completion::of(&job),
        };
        tracing::trace!(%namespace, %name, %owner, completion = ?entry.completion, "Indexing job");

        let ns = self.namespaces.entry(namespace).or_default();
        ns.remove(&name);
        ns.by_owner
            .entry(owner.clone())
            .or_default()
            .insert(name.clone(), entry);
        ns.owners.insert(name, owner);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::trace!(%namespace, %name, "Removing job");
        self.remove(&namespace, &name);
    }
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    fn remove(&mut self, name: &str) {
        let Some(owner) = self.owners.remove(name) else {
            return;
        };
        if let Some(jobs) = self.by_owner.get_mut(&owner) {
            jobs.remove(name);
            if jobs.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}
