//! Drives a binding through its lifecycle from the state of its pod, its
//! claim and its finalization jobs.
//!
//! ```text
//! Pending -> Ready -> OutOfUse -> FinalizerJobApplied -> FinalizerJobSucceeded -> (deleted)
//!                                                     \-> FinalizerJobFailed
//! any -> Unknown
//! ```
//!
//! Every run starts from the stored state, so a missed or reordered event is
//! corrected by the next one (or by the periodic resync).

use crate::{store::Store, Error, Result};
use chrono::{DateTime, Utc};
use fluent_pvc_operator_k8s_api::{
    created_before, keys, owner, Completion, ConditionType, FluentPvc, FluentPvcBinding,
    ObjectIdentity, PersistentVolumeClaim, Pod, PodPhase, ResourceExt, Time,
};
use fluent_pvc_operator_k8s_index::SharedIndex;
use kube::{
    api::{DeleteParams, ListParams, Preconditions},
    runtime::controller::Action,
};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct BindingReconciler<S> {
    store: S,
    jobs: SharedIndex,
    grace_period: Duration,
}

impl<S: Store> BindingReconciler<S> {
    /// `grace_period` bounds how long a binding may wait for its pod and
    /// claim to show up before it is declared `Unknown`.
    pub fn new(store: S, jobs: SharedIndex, grace_period: Duration) -> Self {
        Self {
            store,
            jobs,
            grace_period,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut binding) = self
            .store
            .get::<FluentPvcBinding>(Some(namespace), name)
            .await?
        else {
            debug!("Binding not found");
            return Ok(Action::await_change());
        };

        let config_name = binding.spec.fluent_pvc.name.clone();
        let config = self
            .store
            .get::<FluentPvc>(None, &config_name)
            .await?
            .ok_or(Error::FluentPvcNotFound(config_name))?;
        match owner::set_controller(&mut binding.metadata, &config) {
            Some(false) => {}
            Some(true) => {
                debug!(fluentpvc = %config.name_any(), "Setting binding controller");
                binding = self.store.update(&binding).await?;
            }
            None => {
                return Err(Error::Unpersisted {
                    kind: "FluentPVC",
                    name: config.name_any(),
                })
            }
        }

        if binding.is_condition_true(ConditionType::Unknown) {
            debug!("Binding is in an unknown state; skipping");
            return Ok(Action::await_change());
        }

        let now = Utc::now();
        let pod = self.resolve_pod(namespace, &mut binding).await?;
        let pvc = match self.resolve_pvc(namespace, &binding).await? {
            Some(pvc) => Some(self.control_pvc(&binding, pvc).await?),
            None => None,
        };

        if let Some(pvc) = &pvc {
            if pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Lost") {
                let message = format!("PVC {} has lost its volume", pvc.name_any());
                return self.set_unknown(&binding, "PVCLost", message).await;
            }
        }

        match (pod, pvc) {
            (None, None) => self.pod_and_pvc_missing(&binding, now).await,
            (None, Some(pvc)) => self.pod_missing(namespace, &binding, &pvc, now).await,
            (Some(pod), None) => self.pvc_missing(&binding, &pod).await,
            (Some(pod), Some(_)) => self.pod_and_pvc_found(&binding, &pod).await,
        }
    }

    /// Finds the binding's pod. A pod that was replaced under the same name, or
    /// that reuses the name without mounting the binding's claim, is treated
    /// as missing. Records the pod's identity on the binding the first
    /// time the pod is observed.
    async fn resolve_pod(
        &self,
        namespace: &str,
        binding: &mut FluentPvcBinding,
    ) -> Result<Option<Pod>> {
        let pod = if binding.spec.pod.name.is_empty() {
            let selector = format!("{}={}", keys::BINDING_NAME, binding.name_any());
            let mut pods = self
                .store
                .list::<Pod>(Some(namespace), &ListParams::default().labels(&selector))
                .await?
                .items;
            if pods.len() > 1 {
                return Err(Error::AmbiguousPod {
                    count: pods.len(),
                    binding: binding.name_any(),
                });
            }
            pods.pop()
        } else {
            self.store
                .get::<Pod>(Some(namespace), &binding.spec.pod.name)
                .await?
        };

        let Some(pod) = pod else {
            return Ok(None);
        };
        if !binding.spec.pod.matches_uid(&pod) {
            debug!(pod = %pod.name_any(), "Pod has been replaced");
            return Ok(None);
        }

        if !binding.spec.pod.is_complete() {
            if !mounts_binding(&pod, binding) {
                debug!(pod = %pod.name_any(), "Pod does not mount the binding's PVC");
                return Ok(None);
            }
            binding.spec.pod = ObjectIdentity::of(&pod);
            debug!(pod = %binding.spec.pod.name, "Recording pod identity");
            *binding = self.store.update(&*binding).await?;
        }

        Ok(Some(pod))
    }

    async fn resolve_pvc(
        &self,
        namespace: &str,
        binding: &FluentPvcBinding,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let pvc = self
            .store
            .get::<PersistentVolumeClaim>(Some(namespace), &binding.spec.pvc.name)
            .await?;
        Ok(pvc.filter(|pvc| {
            let matches = binding.spec.pvc.matches_uid(pvc);
            if !matches {
                debug!(pvc = %pvc.name_any(), "PVC has been replaced");
            }
            matches
        }))
    }

    /// Makes the binding the controller of its claim.
    async fn control_pvc(
        &self,
        binding: &FluentPvcBinding,
        mut pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        match owner::set_controller(&mut pvc.metadata, binding) {
            Some(false) => Ok(pvc),
            Some(true) => {
                debug!(pvc = %pvc.name_any(), "Setting PVC controller");
                Ok(self.store.update(&pvc).await?)
            }
            None => Err(Error::Unpersisted {
                kind: "FluentPVCBinding",
                name: binding.name_any(),
            }),
        }
    }

    async fn pod_and_pvc_missing(
        &self,
        binding: &FluentPvcBinding,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        if !binding.is_condition_true(ConditionType::Ready) {
            if created_before(&binding.metadata, self.grace_period, now) {
                let message = format!(
                    "Neither pod {} nor PVC {} appeared within {:?}",
                    binding.spec.pod.name, binding.spec.pvc.name, self.grace_period
                );
                return self
                    .set_unknown(binding, "PodAndPVCNotFound", message)
                    .await;
            }
            debug!("Waiting for pod and PVC");
            return Ok(Action::await_change());
        }

        if !binding.is_condition_true(ConditionType::FinalizerJobSucceeded) {
            let message = format!(
                "Pod {} and PVC {} disappeared before the PVC was finalized",
                binding.spec.pod.name, binding.spec.pvc.name
            );
            return self
                .set_unknown(binding, "PodAndPVCNotFound", message)
                .await;
        }

        self.delete(binding).await
    }

    async fn pod_missing(
        &self,
        namespace: &str,
        binding: &FluentPvcBinding,
        pvc: &PersistentVolumeClaim,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        if binding.is_condition_true(ConditionType::FinalizerJobSucceeded) {
            if keys::has_finalizer(&pvc.metadata, keys::PVC_FINALIZER) {
                debug!(pvc = %pvc.name_any(), "Waiting for the PVC finalizer to be removed");
                return Ok(Action::await_change());
            }
            return self.delete(binding).await;
        }

        if !binding.is_condition_true(ConditionType::Ready) {
            if created_before(&binding.metadata, self.grace_period, now) {
                let message = format!(
                    "Pod {} did not appear within {:?}",
                    binding.spec.pod.name, self.grace_period
                );
                return self.set_unknown(binding, "PodNotFound", message).await;
            }
            debug!("Waiting for pod");
            return Ok(Action::await_change());
        }

        if !binding.is_condition_true(ConditionType::OutOfUse) {
            let reason = if keys::is_marked_out_of_use(&pvc.metadata) {
                "PodDeleted"
            } else {
                "PodNotFound"
            };
            let message = format!(
                "PVC {} is no longer used by pod {}",
                pvc.name_any(),
                binding.spec.pod.name
            );
            return self
                .set(binding, ConditionType::OutOfUse, reason, message)
                .await;
        }

        let jobs = self.jobs.read().owned_by(namespace, &binding.name_any());
        if jobs.is_empty() {
            debug!("Waiting for a finalizer job");
            return Ok(Action::await_change());
        }

        let now = Time(now);
        let mut status = binding.status.clone().unwrap_or_default();
        let names = jobs.iter().map(|j| j.name.as_str()).collect::<Vec<_>>();
        let mut changed = status.set(
            ConditionType::FinalizerJobApplied,
            "FinalizerJobFound",
            format!("Finalizer job {} is applied", names.join(", ")),
            now.clone(),
        );
        for job in &jobs {
            match job.completion {
                Some(Completion::Succeeded) => {
                    changed |= status.set(
                        ConditionType::FinalizerJobSucceeded,
                        "FinalizerJobSucceeded",
                        format!("Finalizer job {} succeeded", job.name),
                        now.clone(),
                    );
                    break;
                }
                Some(Completion::Failed) => {
                    changed |= status.set(
                        ConditionType::FinalizerJobFailed,
                        "FinalizerJobFailed",
                        format!("Finalizer job {} failed", job.name),
                        now.clone(),
                    );
                }
                None => {}
            }
        }

        if changed {
            info!(phase = ?status.phase(), "Updating binding status");
            self.store.update_status(binding, &status).await?;
        }
        Ok(Action::await_change())
    }

    async fn pvc_missing(&self, binding: &FluentPvcBinding, pod: &Pod) -> Result<Action> {
        match PodPhase::of(pod) {
            PodPhase::Pending | PodPhase::Unknown => {
                debug!(pod = %pod.name_any(), "Waiting for PVC");
                Ok(Action::await_change())
            }
            PodPhase::Running => {
                let message = format!(
                    "Pod {} is running but PVC {} is not found",
                    pod.name_any(),
                    binding.spec.pvc.name
                );
                self.set_unknown(binding, "PodFoundReadyButPVCNotFound", message)
                    .await
            }
            PodPhase::Succeeded | PodPhase::Failed => {
                if binding.is_condition_true(ConditionType::FinalizerJobSucceeded) {
                    return self.delete(binding).await;
                }
                let message = format!(
                    "Pod {} completed but PVC {} is not found",
                    pod.name_any(),
                    binding.spec.pvc.name
                );
                self.set_unknown(binding, "PodCompletedButPVCNotFound", message)
                    .await
            }
        }
    }

    async fn pod_and_pvc_found(&self, binding: &FluentPvcBinding, pod: &Pod) -> Result<Action> {
        let reason = match PodPhase::of(pod) {
            PodPhase::Pending | PodPhase::Running => "PodFoundPVCFound",
            // The claim outlives a completed pod until the pod object is
            // deleted; the binding stays ready until then.
            PodPhase::Succeeded | PodPhase::Failed => "PodCompletedPVCFound",
            PodPhase::Unknown => {
                debug!(pod = %pod.name_any(), "Pod is in an unknown phase");
                return Ok(Action::await_change());
            }
        };
        let message = format!(
            "Pod {} uses PVC {}",
            binding.spec.pod.name, binding.spec.pvc.name
        );
        self.set(binding, ConditionType::Ready, reason, message)
            .await
    }

    async fn set(
        &self,
        binding: &FluentPvcBinding,
        type_: ConditionType,
        reason: &str,
        message: String,
    ) -> Result<Action> {
        let mut status = binding.status.clone().unwrap_or_default();
        if status.set(type_, reason, message, Time(Utc::now())) {
            info!(condition = %type_, %reason, "Updating binding status");
            self.store.update_status(binding, &status).await?;
        }
        Ok(Action::await_change())
    }

    async fn set_unknown(
        &self,
        binding: &FluentPvcBinding,
        reason: &str,
        message: String,
    ) -> Result<Action> {
        error!(%reason, %message, "Binding is in an unknown state");
        self.set(binding, ConditionType::Unknown, reason, message)
            .await
    }

    async fn delete(&self, binding: &FluentPvcBinding) -> Result<Action> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: binding.uid(),
                resource_version: binding.resource_version(),
            }),
            ..DeleteParams::background()
        };
        self.store
            .delete::<FluentPvcBinding>(
                binding.namespace().as_deref(),
                &binding.name_any(),
                &params,
            )
            .await?;
        info!("Deleted binding");
        Ok(Action::await_change())
    }
}

/// Returns true if the pod mounts the binding's claim and selects the
/// binding's config.
fn mounts_binding(pod: &Pod, binding: &FluentPvcBinding) -> bool {
    let mut claims = pod
        .spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref());
    keys::fluent_pvc_name(&pod.metadata) == Some(binding.spec.fluent_pvc.name.as_str())
        && claims.any(|c| c.claim_name == binding.spec.pvc.name)
}
