//! Releases a claim once its binding has been finalized: applies the
//! finalization job, then removes the protective finalizer and deletes the
//! claim.

use crate::{store, Error, Result, Store};
use fluent_pvc_operator_k8s_api::{
    inject, keys, owner, ConditionType, FluentPvc, FluentPvcBinding, FluentPvcSpec, Job, JobSpec,
    ObjectMeta, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Resource, ResourceExt,
    Volume, VolumeMount,
};
use fluent_pvc_operator_k8s_index::SharedIndex;
use kube::{
    api::{DeleteParams, Preconditions},
    runtime::controller::Action,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info, warn};

pub struct VolumeReconciler<S> {
    store: S,
    jobs: SharedIndex,
    retry_delay: Duration,
}

impl<S: Store> VolumeReconciler<S> {
    pub fn new(store: S, jobs: SharedIndex, retry_delay: Duration) -> Self {
        Self {
            store,
            jobs,
            retry_delay,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut pvc) = self
            .store
            .get::<PersistentVolumeClaim>(Some(namespace), name)
            .await?
        else {
            debug!("PVC not found");
            return Ok(Action::await_change());
        };

        let Some(binding) = self
            .store
            .get::<FluentPvcBinding>(Some(namespace), name)
            .await?
        else {
            debug!("PVC has no binding");
            return Ok(Action::await_change());
        };
        if !binding.spec.pvc.matches_uid(&pvc) {
            debug!("PVC is not the one recorded by its binding");
            return Ok(Action::await_change());
        }
        if binding.is_condition_true(ConditionType::Unknown) {
            debug!("Binding is in an unknown state; skipping");
            return Ok(Action::await_change());
        }

        let requeue = Action::requeue(self.retry_delay);
        if !binding.is_condition_true(ConditionType::OutOfUse) {
            debug!("PVC is still in use");
            return Ok(requeue);
        }

        if !binding.is_condition_true(ConditionType::FinalizerJobApplied) {
            let jobs = self.jobs.read().owned_by(namespace, name);
            if !jobs.is_empty() {
                debug!("Waiting for the finalizer job to be observed by the binding");
                return Ok(requeue);
            }
            self.apply_job(&binding, &pvc).await?;
            return Ok(requeue);
        }

        let succeeded = binding.is_condition_true(ConditionType::FinalizerJobSucceeded);
        let failed = binding.is_condition_true(ConditionType::FinalizerJobFailed);
        if !succeeded && !failed {
            debug!("Waiting for the finalizer job to finish");
            return Ok(requeue);
        }
        if failed {
            warn!("Finalizer job failed; keeping PVC");
            return Ok(requeue);
        }

        if keys::remove_finalizer(&mut pvc.metadata, keys::PVC_FINALIZER) {
            match self.store.update(&pvc).await {
                Ok(_) => info!("Removed PVC finalizer"),
                Err(store::Error::Conflict(error)) => {
                    debug!(%error, "PVC changed while removing its finalizer");
                    return Ok(requeue);
                }
                Err(error) => return Err(error.into()),
            }
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: pvc.uid(),
                resource_version: None,
            }),
            ..DeleteParams::background()
        };
        self.store
            .delete::<PersistentVolumeClaim>(Some(namespace), name, &params)
            .await?;
        info!("Deleted PVC");
        Ok(Action::await_change())
    }

    /// Creates the binding's finalization job, or repairs the controller of an
    /// existing one.
    async fn apply_job(
        &self,
        binding: &FluentPvcBinding,
        pvc: &PersistentVolumeClaim,
    ) -> Result<()> {
        let config_name = &binding.spec.fluent_pvc.name;
        let config = self
            .store
            .get::<FluentPvc>(None, config_name)
            .await?
            .ok_or_else(|| Error::FluentPvcNotFound(config_name.clone()))?;

        let namespace = binding.namespace();
        let name = binding.name_any();
        match self.store.get::<Job>(namespace.as_deref(), &name).await? {
            None => {
                let job = finalizer_job(binding, &config, pvc)?;
                match self.store.create(&job).await {
                    Ok(job) => info!(job = %job.name_any(), "Created finalizer job"),
                    Err(store::Error::AlreadyExists(_)) => {
                        debug!("Finalizer job already exists")
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            Some(mut job) => {
                let changed = owner::set_controller(&mut job.metadata, binding).ok_or_else(
                    || Error::Unpersisted {
                        kind: "FluentPVCBinding",
                        name: name.clone(),
                    },
                )?;
                if changed {
                    self.store.update(&job).await?;
                    info!(job = %name, "Adopted finalizer job");
                }
            }
        }
        Ok(())
    }
}

/// Renders the finalization job of a binding, controlled by the binding.
fn finalizer_job(
    binding: &FluentPvcBinding,
    config: &FluentPvc,
    pvc: &PersistentVolumeClaim,
) -> Result<Job> {
    let name = binding.name_any();
    let owner = binding
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Unpersisted {
            kind: "FluentPVCBinding",
            name: name.clone(),
        })?;

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: binding.namespace(),
            labels: Some(BTreeMap::from([(
                keys::BINDING_NAME.to_string(),
                name.clone(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(finalizer_job_spec(&config.spec, &pvc.name_any())),
        status: None,
    })
}

/// Renders the config's job template with the claim, the common volumes and
/// the common env vars injected.
pub(crate) fn finalizer_job_spec(config: &FluentPvcSpec, claim_name: &str) -> JobSpec {
    let mut spec = config.pvc_finalizer_job_spec_template.clone();
    let pod = spec.template.spec.get_or_insert_with(Default::default);
    for volume in &config.common_volumes {
        inject::volume(pod, volume);
    }
    inject::volume(pod, &claim_volume(config, claim_name));
    for mount in &config.common_volume_mounts {
        inject::volume_mount(pod, mount);
    }
    inject::volume_mount(pod, &claim_mount(config));
    for env in &config.common_envs {
        inject::env(pod, env);
    }
    spec
}

pub(crate) fn claim_volume(config: &FluentPvcSpec, claim_name: &str) -> Volume {
    Volume {
        name: config.pvc_volume_name.clone(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

pub(crate) fn claim_mount(config: &FluentPvcSpec) -> VolumeMount {
    VolumeMount {
        name: config.pvc_volume_name.clone(),
        mount_path: config.pvc_volume_mount_path.clone(),
        ..Default::default()
    }
}
