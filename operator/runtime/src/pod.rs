use crate::{store, Error, Result, Store};
use fluent_pvc_operator_k8s_api::{keys, FluentPvc, Pod, PodPhase, ResourceExt};
use kube::{
    api::{DeleteParams, Preconditions},
    runtime::controller::Action,
};
use tracing::{debug, info};

/// Pods whose sidecar crashed are deleted with at least this grace period so
/// the application can still flush its logs.
const MIN_DELETION_GRACE_SECS: i64 = 5 * 60;

/// Deletes running pods whose log-shipping sidecar has terminated with a
/// failure, when their config asks for it.
pub struct PodReconciler<S> {
    store: S,
}

impl<S: Store> PodReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(pod) = self.store.get::<Pod>(Some(namespace), name).await? else {
            debug!("Pod not found");
            return Ok(Action::await_change());
        };
        let Some(config_name) = keys::fluent_pvc_name(&pod.metadata) else {
            return Ok(Action::await_change());
        };
        if PodPhase::of(&pod) != PodPhase::Running {
            return Ok(Action::await_change());
        }

        let config = self
            .store
            .get::<FluentPvc>(None, config_name)
            .await?
            .ok_or_else(|| Error::FluentPvcNotFound(config_name.to_string()))?;
        if !config
            .spec
            .delete_pod_if_sidecar_container_termination_detected
        {
            return Ok(Action::await_change());
        }

        let sidecar = &config.spec.sidecar_container_template.name;
        let status = pod
            .status
            .iter()
            .flat_map(|s| s.container_statuses.iter().flatten())
            .find(|s| &s.name == sidecar)
            .ok_or_else(|| Error::MissingContainerStatus {
                pod: name.to_string(),
                container: sidecar.clone(),
            })?;

        let current = status.state.as_ref().and_then(|s| s.terminated.as_ref());
        if status.restart_count == 0 && current.is_none() {
            return Ok(Action::await_change());
        }
        let last = status.last_state.as_ref().and_then(|s| s.terminated.as_ref());
        let exit_code = match current.or(last) {
            Some(terminated) if terminated.exit_code != 0 => terminated.exit_code,
            _ => return Ok(Action::await_change()),
        };

        info!(
            %sidecar,
            exit_code,
            restarts = status.restart_count,
            "Sidecar terminated abnormally; deleting pod"
        );
        let grace = pod
            .spec
            .as_ref()
            .and_then(|s| s.termination_grace_period_seconds)
            .unwrap_or_default()
            .max(MIN_DELETION_GRACE_SECS);
        let params = DeleteParams {
            grace_period_seconds: Some(u32::try_from(grace).unwrap_or(u32::MAX)),
            preconditions: Some(Preconditions {
                uid: pod.uid(),
                resource_version: pod.resource_version(),
            }),
            ..DeleteParams::background()
        };
        match self.store.delete::<Pod>(Some(namespace), name, &params).await {
            Ok(()) => Ok(Action::await_change()),
            Err(store::Error::Conflict(error)) => {
                debug!(%error, "Pod changed before it could be deleted");
                Ok(Action::await_change())
            }
            Err(error) => Err(error.into()),
        }
    }
}
