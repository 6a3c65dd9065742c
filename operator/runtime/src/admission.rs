use crate::{
    metrics::AdmissionMetrics,
    store::Store,
    volume::{claim_mount, claim_volume, finalizer_job_spec},
};
use anyhow::{anyhow, bail, ensure, Context, Result};
use fluent_pvc_operator_k8s_api::{
    inject, keys, owner, FluentPvc, FluentPvcBinding, FluentPvcBindingSpec, FluentPvcSpec, Job,
    ObjectIdentity, ObjectMeta, PersistentVolumeClaim, Pod, Resource, ResourceExt, StorageClass,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// FluentPVC templates are dry-run in this namespace under generated names.
const VALIDATION_NAMESPACE: &str = "default";
const VALIDATION_NAME_PREFIX: &str = "fluent-pvc-validation-";

/// Serves the pod mutation and validation webhooks.
#[derive(Clone)]
pub struct Admission<S> {
    store: S,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// The webhook endpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    PodMutate,
    PodMutateOnDelete,
    PodValidate,
    FluentPvcValidate,
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Route ===

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/pod/mutate" => Some(Self::PodMutate),
            "/pod/mutate-on-delete" => Some(Self::PodMutateOnDelete),
            "/pod/validate" => Some(Self::PodValidate),
            "/fluent-pvc/validate" => Some(Self::FluentPvcValidate),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::PodMutate => "pod_mutate",
            Self::PodMutateOnDelete => "pod_mutate_on_delete",
            Self::PodValidate => "pod_validate",
            Self::FluentPvcValidate => "fluent_pvc_validate",
        }
    }
}

// === impl Admission ===

impl<S: Store> tower::Service<Request<hyper::body::Incoming>> for Admission<S> {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let route = match Route::from_path(req.uri().path()) {
            Some(route) if req.method() == http::Method::POST => route,
            _ => {
                return Box::pin(future::ready(response(
                    http::StatusCode::NOT_FOUND,
                    Body::default(),
                )))
            }
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(route, req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl<S: Store> Admission<S> {
    pub fn new(store: S, metrics: AdmissionMetrics) -> Self {
        Self { store, metrics }
    }

    pub(crate) async fn admit(&self, route: Route, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = match route {
            Route::PodMutate => self.mutate_pod(&req).await,
            Route::PodMutateOnDelete => self.mark_out_of_use(&req).await,
            Route::PodValidate => validate_pod(&req),
            Route::FluentPvcValidate => self.validate_fluent_pvc(&req).await,
        };
        self.metrics.review(route.as_str(), rsp.allowed);
        rsp
    }

    /// Provisions a claim and a binding for an annotated pod and responds with
    /// the patch that wires them, and the sidecar, into the pod.
    async fn mutate_pod(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        if req.operation != Operation::Create {
            return rsp;
        }

        let pod = match decode::<Pod>(req.object.as_ref()) {
            Ok(pod) => pod,
            Err(error) => {
                info!(%error, "Failed to parse pod");
                return rsp.deny(error);
            }
        };
        if keys::fluent_pvc_name(&pod.metadata).is_none() {
            trace!("Pod is not annotated");
            return rsp;
        }

        let namespace = namespace_of(req, &pod);
        let patch = self
            .provision(&namespace, &pod)
            .await
            .and_then(|patched| patched.map(|p| diff(&pod, &p)).transpose());
        let patch = match patch {
            Ok(Some(patch)) => patch,
            Ok(None) => return rsp,
            Err(error) => {
                let error = format!("{error:#}");
                warn!(%namespace, pod = %pod.name_any(), %error, "Denied");
                return rsp.deny(error);
            }
        };
        match rsp.with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => AdmissionResponse::from(req).deny(error),
        }
    }

    /// Creates the claim and binding of a pod and returns the pod as it must
    /// be admitted, or `None` if the pod was already provisioned.
    pub(crate) async fn provision(&self, namespace: &str, pod: &Pod) -> Result<Option<Pod>> {
        let config_name = keys::fluent_pvc_name(&pod.metadata).unwrap_or_default();
        if let Some(pvc) = self.owned_claim(namespace, pod, config_name).await? {
            debug!(pvc = %pvc.name_any(), "Pod already mounts a provisioned claim");
            return Ok(None);
        }

        let config = self
            .store
            .get::<FluentPvc>(None, config_name)
            .await
            .context("failed to get FluentPVC")?
            .ok_or_else(|| anyhow!("FluentPVC {config_name} not found"))?;

        let pvc = self
            .store
            .create(&claim(namespace, &config)?)
            .await
            .context("failed to create PVC")?;
        let pvc_name = pvc.name_any();
        info!(%namespace, pvc = %pvc_name, "Created PVC");

        let mut binding = FluentPvcBinding::new(
            &pvc_name,
            FluentPvcBindingSpec {
                fluent_pvc: ObjectIdentity::of(&config),
                pvc: ObjectIdentity::of(&pvc),
                // Pods created by controllers have no name or uid yet.
                pod: ObjectIdentity {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    uid: pod.metadata.uid.clone().unwrap_or_default(),
                },
            },
        );
        let controller = config
            .controller_owner_ref(&())
            .ok_or_else(|| anyhow!("FluentPVC {config_name} has no uid"))?;
        binding.metadata.namespace = Some(namespace.to_string());
        binding.metadata.owner_references = Some(vec![controller]);
        self.store
            .create(&binding)
            .await
            .context("failed to create FluentPVCBinding")?;
        info!(%namespace, binding = %pvc_name, "Created FluentPVCBinding");

        let mut patched = pod.clone();
        patched
            .labels_mut()
            .insert(keys::BINDING_NAME.to_string(), pvc_name.clone());
        let spec = patched.spec.get_or_insert_with(Default::default);
        for volume in &config.spec.common_volumes {
            inject::volume(spec, volume);
        }
        inject::volume(spec, &claim_volume(&config.spec, &pvc_name));
        inject::container(spec, &config.spec.sidecar_container_template);
        for mount in &config.spec.common_volume_mounts {
            inject::volume_mount(spec, mount);
        }
        inject::volume_mount(spec, &claim_mount(&config.spec));
        for env in &config.spec.common_envs {
            inject::env(spec, env);
        }

        Ok(Some(patched))
    }

    /// Marks the claim of a deleted pod so the binding can tell a deletion
    /// from a disappearance. Deletion is never blocked.
    async fn mark_out_of_use(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        if req.operation != Operation::Delete {
            return rsp;
        }

        let pod = match decode::<Pod>(req.old_object.as_ref()) {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, "Failed to parse deleted pod");
                return rsp;
            }
        };
        let namespace = namespace_of(req, &pod);
        if let Err(error) = self.release_claim(&namespace, &pod).await {
            warn!(%namespace, pod = %pod.name_any(), %error, "Failed to mark PVC out of use");
        }
        rsp
    }

    async fn release_claim(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let Some(config_name) = keys::fluent_pvc_name(&pod.metadata) else {
            return Ok(());
        };
        let Some(pvc) = self.owned_claim(namespace, pod, config_name).await? else {
            debug!("Pod has no provisioned claim");
            return Ok(());
        };

        let patch = serde_json::json!({
            "metadata": {
                "annotations": { (keys::PVC_OUT_OF_USE): "true" },
            },
        });
        self.store
            .patch::<PersistentVolumeClaim>(Some(namespace), &pvc.name_any(), &patch)
            .await?;
        info!(%namespace, pvc = %pvc.name_any(), "Marked PVC out of use");
        Ok(())
    }

    /// Finds the claim mounted by the pod that was provisioned for the named
    /// config.
    async fn owned_claim(
        &self,
        namespace: &str,
        pod: &Pod,
        config_name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let claims = pod
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter().flatten())
            .filter_map(|v| v.persistent_volume_claim.as_ref());
        for claim in claims {
            let pvc = self
                .store
                .get::<PersistentVolumeClaim>(Some(namespace), &claim.claim_name)
                .await?;
            if let Some(pvc) = pvc {
                if owner::is_owned_by::<FluentPvc>(&pvc.metadata, config_name) {
                    return Ok(Some(pvc));
                }
            }
        }
        Ok(None)
    }

    async fn validate_fluent_pvc(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        if req.operation == Operation::Delete {
            return rsp;
        }

        let (obj, spec) = match parse_spec::<FluentPvcSpec>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse FluentPVC spec");
                return rsp.deny(error);
            }
        };
        if let Err(error) = self.validate_spec(&spec).await {
            let error = format!("{error:#}");
            info!(%error, name = %obj.name_any(), "Denied");
            return rsp.deny(error);
        }
        rsp
    }

    async fn validate_spec(&self, spec: &FluentPvcSpec) -> Result<()> {
        let template = &spec.pvc_spec_template;
        let modes = template.access_modes.as_deref().unwrap_or_default();
        ensure!(
            !modes.is_empty(),
            "pvcSpecTemplate must declare an access mode"
        );
        if let Some(mode) = modes.iter().find(|m| *m != "ReadWriteOnce") {
            bail!("pvcSpecTemplate access mode {mode} is not supported; only ReadWriteOnce is");
        }

        // An empty class disables dynamic provisioning.
        if let Some(class) = template.storage_class_name.as_deref().filter(|c| !c.is_empty()) {
            let found = self.store.get::<StorageClass>(None, class).await?;
            ensure!(found.is_some(), "StorageClass {class} not found");
        }

        ensure!(
            is_dns_label(&spec.pvc_volume_name),
            "pvcVolumeName {:?} is not a valid DNS label",
            spec.pvc_volume_name
        );
        let path = &spec.pvc_volume_mount_path;
        ensure!(!path.is_empty(), "pvcVolumeMountPath must not be empty");
        ensure!(!path.contains(':'), "pvcVolumeMountPath must not contain ':'");
        ensure!(
            !spec.sidecar_container_template.name.is_empty(),
            "sidecarContainerTemplate must be named"
        );

        // Let the API server judge the templates as they will be created.
        let metadata = ObjectMeta {
            generate_name: Some(VALIDATION_NAME_PREFIX.to_string()),
            namespace: Some(VALIDATION_NAMESPACE.to_string()),
            ..Default::default()
        };
        let job = Job {
            metadata: metadata.clone(),
            spec: Some(finalizer_job_spec(spec, VALIDATION_NAME_PREFIX)),
            status: None,
        };
        self.store
            .dry_run_create(&job)
            .await
            .context("pvcFinalizerJobSpecTemplate is invalid")?;
        let pvc = PersistentVolumeClaim {
            metadata,
            spec: Some(template.clone()),
            status: None,
        };
        self.store
            .dry_run_create(&pvc)
            .await
            .context("pvcSpecTemplate is invalid")?;
        Ok(())
    }
}

fn validate_pod(req: &AdmissionRequest) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(req);
    if req.operation == Operation::Delete {
        return rsp;
    }
    let pod = match decode::<Pod>(req.object.as_ref()) {
        Ok(pod) => pod,
        Err(error) => {
            info!(%error, "Failed to parse pod");
            return rsp.deny(error);
        }
    };
    let Some(config_name) = keys::fluent_pvc_name(&pod.metadata) else {
        return rsp;
    };
    if config_name.is_empty() {
        return rsp.deny(format!(
            "annotation {} must name a FluentPVC",
            keys::FLUENT_PVC_NAME
        ));
    }
    if pod.spec.as_ref().map_or(true, |s| s.containers.is_empty()) {
        return rsp.deny("pod must declare at least one container");
    }
    rsp
}

fn diff(pod: &Pod, patched: &Pod) -> Result<json_patch::Patch> {
    Ok(json_patch::diff(
        &serde_json::to_value(pod)?,
        &serde_json::to_value(patched)?,
    ))
}

/// Builds the claim provisioned for a pod. The name is generated by the API
/// server.
fn claim(namespace: &str, config: &FluentPvc) -> Result<PersistentVolumeClaim> {
    let config_name = config.name_any();
    let owner = owner::reference_to(config)
        .ok_or_else(|| anyhow!("FluentPVC {config_name} has no uid"))?;
    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(format!("{config_name}-")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                keys::FLUENT_PVC_NAME.to_string(),
                config_name.clone(),
            )])),
            finalizers: Some(vec![keys::PVC_FINALIZER.to_string()]),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(config.spec.pvc_spec_template.clone()),
        status: None,
    })
}

/// Pods submitted through controllers may omit their namespace.
fn namespace_of(req: &AdmissionRequest, pod: &Pod) -> String {
    req.namespace
        .clone()
        .or_else(|| pod.namespace())
        .unwrap_or_else(|| "default".to_string())
}

fn decode<T: DeserializeOwned>(obj: Option<&DynamicObject>) -> Result<T> {
    let obj = obj.ok_or_else(|| anyhow!("admission request missing object"))?;
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn parse_spec<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<(&DynamicObject, T)> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

/// RFC 1123 label: lowercase alphanumerics and '-', starting and ending with
/// an alphanumeric, at most 63 characters.
fn is_dns_label(s: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !s.is_empty()
        && s.len() <= 63
        && s.starts_with(alnum)
        && s.ends_with(alnum)
        && s.chars().all(|c| alnum(c) || c == '-')
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    response(http::StatusCode::OK, Body::from(bytes))
}

fn response(status: http::StatusCode, body: Body) -> Result<Response<Body>, Error> {
    let mut rsp = Response::new(body);
    *rsp.status_mut() = status;
    if status == http::StatusCode::OK {
        rsp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
    }
    Ok(rsp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes() {
        assert_eq!(Route::from_path("/pod/mutate"), Some(Route::PodMutate));
        assert_eq!(
            Route::from_path("/pod/mutate-on-delete"),
            Some(Route::PodMutateOnDelete)
        );
        assert_eq!(Route::from_path("/pod/validate"), Some(Route::PodValidate));
        assert_eq!(
            Route::from_path("/fluent-pvc/validate"),
            Some(Route::FluentPvcValidate)
        );
        assert_eq!(Route::from_path("/"), None);
        assert_eq!(Route::from_path("/pod/mutate/"), None);
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("fluent-pvc"));
        assert!(is_dns_label("a1"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-fluent"));
        assert!(!is_dns_label("fluent-"));
        assert!(!is_dns_label("Fluent"));
        assert!(!is_dns_label("fluent_pvc"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
