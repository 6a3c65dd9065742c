use super::{
    admission_metrics, fluent_pvc, pod, request, store::FakeStore, CLAIM_PATH, CLAIM_VOLUME,
    CONFIG, FLUENT_PVC, NS, POD, SIDECAR,
};
use crate::{
    admission::{Admission, Route},
    k8s::{
        keys, owner, FluentPvc, FluentPvcBinding, Job, ObjectIdentity, ObjectMeta,
        PersistentVolumeClaim, Pod, ResourceExt, StorageClass,
    },
    AdmissionMetrics,
};
use pretty_assertions::assert_eq;
use prometheus_client::registry::Registry;

fn names<'a>(items: impl IntoIterator<Item = &'a String>) -> Vec<&'a str> {
    items.into_iter().map(String::as_str).collect()
}

fn storage_class(name: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: "kubernetes.io/no-provisioner".to_string(),
        ..Default::default()
    }
}

fn create(pod: &Pod) -> super::AdmissionRequest {
    request(POD, "CREATE", Some(serde_json::to_value(pod).unwrap()), None)
}

fn delete(pod: &Pod) -> super::AdmissionRequest {
    request(POD, "DELETE", None, Some(serde_json::to_value(pod).unwrap()))
}

#[tokio::test]
async fn provisions_claim_and_binding() {
    let store = FakeStore::default();
    let config = store.insert(fluent_pvc());
    let admission = Admission::new(store.clone(), admission_metrics());

    let patched = admission
        .provision(NS, &pod("app"))
        .await
        .unwrap()
        .expect("pod must be patched");

    let pvcs = store.all::<PersistentVolumeClaim>();
    assert_eq!(pvcs.len(), 1);
    let pvc = &pvcs[0];
    let name = pvc.name_any();
    assert!(name.starts_with("fluent-bit-"), "{name}");
    assert_eq!(pvc.labels().get(keys::FLUENT_PVC_NAME), Some(&CONFIG.to_string()));
    assert!(keys::has_finalizer(&pvc.metadata, keys::PVC_FINALIZER));
    assert!(owner::is_owned_by::<FluentPvc>(&pvc.metadata, CONFIG));
    assert_eq!(owner::controller_of(&pvc.metadata), None);
    assert_eq!(pvc.spec, Some(config.spec.pvc_spec_template.clone()));

    let binding = store
        .fetch::<FluentPvcBinding>(Some(NS), &name)
        .expect("binding must be named after its claim");
    assert!(owner::is_controlled_by(&binding.metadata, &config));
    assert_eq!(binding.spec.fluent_pvc, ObjectIdentity::of(&config));
    assert_eq!(binding.spec.pvc, ObjectIdentity::of(pvc));
    assert_eq!(
        binding.spec.pod,
        ObjectIdentity {
            name: "app".to_string(),
            uid: String::new(),
        }
    );
    assert_eq!(binding.status, None);

    assert_eq!(patched.labels().get(keys::BINDING_NAME), Some(&name));
    let spec = patched.spec.expect("pod must have a spec");
    assert_eq!(
        names(spec.containers.iter().map(|c| &c.name)),
        vec!["app", SIDECAR]
    );
    let volumes = spec.volumes.expect("pod must have volumes");
    assert_eq!(
        names(volumes.iter().map(|v| &v.name)),
        vec!["fluent-bit-config", CLAIM_VOLUME]
    );
    let claim = volumes[1]
        .persistent_volume_claim
        .as_ref()
        .expect("claim volume must reference the claim");
    assert_eq!(claim.claim_name, name);

    for container in &spec.containers {
        let mounts = container.volume_mounts.as_ref().expect("mounts");
        assert_eq!(
            names(mounts.iter().map(|m| &m.name)),
            vec!["fluent-bit-config", CLAIM_VOLUME],
            "{}",
            container.name
        );
        assert_eq!(mounts[1].mount_path, CLAIM_PATH);
        let env = container.env.as_ref().expect("env");
        assert_eq!(names(env.iter().map(|e| &e.name)), vec!["LOG_DIR"]);
    }
}

#[tokio::test]
async fn responds_with_json_patch() {
    let store = FakeStore::default();
    store.insert(fluent_pvc());
    let admission = Admission::new(store.clone(), admission_metrics());

    let pod = pod("app");
    let rsp = admission.admit(Route::PodMutate, create(&pod)).await;
    assert!(rsp.allowed);
    let patch: json_patch::Patch =
        serde_json::from_slice(&rsp.patch.expect("response must carry a patch")).unwrap();

    let mut doc = serde_json::to_value(&pod).unwrap();
    json_patch::patch(&mut doc, &patch).unwrap();
    let patched: Pod = serde_json::from_value(doc).unwrap();
    let pvc = store.all::<PersistentVolumeClaim>().remove(0);
    assert_eq!(
        patched.labels().get(keys::BINDING_NAME),
        Some(&pvc.name_any())
    );
    assert_eq!(patched.spec.unwrap().containers.len(), 2);
}

#[tokio::test]
async fn skips_provisioned_pods() {
    let store = FakeStore::default();
    store.insert(fluent_pvc());
    let admission = Admission::new(store.clone(), admission_metrics());

    let patched = admission
        .provision(NS, &pod("app"))
        .await
        .unwrap()
        .expect("pod must be patched");
    let writes = store.writes();

    let rsp = admission.admit(Route::PodMutate, create(&patched)).await;
    assert!(rsp.allowed);
    assert_eq!(rsp.patch, None);
    assert_eq!(store.writes(), writes);
    assert_eq!(store.all::<PersistentVolumeClaim>().len(), 1);
}

#[tokio::test]
async fn denies_pods_of_unknown_configs() {
    let store = FakeStore::default();
    let admission = Admission::new(store.clone(), admission_metrics());

    let rsp = admission.admit(Route::PodMutate, create(&pod("app"))).await;
    assert!(!rsp.allowed);
    assert!(store.all::<PersistentVolumeClaim>().is_empty());
    assert!(store.all::<FluentPvcBinding>().is_empty());
}

#[tokio::test]
async fn denies_when_binding_cannot_be_created() {
    let store = FakeStore::default();
    store.insert(fluent_pvc());
    store.fail_creates::<FluentPvcBinding>();
    let admission = Admission::new(store.clone(), admission_metrics());

    let rsp = admission.admit(Route::PodMutate, create(&pod("app"))).await;
    assert!(!rsp.allowed);
    // The claim is left behind, labeled with its config.
    assert_eq!(store.all::<PersistentVolumeClaim>().len(), 1);
}

#[tokio::test]
async fn marks_claim_out_of_use_on_delete() {
    let store = FakeStore::default();
    store.insert(fluent_pvc());
    let admission = Admission::new(store.clone(), admission_metrics());
    let patched = admission
        .provision(NS, &pod("app"))
        .await
        .unwrap()
        .expect("pod must be patched");

    let rsp = admission
        .admit(Route::PodMutateOnDelete, delete(&patched))
        .await;
    assert!(rsp.allowed);
    let pvc = store.all::<PersistentVolumeClaim>().remove(0);
    assert!(keys::is_marked_out_of_use(&pvc.metadata));
    assert!(keys::has_finalizer(&pvc.metadata, keys::PVC_FINALIZER));
}

#[tokio::test]
async fn allows_deletes_without_claims() {
    let store = FakeStore::default();
    store.insert(fluent_pvc());
    let admission = Admission::new(store.clone(), admission_metrics());

    let rsp = admission
        .admit(Route::PodMutateOnDelete, delete(&pod("app")))
        .await;
    assert!(rsp.allowed);

    let mut unannotated = pod("other");
    unannotated.metadata.annotations = None;
    let rsp = admission
        .admit(Route::PodMutateOnDelete, delete(&unannotated))
        .await;
    assert!(rsp.allowed);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn validates_pods() {
    let admission = Admission::new(FakeStore::default(), admission_metrics());

    let rsp = admission.admit(Route::PodValidate, create(&pod("app"))).await;
    assert!(rsp.allowed);

    let mut unannotated = pod("app");
    unannotated.metadata.annotations = None;
    let rsp = admission
        .admit(Route::PodValidate, create(&unannotated))
        .await;
    assert!(rsp.allowed);

    let mut unnamed = pod("app");
    unnamed
        .annotations_mut()
        .insert(keys::FLUENT_PVC_NAME.to_string(), String::new());
    let rsp = admission.admit(Route::PodValidate, create(&unnamed)).await;
    assert!(!rsp.allowed);

    let mut empty = pod("app");
    empty.spec = None;
    let rsp = admission.admit(Route::PodValidate, create(&empty)).await;
    assert!(!rsp.allowed);
}

#[tokio::test]
async fn validates_fluent_pvcs() {
    let store = FakeStore::default();
    store.insert(storage_class("standard"));
    let admission = Admission::new(store, admission_metrics());
    let validate = |config: FluentPvc| {
        let admission = admission.clone();
        async move {
            let req = request(
                FLUENT_PVC,
                "CREATE",
                Some(serde_json::to_value(&config).unwrap()),
                None,
            );
            admission.admit(Route::FluentPvcValidate, req).await.allowed
        }
    };

    assert!(validate(fluent_pvc()).await);

    let mut config = fluent_pvc();
    config.spec.pvc_spec_template.access_modes = Some(vec![
        "ReadWriteOnce".to_string(),
        "ReadWriteMany".to_string(),
    ]);
    assert!(!validate(config).await, "only ReadWriteOnce is allowed");

    let mut config = fluent_pvc();
    config.spec.pvc_spec_template.access_modes = None;
    assert!(!validate(config).await, "an access mode is required");

    let mut config = fluent_pvc();
    config.spec.pvc_spec_template.storage_class_name = Some("fast".to_string());
    assert!(!validate(config).await, "the storage class must exist");

    let mut config = fluent_pvc();
    config.spec.pvc_spec_template.storage_class_name = None;
    assert!(validate(config).await, "the storage class is optional");

    let mut config = fluent_pvc();
    config.spec.pvc_spec_template.storage_class_name = Some(String::new());
    assert!(validate(config).await, "an empty class disables provisioning");

    let mut config = fluent_pvc();
    config.spec.pvc_volume_name = "Fluent_PVC".to_string();
    assert!(!validate(config).await, "the volume name must be a DNS label");

    let mut config = fluent_pvc();
    config.spec.pvc_volume_mount_path = "/var/log:rw".to_string();
    assert!(!validate(config).await, "the mount path must not contain ':'");

    let mut config = fluent_pvc();
    config.spec.sidecar_container_template.name = String::new();
    assert!(!validate(config).await, "the sidecar must be named");
}

#[tokio::test]
async fn dry_runs_fluent_pvc_templates() {
    let store = FakeStore::default();
    store.insert(storage_class("standard"));
    let admission = Admission::new(store.clone(), admission_metrics());
    let validate = |config: FluentPvc| {
        let admission = admission.clone();
        async move {
            let req = request(
                FLUENT_PVC,
                "CREATE",
                Some(serde_json::to_value(&config).unwrap()),
                None,
            );
            admission.admit(Route::FluentPvcValidate, req).await
        }
    };

    let rsp = validate(fluent_pvc()).await;
    assert!(rsp.allowed);
    assert_eq!(store.dry_runs(), 2);
    assert_eq!(store.writes(), 0);
    assert!(store.all::<Job>().is_empty());
    assert!(store.all::<PersistentVolumeClaim>().is_empty());

    let mut config = fluent_pvc();
    let job = config.spec.pvc_finalizer_job_spec_template.template.spec.as_mut().unwrap();
    job.restart_policy = Some("Always".to_string());
    let rsp = validate(config).await;
    assert!(!rsp.allowed);
    assert!(
        rsp.result.message.contains("pvcFinalizerJobSpecTemplate is invalid"),
        "{}",
        rsp.result.message
    );

    // Common volumes do not make up for a template without containers.
    let mut config = fluent_pvc();
    let job = config.spec.pvc_finalizer_job_spec_template.template.spec.as_mut().unwrap();
    job.containers.clear();
    assert!(!validate(config).await.allowed);

    store.fail_creates::<PersistentVolumeClaim>();
    let rsp = validate(fluent_pvc()).await;
    assert!(!rsp.allowed);
    assert!(
        rsp.result.message.contains("pvcSpecTemplate is invalid"),
        "{}",
        rsp.result.message
    );
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn records_reviews() {
    let mut registry = Registry::default();
    let metrics = AdmissionMetrics::register(registry.sub_registry_with_prefix("admission"));
    let admission = Admission::new(FakeStore::default(), metrics);

    admission
        .admit(Route::PodValidate, create(&pod("app")))
        .await;
    let mut empty = pod("app");
    empty.spec = None;
    admission.admit(Route::PodValidate, create(&empty)).await;

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &registry).unwrap();
    assert!(
        text.contains(r#"admission_reviews_total{operation="pod_validate",result="allowed"} 1"#),
        "{text}"
    );
    assert!(
        text.contains(r#"admission_reviews_total{operation="pod_validate",result="denied"} 1"#),
        "{text}"
    );
}
