use super::{admission_metrics, pod, reason, Harness, CONFIG, NS};
use crate::{
    admission::Admission,
    k8s::{
        keys, owner, ConditionType, FluentPvc, FluentPvcBinding, FluentPvcBindingSpec, Job,
        ObjectIdentity, ObjectMeta, PersistentVolumeClaim, Phase, Pod, Resource, ResourceExt, Time,
    },
    BindingReconciler, Error, Store,
};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;
use std::time::Duration;

/// A binding whose pod and claim were never created.
fn unbound(name: &str, config: &FluentPvc, created: DateTime<Utc>) -> FluentPvcBinding {
    let mut binding = FluentPvcBinding::new(
        name,
        FluentPvcBindingSpec {
            fluent_pvc: ObjectIdentity::of(config),
            pvc: ObjectIdentity {
                name: name.to_string(),
                uid: String::new(),
            },
            pod: ObjectIdentity {
                name: "app".to_string(),
                uid: String::new(),
            },
        },
    );
    binding.metadata.namespace = Some(NS.to_string());
    binding.metadata.creation_timestamp = Some(Time(created));
    binding.metadata.owner_references = config.controller_owner_ref(&()).map(|r| vec![r]);
    binding
}

fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(hours)
}

/// Moves the binding's creation out of the grace window.
fn backdate(test: &Harness, name: &str) {
    let mut binding = test.binding(name).expect("binding must exist");
    binding.metadata.creation_timestamp = Some(Time(hours_ago(2)));
    test.store.insert(binding);
}

fn job(name: &str, binding: &FluentPvcBinding) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            owner_references: binding.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn becomes_ready_once_pod_and_claim_exist() {
    let test = Harness::new();
    let (pod, name) = test.admit(pod("app"), "Running").await;

    let action = test.reconcile_binding(&name).await;
    assert_eq!(action, Action::await_change());

    let binding = test.binding(&name).expect("binding must exist");
    assert_eq!(binding.phase(), Phase::Ready);
    assert_eq!(reason(&binding, ConditionType::Ready), Some("PodFoundPVCFound"));
    assert_eq!(binding.spec.pod, ObjectIdentity::of(&pod));

    let pvc = test.pvc(&name).expect("claim must exist");
    assert!(owner::is_controlled_by(&pvc.metadata, &binding));
    assert!(owner::is_owned_by::<FluentPvc>(&pvc.metadata, CONFIG));
}

#[tokio::test]
async fn pending_pods_make_the_binding_ready() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Pending").await;

    test.reconcile_binding(&name).await;
    assert_eq!(test.binding(&name).unwrap().phase(), Phase::Ready);
}

#[tokio::test]
async fn reconciling_again_writes_nothing() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.reconcile_binding(&name).await;

    let writes = test.store.writes();
    test.reconcile_binding(&name).await;
    test.reconcile_binding(&name).await;
    assert_eq!(test.store.writes(), writes);
}

#[tokio::test]
async fn restores_binding_controller() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    let mut binding = test.binding(&name).unwrap();
    binding.metadata.owner_references = None;
    test.store.insert(binding);

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert!(owner::is_controlled_by(&binding.metadata, &test.config));
}

#[tokio::test]
async fn requires_fluent_pvc() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.store.remove::<FluentPvc>(None, CONFIG);

    let bindings = BindingReconciler::new(
        test.store.clone(),
        test.jobs.clone(),
        Duration::from_secs(3600),
    );
    let error = bindings.reconcile(NS, &name).await.unwrap_err();
    assert!(matches!(error, Error::FluentPvcNotFound(ref n) if n == CONFIG), "{error}");
}

#[tokio::test]
async fn absent_binding_is_done() {
    let test = Harness::new();
    let action = test.reconcile_binding("missing").await;
    assert_eq!(action, Action::await_change());
    assert_eq!(test.store.writes(), 0);
}

#[tokio::test]
async fn waits_for_pod_and_claim_within_grace_period() {
    let test = Harness::new();
    test.store.insert(unbound("fresh", &test.config, Utc::now()));
    test.store.insert(unbound("stale", &test.config, hours_ago(2)));

    test.reconcile_binding("fresh").await;
    assert_eq!(test.binding("fresh").unwrap().status, None);

    test.reconcile_binding("stale").await;
    let binding = test.binding("stale").unwrap();
    assert_eq!(binding.phase(), Phase::Unknown);
    assert_eq!(
        reason(&binding, ConditionType::Unknown),
        Some("PodAndPVCNotFound")
    );
}

#[tokio::test]
async fn waits_for_pod_within_grace_period() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.store.remove::<Pod>(Some(NS), "app");

    test.reconcile_binding(&name).await;
    assert_eq!(test.binding(&name).unwrap().status, None);

    backdate(&test, &name);
    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(reason(&binding, ConditionType::Unknown), Some("PodNotFound"));
}

#[tokio::test]
async fn unknown_bindings_are_left_alone() {
    let test = Harness::new();
    test.store.insert(unbound("stale", &test.config, hours_ago(2)));
    test.reconcile_binding("stale").await;
    assert_eq!(test.binding("stale").unwrap().phase(), Phase::Unknown);

    let writes = test.store.writes();
    test.reconcile_binding("stale").await;
    assert_eq!(test.store.writes(), writes);
    assert!(test.binding("stale").is_some());
}

#[tokio::test]
async fn running_pod_without_claim_is_unknown() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.store.remove::<PersistentVolumeClaim>(Some(NS), &name);

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(
        reason(&binding, ConditionType::Unknown),
        Some("PodFoundReadyButPVCNotFound")
    );
}

#[tokio::test]
async fn pending_pod_waits_for_claim() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Pending").await;
    test.store.remove::<PersistentVolumeClaim>(Some(NS), &name);

    test.reconcile_binding(&name).await;
    assert_eq!(test.binding(&name).unwrap().phase(), Phase::Pending);
}

#[tokio::test]
async fn completed_pod_keeps_binding_ready() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.reconcile_binding(&name).await;

    let pod = test.store.fetch::<Pod>(Some(NS), "app").unwrap();
    test.store.insert(super::with_phase(pod, "Succeeded"));
    test.reconcile_binding(&name).await;

    let binding = test.binding(&name).unwrap();
    assert_eq!(binding.phase(), Phase::Ready);
    assert_eq!(
        reason(&binding, ConditionType::Ready),
        Some("PodCompletedPVCFound")
    );
}

#[tokio::test]
async fn completed_pod_without_claim_is_unknown() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Failed").await;
    test.store.remove::<PersistentVolumeClaim>(Some(NS), &name);

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(
        reason(&binding, ConditionType::Unknown),
        Some("PodCompletedButPVCNotFound")
    );
}

#[tokio::test]
async fn replaced_pod_is_treated_as_missing() {
    let test = Harness::new();
    let (pod, name) = test.admit(pod("app"), "Running").await;
    test.reconcile_binding(&name).await;

    // A new incarnation under the same name.
    test.store.remove::<Pod>(Some(NS), "app");
    let mut replacement = pod.clone();
    replacement.metadata.uid = None;
    let replacement = test.store.insert(replacement);
    assert_ne!(replacement.uid(), pod.uid());

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(binding.phase(), Phase::OutOfUse);
    assert_eq!(reason(&binding, ConditionType::OutOfUse), Some("PodNotFound"));
}

#[tokio::test]
async fn reused_pod_name_is_treated_as_missing() {
    let test = Harness::new();
    // The first pod was provisioned but never created, then its name was
    // taken by a pod that got its own binding.
    let admission = Admission::new(test.store.clone(), admission_metrics());
    let first = admission
        .provision(NS, &pod("web-0"))
        .await
        .unwrap()
        .unwrap();
    let stale = first.labels()[keys::BINDING_NAME].clone();
    let (_, name) = test.admit(pod("web-0"), "Running").await;
    assert_ne!(stale, name);

    test.reconcile_binding(&stale).await;
    assert_eq!(test.binding(&stale).unwrap().phase(), Phase::Pending);
    assert!(!test.binding(&stale).unwrap().spec.pod.is_complete());

    backdate(&test, &stale);
    test.reconcile_binding(&stale).await;
    let binding = test.binding(&stale).unwrap();
    assert_eq!(binding.phase(), Phase::Unknown);
    assert_eq!(reason(&binding, ConditionType::Unknown), Some("PodNotFound"));

    test.reconcile_binding(&name).await;
    assert_eq!(test.binding(&name).unwrap().phase(), Phase::Ready);
}

#[tokio::test]
async fn deleted_pod_marks_binding_out_of_use() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.reconcile_binding(&name).await;

    let annotate = serde_json::json!({
        "metadata": { "annotations": { (keys::PVC_OUT_OF_USE): "true" } },
    });
    test.store
        .patch::<PersistentVolumeClaim>(Some(NS), &name, &annotate)
        .await
        .unwrap();
    test.store.remove::<Pod>(Some(NS), "app");

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(binding.phase(), Phase::OutOfUse);
    assert_eq!(reason(&binding, ConditionType::OutOfUse), Some("PodDeleted"));
}

#[tokio::test]
async fn resolves_generated_pods_by_label() {
    let test = Harness::new();
    let mut generated = pod("app");
    generated.metadata.name = None;
    generated.metadata.generate_name = Some("app-".to_string());
    let (patched, name) = test.admit(generated, "Running").await;
    assert_eq!(test.binding(&name).unwrap().spec.pod.name, "");

    // The pod is only persisted under its generated name.
    test.store.remove::<Pod>(Some(NS), &patched.name_any());
    let mut persisted = patched.clone();
    persisted.metadata.name = Some("app-x7k2p".to_string());
    persisted.metadata.uid = None;
    let persisted = test.store.insert(persisted);

    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(binding.spec.pod, ObjectIdentity::of(&persisted));
    assert_eq!(binding.phase(), Phase::Ready);
}

#[tokio::test]
async fn multiple_labeled_pods_are_ambiguous() {
    let test = Harness::new();
    let mut generated = pod("app");
    generated.metadata.name = None;
    generated.metadata.generate_name = Some("app-".to_string());
    let (patched, name) = test.admit(generated, "Running").await;
    test.store.remove::<Pod>(Some(NS), &patched.name_any());
    for suffix in ["a", "b"] {
        let mut pod = patched.clone();
        pod.metadata.name = Some(format!("app-{suffix}"));
        pod.metadata.uid = None;
        test.store.insert(pod);
    }

    let bindings = BindingReconciler::new(
        test.store.clone(),
        test.jobs.clone(),
        Duration::from_secs(3600),
    );
    let error = bindings.reconcile(NS, &name).await.unwrap_err();
    assert!(
        matches!(error, Error::AmbiguousPod { count: 2, .. }),
        "{error}"
    );
}

#[tokio::test]
async fn records_finalizer_job_outcomes() {
    let test = Harness::new();
    let (_, name) = test.admit(pod("app"), "Running").await;
    test.reconcile_binding(&name).await;
    test.store.remove::<Pod>(Some(NS), "app");
    test.reconcile_binding(&name).await;
    assert_eq!(test.binding(&name).unwrap().phase(), Phase::OutOfUse);

    // Out of use, but no job has been observed yet.
    let writes = test.store.writes();
    test.reconcile_binding(&name).await;
    assert_eq!(test.store.writes(), writes);

    let binding = test.binding(&name).unwrap();
    test.jobs.write().apply(job(&format!("{name}-a"), &binding));
    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert_eq!(binding.phase(), Phase::FinalizerJobApplied);

    // A failed job is recorded; a later success wins.
    test.jobs.write().apply(super::finished(
        job(&format!("{name}-a"), &binding),
        "Failed",
    ));
    test.jobs.write().apply(super::finished(
        job(&format!("{name}-b"), &binding),
        "Complete",
    ));
    test.reconcile_binding(&name).await;
    let binding = test.binding(&name).unwrap();
    assert!(binding.is_condition_true(ConditionType::FinalizerJobFailed));
    assert!(binding.is_condition_true(ConditionType::FinalizerJobSucceeded));
    assert_eq!(binding.phase(), Phase::FinalizerJobSucceeded);
}
