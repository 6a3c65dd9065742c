//! Well-known annotation, label and finalizer keys.

use kube::api::ObjectMeta;

/// Selects a pod for volume provisioning. The value names a `FluentPVC`.
///
/// Also set as a label on provisioned claims so that only those are watched.
pub const FLUENT_PVC_NAME: &str = "fluent-pvc-operator.tech.zozo.com/fluent-pvc-name";

/// Labels mutated pods and finalization jobs with the name of their binding.
pub const BINDING_NAME: &str = "fluent-pvc-operator.tech.zozo.com/fluent-pvc-binding-name";

/// Protects a provisioned claim from deletion until it has been finalized.
pub const PVC_FINALIZER: &str = "fluent-pvc-operator.tech.zozo.com/pvc-protection";

/// Written on a claim when the pod that mounted it is deleted.
pub const PVC_OUT_OF_USE: &str = "fluent-pvc-operator.tech.zozo.com/out-of-use";

/// Returns the `FluentPVC` named by the object's selecting annotation.
pub fn fluent_pvc_name(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations.as_ref()?.get(FLUENT_PVC_NAME).map(String::as_str)
}

/// Returns true if the claim was marked out-of-use when its pod was deleted.
pub fn is_marked_out_of_use(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(PVC_OUT_OF_USE))
        .is_some_and(|v| v == "true")
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|fs| fs.iter().any(|f| f == finalizer))
}

/// Removes the finalizer, returning true if it was present.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}
