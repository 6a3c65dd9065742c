use crate::condition::{ConditionType, Conditions, Phase};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Ties one mutated pod to its provisioned claim and finalization job.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "fluent-pvc-operator.tech.zozo.com",
    version = "v1alpha1",
    kind = "FluentPVCBinding",
    root = "FluentPvcBinding",
    namespaced,
    status = "FluentPvcBindingStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct FluentPvcBindingSpec {
    #[serde(rename = "fluentPVC")]
    pub fluent_pvc: ObjectIdentity,
    pub pvc: ObjectIdentity,
    pub pod: ObjectIdentity,
}

/// Names an object and pins the incarnation it refers to. Either field may be
/// empty while the object has not been observed yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(from = "StatusRepr", into = "StatusRepr")]
pub struct FluentPvcBindingStatus {
    conditions: Conditions,
}

/// The wire form of the status, which carries the derived phase for clients.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct StatusRepr {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
}

// === impl ObjectIdentity ===

impl ObjectIdentity {
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            name: obj.name_any(),
            uid: obj.uid().unwrap_or_default(),
        }
    }

    /// Returns false only if both identities record a uid and they differ.
    pub fn matches_uid<K: Resource>(&self, obj: &K) -> bool {
        match obj.meta().uid.as_deref() {
            Some(uid) if !self.uid.is_empty() => self.uid == uid,
            _ => true,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.uid.is_empty()
    }
}

// === impl FluentPvcBindingStatus ===

impl FluentPvcBindingStatus {
    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn phase(&self) -> Phase {
        self.conditions.phase()
    }

    pub fn set(
        &mut self,
        type_: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: Time,
    ) -> bool {
        self.conditions.set(type_, true, reason, message, now)
    }
}

impl From<StatusRepr> for FluentPvcBindingStatus {
    fn from(StatusRepr { conditions, .. }: StatusRepr) -> Self {
        Self { conditions }
    }
}

impl From<FluentPvcBindingStatus> for StatusRepr {
    fn from(status: FluentPvcBindingStatus) -> Self {
        let phase = Some(status.phase());
        Self {
            conditions: status.conditions,
            phase,
        }
    }
}

// === impl FluentPvcBinding ===

impl FluentPvcBinding {
    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(type_))
    }

    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase()).unwrap_or_default()
    }
}
