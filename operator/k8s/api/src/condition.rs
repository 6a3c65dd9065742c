//! Binding conditions and the phase derived from them.
//!
//! Conditions form a small map keyed by type that keeps insertion order. The
//! phase is never stored: it is always the type of the most recently
//! transitioned condition that holds, so it cannot drift from the conditions.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ConditionType {
    Ready,
    OutOfUse,
    FinalizerJobApplied,
    FinalizerJobSucceeded,
    FinalizerJobFailed,
    Unknown,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Phase {
    #[default]
    Pending,
    Ready,
    OutOfUse,
    FinalizerJobApplied,
    FinalizerJobSucceeded,
    FinalizerJobFailed,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    #[serde(with = "status")]
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Time,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

// === impl ConditionType ===

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::OutOfUse => "OutOfUse",
            Self::FinalizerJobApplied => "FinalizerJobApplied",
            Self::FinalizerJobSucceeded => "FinalizerJobSucceeded",
            Self::FinalizerJobFailed => "FinalizerJobFailed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ConditionType> for Phase {
    fn from(t: ConditionType) -> Self {
        match t {
            ConditionType::Ready => Self::Ready,
            ConditionType::OutOfUse => Self::OutOfUse,
            ConditionType::FinalizerJobApplied => Self::FinalizerJobApplied,
            ConditionType::FinalizerJobSucceeded => Self::FinalizerJobSucceeded,
            ConditionType::FinalizerJobFailed => Self::FinalizerJobFailed,
            ConditionType::Unknown => Self::Unknown,
        }
    }
}

// === impl Conditions ===

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(|c| c.status)
    }

    /// Sets a condition, returning true if anything observable changed.
    ///
    /// The transition time only moves when the status flips (or the condition
    /// is new); otherwise only the reason and message are refreshed.
    pub fn set(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: Time,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            None => {
                self.0.push(Condition {
                    type_,
                    status,
                    reason,
                    message,
                    last_transition_time: now,
                });
                true
            }
            Some(c) => {
                let mut changed = false;
                if c.status != status {
                    c.status = status;
                    c.last_transition_time = now;
                    changed = true;
                }
                if c.reason != reason {
                    c.reason = reason;
                    changed = true;
                }
                if c.message != message {
                    c.message = message;
                    changed = true;
                }
                changed
            }
        }
    }

    /// The type of the true condition with the latest transition time, or
    /// `Pending`. Conditions that transitioned at the same instant are ordered
    /// by insertion, the later one winning.
    pub fn phase(&self) -> Phase {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status)
            .max_by_key(|(i, c)| (c.last_transition_time.0, *i))
            .map(|(_, c)| c.type_.into())
            .unwrap_or_default()
    }
}

impl FromIterator<Condition> for Conditions {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

mod status {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *status { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match String::deserialize(d)?.as_str() {
            "True" => Ok(true),
            "False" | "Unknown" => Ok(false),
            other => Err(de::Error::unknown_variant(other, &["True", "False"])),
        }
    }
}
