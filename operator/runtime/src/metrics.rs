use crate::Error;
use kube::runtime::controller::Action;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<ResultLabels, Counter>,
    durations: Family<ControllerLabels, Histogram>,
}

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    reviews: Family<ReviewLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ControllerLabels {
    controller: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    controller: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReviewLabels {
    operation: &'static str,
    result: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ResultLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of reconciles by controller and result",
            reconciles.clone(),
        );

        let durations = Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
        });
        reg.register_with_unit(
            "duration",
            "Histogram of reconcile durations by controller",
            Unit::Seconds,
            durations.clone(),
        );

        Self {
            reconciles,
            durations,
        }
    }

    pub(crate) fn observe(
        &self,
        controller: &'static str,
        result: &Result<Action, Error>,
        start: time::Instant,
    ) {
        let result = match result {
            Ok(_) => "ok",
            Err(error) if error.is_conflict() => "conflict",
            Err(_) => "error",
        };
        self.reconciles
            .get_or_create(&ResultLabels { controller, result })
            .inc();
        self.durations
            .get_or_create(&ControllerLabels { controller })
            .observe(start.elapsed().as_secs_f64());
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::<ReviewLabels, Counter>::default();
        reg.register(
            "reviews",
            "Total number of admission reviews by operation and outcome",
            reviews.clone(),
        );
        Self { reviews }
    }

    pub(crate) fn review(&self, operation: &'static str, allowed: bool) {
        let result = if allowed { "allowed" } else { "denied" };
        self.reviews
            .get_or_create(&ReviewLabels { operation, result })
            .inc();
    }
}
