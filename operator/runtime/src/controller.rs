//! Runs reconcilers on `kube::runtime::Controller` work queues.
//!
//! The controller guarantees one in-flight reconcile per object and coalesces
//! repeated triggers for the same object. Failed reconciles are retried with a
//! per-object exponential backoff; conflicts are retried quickly.

use crate::{
    metrics::ReconcileMetrics, BindingReconciler, Error, PodReconciler, Result, Store,
    VolumeReconciler,
};
use ahash::AHashMap as HashMap;
use fluent_pvc_operator_k8s_api::{FluentPvcBinding, PersistentVolumeClaim, Pod, ResourceExt};
use futures::prelude::*;
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
    },
    Resource,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::time::{self, Duration};
use tracing::{debug, info_span, trace, warn, Instrument};

const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// A reconciler driven by a controller watching `Resource`s.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Resource: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Names the controller in logs and metrics.
    const NAME: &'static str;

    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action>;
}

/// Shared state handed to every reconcile.
pub(crate) struct Context<R> {
    reconciler: R,
    metrics: ReconcileMetrics,
    backoff: Backoff,
}

/// Counts consecutive failures per object.
#[derive(Debug, Default)]
struct Backoff(Mutex<HashMap<String, u32>>);

// === impl Context ===

impl<R: Reconcile> Context<R> {
    pub(crate) fn new(reconciler: R, metrics: ReconcileMetrics) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            metrics,
            backoff: Backoff::default(),
        })
    }

    fn report<Q>(
        &self,
        res: Result<(ObjectRef<R::Resource>, Action), controller::Error<Error, Q>>,
    ) where
        Q: std::error::Error + 'static,
    {
        match res {
            Ok((obj, _)) => trace!(%obj, "Reconciled"),
            Err(controller::Error::ObjectNotFound(obj)) => {
                trace!(%obj, "Object was deleted before it was reconciled");
                // No reconcile will succeed for it now.
                let namespace = obj.namespace.as_deref().unwrap_or_default();
                self.backoff.reset(&key(namespace, &obj.name));
            }
            // Reported by the error policy.
            Err(controller::Error::ReconcilerFailed(..)) => {}
            Err(error) => warn!(%error, "Controller failed"),
        }
    }
}

/// Runs the controller until it is shut down by a signal.
pub(crate) async fn run<R: Reconcile>(
    controller: Controller<R::Resource>,
    ctx: Arc<Context<R>>,
) {
    controller
        .shutdown_on_signal()
        .run(reconcile::<R>, error_policy::<R>, ctx.clone())
        .for_each(|res| {
            ctx.report(res);
            futures::future::ready(())
        })
        .await
}

async fn reconcile<R: Reconcile>(
    obj: Arc<R::Resource>,
    ctx: Arc<Context<R>>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let start = time::Instant::now();
    let res = ctx
        .reconciler
        .reconcile(&namespace, &name)
        .instrument(info_span!("reconcile", controller = R::NAME, %namespace, %name))
        .await;
    ctx.metrics.observe(R::NAME, &res, start);
    if res.is_ok() {
        ctx.backoff.reset(&key(&namespace, &name));
    }
    res
}

fn error_policy<R: Reconcile>(
    obj: Arc<R::Resource>,
    error: &Error,
    ctx: Arc<Context<R>>,
) -> Action {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if error.is_conflict() {
        debug!(controller = R::NAME, %namespace, %name, %error, "Conflict; retrying");
        return Action::requeue(CONFLICT_BACKOFF);
    }
    let delay = ctx.backoff.next(&key(&namespace, &name));
    warn!(controller = R::NAME, %namespace, %name, %error, ?delay, "Reconcile failed");
    Action::requeue(delay)
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// === impl Backoff ===

impl Backoff {
    fn next(&self, key: &str) -> Duration {
        let mut failures = self.0.lock();
        let n = failures.entry(key.to_string()).or_default();
        let delay = MIN_BACKOFF
            .saturating_mul(2u32.saturating_pow(*n))
            .min(MAX_BACKOFF);
        *n = n.saturating_add(1);
        delay
    }

    fn reset(&self, key: &str) {
        self.0.lock().remove(key);
    }
}

// === impl Reconcile ===

#[async_trait::async_trait]
impl<S: Store> Reconcile for BindingReconciler<S> {
    type Resource = FluentPvcBinding;
    const NAME: &'static str = "binding";

    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        BindingReconciler::reconcile(self, namespace, name).await
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for VolumeReconciler<S> {
    type Resource = PersistentVolumeClaim;
    const NAME: &'static str = "volume";

    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        VolumeReconciler::reconcile(self, namespace, name).await
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for PodReconciler<S> {
    type Resource = Pod;
    const NAME: &'static str = "pod";

    async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        PodReconciler::reconcile(self, namespace, name).await
    }
}

/// Resync requests for bindings, as accepted by `Controller::reconcile_on`.
pub(crate) type BindingRef = ObjectRef<FluentPvcBinding>;
