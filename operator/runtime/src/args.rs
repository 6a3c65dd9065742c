use crate::{
    admission::Admission,
    controller::{self, BindingRef, Context},
    index,
    k8s::{keys, FluentPvcBinding, Job, PersistentVolumeClaim, Pod, ResourceExt},
    metrics::{AdmissionMetrics, ReconcileMetrics},
    BindingReconciler, KubeStore, PodReconciler, Resync, VolumeReconciler,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::{
    api::Api,
    runtime::{reflector::ObjectRef, watcher, Controller},
};
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info_span, Instrument};

// Resync requests are dropped into the binding controller's queue, which
// coalesces them; the buffer only needs to cover a page of bindings.
const RESYNC_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Parser)]
#[clap(
    name = "fluent-pvc-operator",
    about = "Provisions a log volume and sidecar for annotated pods"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "fluent_pvc_operator=info,warn",
        env = "FLUENT_PVC_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// How often a claim waiting on its binding is checked again.
    #[clap(long, default_value = "10")]
    retry_delay_secs: u64,

    /// How long a binding may wait for its pod and claim to appear.
    #[clap(long, default_value = "3600")]
    binding_grace_period_secs: u64,

    #[clap(long, default_value = "5")]
    resync_interval_secs: u64,

    /// The number of bindings listed per request while resyncing.
    #[clap(long, default_value = "300")]
    resync_page_size: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            retry_delay_secs,
            binding_grace_period_secs,
            resync_interval_secs,
            resync_page_size,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        // Finalization jobs are looked up by their binding on every reconcile.
        let jobs = index::Index::shared();

        let mut prom = <Registry>::default();
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        index::metrics::register(prom.sub_registry_with_prefix("owned_jobs"), jobs.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let store = KubeStore::new(client.clone());

        // Spawn the job watch feeding the owned-job index.
        let job_events =
            runtime.watch_all::<Job>(watcher::Config::default().labels(keys::BINDING_NAME));
        tokio::spawn(
            kubert::index::namespaced(jobs.clone(), job_events).instrument(info_span!("jobs")),
        );

        // Spawn the periodic resync of every binding.
        let (resync_tx, resync_rx) = mpsc::channel::<BindingRef>(RESYNC_QUEUE_SIZE);
        let resync = Resync::new(
            store.clone(),
            resync_tx,
            Duration::from_secs(resync_interval_secs),
            resync_page_size,
        );
        tokio::spawn(
            resync
                .run(runtime.shutdown_handle())
                .instrument(info_span!("resync")),
        );

        // Spawn the controllers.

        let bindings = Controller::new(
            Api::<FluentPvcBinding>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Job>::all(client.clone()),
            watcher::Config::default().labels(keys::BINDING_NAME),
        )
        .reconcile_on(ReceiverStream::new(resync_rx));
        let reconciler = BindingReconciler::new(
            store.clone(),
            jobs.clone(),
            Duration::from_secs(binding_grace_period_secs),
        );
        tokio::spawn(
            controller::run(bindings, Context::new(reconciler, reconcile_metrics.clone()))
                .instrument(info_span!("bindings")),
        );

        // A claim shares its binding's name, so binding changes are routed to
        // the claim directly.
        let volumes = Controller::new(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default().labels(keys::FLUENT_PVC_NAME),
        )
        .watches(
            Api::<FluentPvcBinding>::all(client.clone()),
            watcher::Config::default(),
            |binding| {
                let ns = binding.namespace()?;
                Some(ObjectRef::new(&binding.name_any()).within(&ns))
            },
        );
        let reconciler = VolumeReconciler::new(
            store.clone(),
            jobs,
            Duration::from_secs(retry_delay_secs),
        );
        tokio::spawn(
            controller::run(volumes, Context::new(reconciler, reconcile_metrics.clone()))
                .instrument(info_span!("volumes")),
        );

        let pods = Controller::new(
            Api::<Pod>::all(client),
            watcher::Config::default().labels(keys::BINDING_NAME),
        );
        let reconciler = PodReconciler::new(store.clone());
        tokio::spawn(
            controller::run(pods, Context::new(reconciler, reconcile_metrics))
                .instrument(info_span!("pods")),
        );

        let admission = Admission::new(store, admission_metrics);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
