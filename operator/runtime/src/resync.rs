use crate::store::{self, Store};
use fluent_pvc_operator_k8s_api::FluentPvcBinding;
use kube::{api::ListParams, runtime::reflector::ObjectRef};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

/// Periodically enqueues every binding for reconciliation so that state the
/// watches missed (or that only changes with time, like grace windows) is
/// eventually acted on.
pub struct Resync<S> {
    store: S,
    tx: mpsc::Sender<ObjectRef<FluentPvcBinding>>,
    interval: Duration,
    page_size: u32,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),

    #[error("binding reconciler has stopped")]
    Closed,
}

impl<S: Store> Resync<S> {
    pub fn new(
        store: S,
        tx: mpsc::Sender<ObjectRef<FluentPvcBinding>>,
        interval: Duration,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            tx,
            interval,
            page_size,
        }
    }

    /// Ticks until shutdown is signaled or the reconciler stops listening.
    pub async fn run(self, drain: drain::Watch) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _release = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }
            }

            match self.fire().await {
                Ok(bindings) => trace!(bindings, "Enqueued bindings"),
                Err(Error::Closed) => {
                    debug!("Binding reconciler has stopped");
                    return;
                }
                // The next tick starts over from the first page.
                Err(error) => warn!(%error, "Failed to list bindings"),
            }
        }
    }

    /// Enqueues every binding once, paging through the list. Returns the
    /// number of bindings enqueued.
    pub async fn fire(&self) -> Result<usize, Error> {
        let mut count = 0;
        let mut params = ListParams::default().limit(self.page_size);
        loop {
            let page = self.store.list::<FluentPvcBinding>(None, &params).await?;
            for binding in &page.items {
                self.tx
                    .send(ObjectRef::from_obj(binding))
                    .await
                    .map_err(|_| Error::Closed)?;
                count += 1;
            }

            match page.continue_token {
                Some(token) => params = params.continue_token(&token),
                None => return Ok(count),
            }
        }
    }
}
