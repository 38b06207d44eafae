//! The dispatcher: polls the container queue and owns the runners.

use crate::api::{Container, ContainerState, ControlPlane, Filter};
use crate::error::{Error, Result};
use crate::throttle::Throttle;
use crate::tracker::RunTracker;
use cairn_core::config::DispatchConfig;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs one container's lifecycle: execute it (when the record arrives
/// Locked) or resume monitoring one that is already running, and return
/// only when the container is finished.
///
/// While the container runs, the runner listens for updated records on the
/// provided mailbox; when the mailbox closes it stops the container and
/// returns.
pub type RunnerFn = Arc<
    dyn Fn(Dispatcher, Container, watch::Receiver<Container>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Batch size for looking up tracked containers the standing queries
/// missed.
const MISSING_BATCH: usize = 20;

/// Watches the control plane's queue for containers that are ready to run
/// and available to lock, or already locked by this dispatcher, and keeps
/// exactly one runner per container.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn ControlPlane>,
    poll_period: Duration,
    throttle: Throttle,
    runner: RunnerFn,
    auth_uuid: OnceCell<String>,
    trackers: Mutex<HashMap<String, RunTracker>>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ControlPlane>, config: &DispatchConfig, runner: RunnerFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                poll_period: config.poll_period(),
                throttle: Throttle::new(config.min_retry_period()),
                runner,
                auth_uuid: OnceCell::new(),
                trackers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This dispatcher's authorization UUID, fetched from the control
    /// plane on first use.
    async fn auth_uuid(&self) -> Result<&str> {
        self.inner
            .auth_uuid
            .get_or_try_init(|| async {
                let auth = self.inner.client.current_authorization().await?;
                Ok::<_, Error>(auth.uuid)
            })
            .await
            .map(String::as_str)
    }

    /// Poll until `ctx` cancels.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        self.auth_uuid().await?;
        let mut poll = tokio::time::interval_at(
            tokio::time::Instant::now() + self.inner.poll_period,
            self.inner.poll_period,
        );
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = poll.tick() => {}
            }
            self.poll_once().await;
        }
    }

    /// One reconciliation pass over the queue.
    pub async fn poll_once(&self) {
        let auth = match self.auth_uuid().await {
            Ok(auth) => auth.to_string(),
            Err(err) => {
                warn!(%err, "cannot determine own authorization");
                return;
            }
        };

        // Everything tracked right now; UUIDs still here after the queries
        // were not seen by any of them.
        let mut todo: HashSet<String> = {
            let trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
            trackers.keys().cloned().collect()
        };

        // Containers this dispatcher currently owns.
        let own = self
            .check_for_updates(&[Filter::eq("locked_by_uuid", auth.as_str())], &mut todo)
            .await;
        // Containers worth trying to dispatch.
        let queued = self
            .check_for_updates(
                &[Filter::eq("state", "Queued"), Filter::gt("priority", 0)],
                &mut todo,
            )
            .await;
        if !(own && queued) {
            // A query failed, so the view of the queue is incomplete.
            // Checking the leftovers individually could be expensive;
            // keep all trackers and try again next tick.
            return;
        }

        // Tracked containers the standing queries missed (probably
        // Complete or Cancelled), in bounded batches.
        let mut missed: Vec<String> = todo.iter().cloned().collect();
        missed.sort();
        let mut batches_ok = true;
        for batch in missed.chunks(MISSING_BATCH) {
            batches_ok = self
                .check_for_updates(&[Filter::within("uuid", batch.to_vec())], &mut todo)
                .await
                && batches_ok;
        }
        if !batches_ok {
            return;
        }

        // Unseen by every query: the records are gone; let the runners go.
        let mut trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
        for uuid in todo {
            info!(container = %uuid, "not returned by any query; stopping tracking");
            if let Some(tracker) = trackers.get_mut(&uuid) {
                tracker.close();
            }
        }
    }

    /// Run one filtered query to completion (all pages) and reconcile every
    /// returned container. Returns false if the query failed.
    async fn check_for_updates(&self, filters: &[Filter], todo: &mut HashSet<String>) -> bool {
        let mut offset = 0;
        loop {
            let page = match self.inner.client.list_containers(filters, offset).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "container query failed");
                    return false;
                }
            };
            let fetched = page.items.len();
            let more = fetched > 0 && page.items_available > offset + fetched;
            self.reconcile(page.items, todo).await;
            if !more {
                return true;
            }
            offset += fetched;
        }
    }

    async fn reconcile(&self, containers: Vec<Container>, todo: &mut HashSet<String>) {
        let auth = self.inner.auth_uuid.get().cloned().unwrap_or_default();
        for mut container in containers {
            todo.remove(&container.uuid);

            if let Some(owner) = &container.locked_by_uuid {
                if *owner != auth {
                    debug!(container = %container.uuid, locked_by = %owner,
                        "locked by another dispatcher; ignoring");
                    continue;
                }
            }

            let already_tracked = {
                let mut trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
                match trackers.get_mut(&container.uuid) {
                    Some(tracker) => {
                        match container.state {
                            ContainerState::Locked | ContainerState::Running => {
                                tracker.update(container.clone());
                            }
                            ContainerState::Queued
                            | ContainerState::Complete
                            | ContainerState::Cancelled => tracker.close(),
                        }
                        true
                    }
                    None => false,
                }
            };
            if already_tracked {
                continue;
            }

            match container.state {
                ContainerState::Queued => {
                    if !self.inner.throttle.check(&container.uuid) {
                        continue;
                    }
                    if let Err(err) = self.inner.client.lock(&container.uuid).await {
                        debug!(container = %container.uuid, %err, "lock refused");
                        continue;
                    }
                    container.state = ContainerState::Locked;
                    self.start(container);
                }
                ContainerState::Locked | ContainerState::Running => {
                    if !self.inner.throttle.check(&container.uuid) {
                        continue;
                    }
                    self.start(container);
                }
                // Already stopped monitoring.
                ContainerState::Complete | ContainerState::Cancelled => {}
            }
        }
    }

    /// Attach a tracker and spawn the runner with the container's current
    /// record. A second start for the same UUID is a no-op.
    fn start(&self, container: Container) {
        let uuid = container.uuid.clone();
        let (tracker, updates) = RunTracker::new(container.clone());
        {
            let mut trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
            if trackers.contains_key(&uuid) {
                return;
            }
            trackers.insert(uuid.clone(), tracker);
        }

        let dispatcher = self.clone();
        let runner = (self.inner.runner)(dispatcher.clone(), container, updates);
        tokio::spawn(async move {
            runner.await;
            // The runner owns the container's whole lifetime; when it
            // returns, the tracker goes with it.
            let mut trackers = dispatcher
                .inner
                .trackers
                .lock()
                .expect("trackers mutex poisoned");
            trackers.remove(&uuid);
        });
    }

    /// Ensure a tracker is running for `uuid`, whatever state the container
    /// is in, unless another dispatcher holds its lock. For containers in a
    /// state no runner would normally be started for, the tracker closes
    /// immediately: the runner gets exactly one shot at cleaning up local
    /// side effects left by an earlier dispatcher process, without any risk
    /// of two runners watching the same container.
    pub async fn track_container(&self, uuid: &str) -> Result<()> {
        let container = self.inner.client.get_container(uuid).await?;
        let auth = self.auth_uuid().await?;
        if let Some(owner) = &container.locked_by_uuid {
            if owner != auth {
                return Ok(());
            }
        }
        {
            let trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
            if trackers.contains_key(uuid) {
                return Ok(());
            }
        }

        let close_now = matches!(
            container.state,
            ContainerState::Queued | ContainerState::Complete | ContainerState::Cancelled
        );
        self.start(container);
        if close_now {
            let mut trackers = self.inner.trackers.lock().expect("trackers mutex poisoned");
            if let Some(tracker) = trackers.get_mut(uuid) {
                tracker.close();
            }
        }
        Ok(())
    }

    /// Change a container's state at the control plane.
    pub async fn update_state(&self, uuid: &str, state: ContainerState) -> Result<()> {
        if let Err(err) = self.inner.client.update_state(uuid, state).await {
            warn!(container = %uuid, %state, %err, "state update failed");
            return Err(err);
        }
        Ok(())
    }

    /// Release this dispatcher's claim, returning the container to the
    /// queue.
    pub async fn unlock(&self, uuid: &str) -> Result<()> {
        self.inner.client.unlock(uuid).await
    }

    /// Number of containers currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.trackers.lock().expect("trackers mutex poisoned").len()
    }
}
