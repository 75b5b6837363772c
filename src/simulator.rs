use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ScheduleError, StoreError};
use crate::lifecycle::{LifecycleConfig, Plan};
use crate::scheduler::{
    enqueue_notification, scheduler_loop, Command, ScheduledTransition, SchedulerContext,
    TimedTransition,
};
use crate::storage::{InMemoryStore, ResourceStore, WebhookQueue};
use crate::telemetry::metric_inc_kind;
use crate::types::{QueueEntry, Resource, ResourceId};
use crate::worker::{worker_loop, ReqwestTransport, Transport, WorkerConfig, WorkerContext};

#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub lifecycle: LifecycleConfig,
    pub worker: WorkerConfig,
}

/// Drives created resources through their lifecycle and delivers the
/// resulting status callbacks.
///
/// Owns two background tasks: the lifecycle scheduler and the delivery
/// worker. Both stop on [`Simulator::shutdown`].
pub struct Simulator {
    store: Arc<dyn ResourceStore>,
    queue: Arc<dyn WebhookQueue>,
    config: SimulatorConfig,
    commands: Option<mpsc::UnboundedSender<Command>>,
    /// Resources with a lifecycle in progress; the scheduler drops finished ones.
    active: Arc<Mutex<HashSet<ResourceId>>>,
    is_running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    scheduler_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl Simulator {
    /// Simulator over a fresh in-memory store, delivering over HTTP.
    pub fn new(config: SimulatorConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_storage(config, store.clone(), store)
    }

    pub fn with_storage(
        config: SimulatorConfig,
        store: Arc<dyn ResourceStore>,
        queue: Arc<dyn WebhookQueue>,
    ) -> Self {
        Self::with_transport(config, store, queue, Arc::new(ReqwestTransport::default()))
    }

    /// Must be called from within a tokio runtime.
    pub fn with_transport(
        config: SimulatorConfig,
        store: Arc<dyn ResourceStore>,
        queue: Arc<dyn WebhookQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let shutdown_notify = Arc::new(Notify::new());

        let active = Arc::new(Mutex::new(HashSet::new()));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let scheduler_ctx = Arc::new(SchedulerContext {
            store: store.clone(),
            queue: queue.clone(),
            active: active.clone(),
        });
        let scheduler_handle = tokio::spawn(scheduler_loop(scheduler_ctx, command_rx));

        let worker_ctx = Arc::new(WorkerContext::new(
            queue.clone(),
            transport,
            config.worker.clone(),
        ));
        let worker_handle = tokio::spawn(worker_loop(
            worker_ctx,
            is_running.clone(),
            shutdown_notify.clone(),
        ));

        Self {
            store,
            queue,
            config,
            commands: Some(command_tx),
            active,
            is_running,
            shutdown_notify,
            scheduler_handle: Some(scheduler_handle),
            worker_handle: Some(worker_handle),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WebhookQueue> {
        &self.queue
    }

    /// Start the lifecycle of a freshly persisted resource.
    ///
    /// The first notification is enqueued before this returns, due
    /// immediately. Later transitions are handed to the scheduler. An empty
    /// `destination_url` means no callbacks; the status still evolves.
    /// A non-empty one is stored on the resource so [`Simulator::recover`]
    /// can find it. A failed enqueue is logged and never fails the call.
    ///
    /// Refused with `AlreadyScheduled` while the lifecycle is running, and
    /// once the stored status has moved past the initial one.
    pub async fn schedule_lifecycle(
        &self,
        resource: &Resource,
        destination_url: &str,
    ) -> Result<(), ScheduleError> {
        if !self.is_running() {
            return Err(ScheduleError::Shutdown);
        }
        let id = resource.id();
        if !self.active.lock().await.insert(id.clone()) {
            return Err(ScheduleError::AlreadyScheduled(id.clone()));
        }

        let plan = Plan::for_resource(resource, &self.config.lifecycle);
        let stored = match self.store.get_resource(id).await {
            Ok(stored) => stored,
            Err(err) => {
                self.active.lock().await.remove(id);
                return Err(err.into());
            }
        };
        if plan.initial().is_some_and(|t| t.status != stored.status()) {
            self.active.lock().await.remove(id);
            return Err(ScheduleError::AlreadyScheduled(id.clone()));
        }

        let destination = Some(destination_url).filter(|url| !url.is_empty());
        if let Some(destination) = destination {
            if stored.status_callback() != Some(destination) {
                if let Err(err) = self.store.set_status_callback(id, Some(destination)).await {
                    warn!(resource = %id, error = %err, "failed to store status callback");
                }
            }
        }

        if let (Some(destination), Some(initial)) = (destination, plan.initial()) {
            let queue = self.queue.as_ref();
            let enqueued = enqueue_notification(queue, &stored, initial.status, destination).await;
            if let Err(err) = enqueued {
                warn!(resource = %id, error = %err, "failed to enqueue initial status callback");
            }
        }

        let remaining = plan.transitions.get(1..).unwrap_or_default();
        let armed = TimedTransition::arm(id, stored.created_at(), remaining, destination);
        self.send(Command::Schedule(armed))?;
        metric_inc_kind("lifecycle.scheduled", stored.kind());
        debug!(
            resource = %id,
            account = %stored.account_id(),
            transitions = remaining.len(),
            "lifecycle scheduled"
        );
        Ok(())
    }

    /// Re-derive lifecycle work from persisted state, e.g. after a restart.
    ///
    /// For every resource that has not reached a terminal status, missing
    /// callbacks for statuses already reached are enqueued and the remaining
    /// transitions are re-armed relative to the creation time. Resources
    /// already scheduled by this simulator are skipped. Returns how many
    /// resources were resumed.
    pub async fn recover(&self) -> Result<usize, ScheduleError> {
        if !self.is_running() {
            return Err(ScheduleError::Shutdown);
        }

        let resources = self.store.in_flight_resources().await?;
        let mut resumed = 0;

        for resource in resources {
            if !self.active.lock().await.insert(resource.id().clone()) {
                continue;
            }

            let plan = Plan::for_resource(&resource, &self.config.lifecycle);
            let current = resource.status();
            let destination = resource.status_callback();

            if let Some(destination) = destination {
                for reached in plan.reached(current) {
                    let queue = self.queue.as_ref();
                    let status = reached.status;
                    let enqueued =
                        enqueue_notification(queue, &resource, status, destination).await;
                    if let Err(err) = enqueued {
                        warn!(
                            resource = %resource.id(),
                            status = %status,
                            error = %err,
                            "failed to enqueue recovered status callback"
                        );
                    }
                }
            }

            let armed = TimedTransition::arm(
                resource.id(),
                resource.created_at(),
                plan.after_status(current),
                destination,
            );
            self.send(Command::Schedule(armed))?;
            resumed += 1;
        }

        info!(resumed, "lifecycle recovery complete");
        Ok(resumed)
    }

    /// Drop the pending transitions of a resource.
    pub fn cancel_lifecycle(&self, resource_id: &ResourceId) -> Result<(), ScheduleError> {
        self.send(Command::Cancel(resource_id.clone()))
    }

    /// Transitions still waiting to fire, soonest first.
    pub async fn pending_transitions(&self) -> Vec<ScheduledTransition> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.send(Command::Snapshot(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Number of resources whose lifecycle is still running.
    pub async fn active_lifecycles(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Callbacks that were given up on, most recent first.
    pub async fn abandoned_webhooks(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        self.queue.abandoned(limit).await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop both background tasks. Pending timers are discarded; their
    /// work can be resumed later with [`Simulator::recover`].
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.commands.take();
        self.shutdown_notify.notify_waiters();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), ScheduleError> {
        let sender = self.commands.as_ref().ok_or(ScheduleError::Shutdown)?;
        sender.send(command).map_err(|_| ScheduleError::Shutdown)
    }
}
