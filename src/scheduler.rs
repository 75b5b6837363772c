use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lifecycle::{StatusCallback, Transition};
use crate::storage::{ResourceStore, WebhookQueue};
use crate::telemetry::{metric_inc, metric_inc_kind};
use crate::types::{NewQueueEntry, QueueEntry, Resource, ResourceId, ResourceStatus};

/// A lifecycle continuation waiting in the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduledTransition {
    pub resource_id: ResourceId,
    pub status: ResourceStatus,
    /// Time left until it fires; zero if overdue.
    pub due_in: Duration,
}

pub(crate) enum Command {
    Schedule(Vec<TimedTransition>),
    Cancel(ResourceId),
    Snapshot(oneshot::Sender<Vec<ScheduledTransition>>),
}

#[derive(Debug)]
pub(crate) struct TimedTransition {
    ready_at: Instant,
    seq: u64,
    resource_id: ResourceId,
    transition: Transition,
    destination: Option<String>,
}

impl TimedTransition {
    /// Arm `transitions` relative to the resource's creation time.
    pub(crate) fn arm(
        resource_id: &ResourceId,
        created_at: DateTime<Utc>,
        transitions: &[Transition],
        destination: Option<&str>,
    ) -> Vec<Self> {
        let elapsed = (Utc::now() - created_at).to_std().unwrap_or(Duration::ZERO);
        let now = Instant::now();
        transitions
            .iter()
            .map(|t| TimedTransition {
                ready_at: now + t.after.saturating_sub(elapsed),
                seq: 0,
                resource_id: resource_id.clone(),
                transition: t.clone(),
                destination: destination.map(str::to_string),
            })
            .collect()
    }
}

impl Eq for TimedTransition {}

impl PartialEq for TimedTransition {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Ord for TimedTransition {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior; equal deadlines fire in arrival order.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedTransition {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct SchedulerContext {
    pub store: Arc<dyn ResourceStore>,
    pub queue: Arc<dyn WebhookQueue>,
    /// Resources with a running lifecycle; entries leave once it ends.
    pub active: Arc<Mutex<HashSet<ResourceId>>>,
}

enum Step {
    Continue,
    /// The resource no longer accepts transitions; drop the rest of its lifecycle.
    Gone,
}

/// Timer loop running lifecycle continuations in deadline order.
///
/// Continuations execute one at a time inside this task, so transitions of
/// the same resource can never overtake each other. The loop exits once
/// every command sender is dropped; armed timers are discarded and can be
/// re-derived from persisted state with `Simulator::recover`.
pub(crate) async fn scheduler_loop(
    ctx: Arc<SchedulerContext>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut heap: BinaryHeap<TimedTransition> = BinaryHeap::new();
    let mut next_seq = 0u64;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|t| t.ready_at <= now) {
            let Some(due) = heap.pop() else { break };
            if let Step::Gone = run_transition(&ctx, &due).await {
                heap.retain(|t| t.resource_id != due.resource_id);
                ctx.active.lock().await.remove(&due.resource_id);
            }
        }

        let deadline = heap
            .peek()
            .map(|t| t.ready_at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule(transitions)) => {
                    for mut t in transitions {
                        next_seq += 1;
                        t.seq = next_seq;
                        heap.push(t);
                    }
                }
                Some(Command::Cancel(resource_id)) => {
                    let before = heap.len();
                    heap.retain(|t| t.resource_id != resource_id);
                    ctx.active.lock().await.remove(&resource_id);
                    let dropped = before - heap.len();
                    debug!(resource = %resource_id, dropped, "lifecycle cancelled");
                }
                Some(Command::Snapshot(reply)) => {
                    let now = Instant::now();
                    let mut pending: Vec<&TimedTransition> = heap.iter().collect();
                    pending.sort_by(|a, b| b.cmp(a));
                    let snapshot = pending
                        .into_iter()
                        .map(|t| ScheduledTransition {
                            resource_id: t.resource_id.clone(),
                            status: t.transition.status,
                            due_in: t.ready_at.saturating_duration_since(now),
                        })
                        .collect();
                    let _ = reply.send(snapshot);
                }
                None => {
                    info!(dropped = heap.len(), "lifecycle scheduler stopped");
                    return;
                }
            },
            _ = sleep_until(deadline) => {}
        }
    }
}

/// Advance the stored status, then enqueue the notification for it.
///
/// A failed enqueue is logged and does not undo the status update.
async fn run_transition(ctx: &SchedulerContext, due: &TimedTransition) -> Step {
    let status = due.transition.status;
    let resource = match ctx
        .store
        .update_status(&due.resource_id, status, due.transition.duration_secs)
        .await
    {
        Ok(resource) => resource,
        Err(err @ (StoreError::NotFound(_) | StoreError::KindMismatch { .. })) => {
            warn!(
                resource = %due.resource_id,
                status = %status,
                error = %err,
                "dropping lifecycle of missing resource"
            );
            return Step::Gone;
        }
        Err(err) => {
            warn!(
                resource = %due.resource_id,
                status = %status,
                error = %err,
                "failed to advance resource status"
            );
            match ctx.store.get_resource(&due.resource_id).await {
                Ok(resource) => resource,
                Err(_) => return Step::Continue,
            }
        }
    };

    metric_inc_kind("lifecycle.transition", resource.kind());
    debug!(resource = %due.resource_id, status = %status, "resource advanced");

    if let Some(destination) = due.destination.as_deref() {
        let queue = ctx.queue.as_ref();
        let enqueued = enqueue_notification(queue, &resource, status, destination).await;
        if let Err(err) = enqueued {
            metric_inc("lifecycle.enqueue.failed");
            warn!(
                resource = %due.resource_id,
                status = %status,
                error = %err,
                "failed to enqueue status callback"
            );
        }
    }

    if status.is_terminal() {
        Step::Gone
    } else {
        Step::Continue
    }
}

/// Queue the callback for `resource` having reached `status`, unless one is
/// already queued. Returns the new entry, if any.
pub(crate) async fn enqueue_notification(
    queue: &dyn WebhookQueue,
    resource: &Resource,
    status: ResourceStatus,
    destination: &str,
) -> Result<Option<QueueEntry>, StoreError> {
    if queue.has_entry(resource.id(), status).await? {
        return Ok(None);
    }

    let now = Utc::now();
    let payload = StatusCallback::new(resource, status, now)
        .to_json()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let entry = queue
        .enqueue(NewQueueEntry {
            resource_id: resource.id().clone(),
            resource_status: status,
            destination_url: destination.to_string(),
            payload,
            scheduled_at: now,
        })
        .await?;
    metric_inc("webhook.enqueued");
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageStatus;

    fn timed(ms: u64, seq: u64) -> TimedTransition {
        TimedTransition {
            ready_at: Instant::now() + Duration::from_millis(ms),
            seq,
            resource_id: ResourceId("SM1".into()),
            transition: Transition {
                status: MessageStatus::Sent.into(),
                after: Duration::from_millis(ms),
                duration_secs: None,
            },
            destination: None,
        }
    }

    #[tokio::test]
    async fn heap_pops_earliest_deadline_first() {
        let mut heap = BinaryHeap::new();
        heap.push(timed(500, 1));
        heap.push(timed(100, 2));
        heap.push(timed(300, 3));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn overdue_transitions_are_armed_immediately() {
        let created = Utc::now() - chrono::Duration::seconds(10);
        let transitions = [Transition {
            status: MessageStatus::Delivered.into(),
            after: Duration::from_millis(500),
            duration_secs: None,
        }];
        let id = ResourceId("SM1".into());
        let armed = TimedTransition::arm(&id, created, &transitions, Some("http://example.com"));
        assert_eq!(armed.len(), 1);
        assert!(armed[0].ready_at <= Instant::now());
        assert_eq!(armed[0].destination.as_deref(), Some("http://example.com"));
    }
}
