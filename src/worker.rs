use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{DeliveryOutcome, FailureReason};
use crate::signing::CallbackSigner;
use crate::storage::WebhookQueue;
use crate::telemetry::metric_inc;
use crate::types::{QueueEntry, QueueEntryId, QueueStatus};
use crate::validation::validate_destination;

/// Delivery worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between queue polls.
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll.
    pub batch_size: usize,
    /// Maximum deliveries running at once.
    pub max_in_flight: usize,
    /// Upper bound for one HTTP attempt.
    pub delivery_timeout: Duration,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    /// Bound on the DNS lookup of callback hosts; `None` skips resolution.
    pub resolve_timeout: Option<Duration>,
    pub user_agent: String,
    pub signer: Option<CallbackSigner>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            batch_size: 100,
            max_in_flight: 32,
            delivery_timeout: Duration::from_secs(5),
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            retry_jitter_ms: 50,
            resolve_timeout: Some(Duration::from_secs(2)),
            user_agent: concat!("lifecycle-dispatcher/", env!("CARGO_PKG_VERSION")).to_string(),
            signer: None,
        }
    }
}

/// A single outgoing callback.
#[derive(Debug, Clone)]
pub struct CallbackRequest<'a> {
    pub url: &'a str,
    pub body: &'a [u8],
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// HTTP seam used by the worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST the callback. `Ok` means the destination answered 2xx.
    async fn post(&self, request: CallbackRequest<'_>) -> Result<(), FailureReason>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, request: CallbackRequest<'_>) -> Result<(), FailureReason> {
        let mut builder = self
            .client
            .post(request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.to_vec());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(FailureReason::RemoteStatus(resp.status().as_u16())),
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(_) => Err(FailureReason::Network),
        }
    }
}

/// Shared state of the worker loop and its delivery tasks.
pub(crate) struct WorkerContext {
    pub queue: Arc<dyn WebhookQueue>,
    pub transport: Arc<dyn Transport>,
    pub config: WorkerConfig,
    /// Bounds concurrent deliveries.
    pub permits: Arc<Semaphore>,
    /// Entries with a delivery task running; skipped by later polls.
    pub in_flight: Mutex<HashSet<QueueEntryId>>,
}

impl WorkerContext {
    pub fn new(
        queue: Arc<dyn WebhookQueue>,
        transport: Arc<dyn Transport>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            in_flight: Mutex::new(HashSet::new()),
            config,
        }
    }
}

/// Main worker loop.
///
/// Each pass:
/// - Fetches a bounded batch of due entries
/// - Spawns one delivery task per entry, bounded by the in-flight limit
/// - Never waits for deliveries before the next pass
pub(crate) async fn worker_loop(
    ctx: Arc<WorkerContext>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    info!(
        poll_interval_ms = ctx.config.poll_interval.as_millis() as u64,
        batch_size = ctx.config.batch_size,
        "delivery worker started"
    );

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = sleep(ctx.config.poll_interval) => {}
            _ = shutdown.notified() => {}
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        poll_once(&ctx).await;
    }

    info!("delivery worker stopped");
}

/// Fetch due entries and dispatch them. Returns how many were dispatched.
pub(crate) async fn poll_once(ctx: &Arc<WorkerContext>) -> usize {
    let due = match ctx.queue.fetch_due(Utc::now(), ctx.config.batch_size).await {
        Ok(due) => due,
        Err(err) => {
            warn!(error = %err, "failed to fetch due webhooks");
            return 0;
        }
    };

    let mut dispatched = 0;
    for entry in due {
        {
            let mut in_flight = ctx.in_flight.lock().await;
            if in_flight.contains(&entry.id) {
                continue;
            }
            // Permits are released when the delivery task finishes.
            let Ok(permit) = ctx.permits.clone().try_acquire_owned() else {
                debug!("delivery concurrency limit reached, deferring rest of batch");
                break;
            };
            in_flight.insert(entry.id);

            let task_ctx = ctx.clone();
            tokio::spawn(async move {
                let id = entry.id;
                if let Some(entry) = still_due(&task_ctx, id).await {
                    deliver_entry(&task_ctx, entry).await;
                }
                task_ctx.in_flight.lock().await.remove(&id);
                drop(permit);
            });
        }
        dispatched += 1;
    }
    dispatched
}

/// Re-read an entry picked from a poll snapshot.
///
/// The snapshot may predate a delivery that finished in the meantime, so
/// only entries that are still pending and due are handed on.
async fn still_due(ctx: &WorkerContext, id: QueueEntryId) -> Option<QueueEntry> {
    match ctx.queue.get_entry(id).await {
        Ok(entry)
            if entry.status == QueueStatus::Pending
                && entry.scheduled_at <= Utc::now()
                && entry.attempts < ctx.queue.max_attempts() =>
        {
            Some(entry)
        }
        Ok(entry) => {
            debug!(entry = %id, status = ?entry.status, "skipping webhook no longer due");
            None
        }
        Err(err) => {
            warn!(entry = %id, error = %err, "failed to reload webhook before delivery");
            None
        }
    }
}

/// Validate, deliver and record the outcome of one queue entry.
pub(crate) async fn deliver_entry(ctx: &WorkerContext, entry: QueueEntry) -> DeliveryOutcome {
    let outcome = attempt(ctx, &entry).await;

    match &outcome {
        DeliveryOutcome::Delivered => {
            metric_inc("webhook.delivery.success");
            debug!(
                entry = %entry.id,
                resource = %entry.resource_id,
                status = %entry.resource_status,
                "webhook delivered"
            );
            if let Err(err) = ctx.queue.mark_delivered(entry.id).await {
                warn!(entry = %entry.id, error = %err, "failed to mark webhook delivered");
            }
        }
        DeliveryOutcome::Rejected(reason) => {
            metric_inc("webhook.delivery.rejected");
            warn!(
                entry = %entry.id,
                resource = %entry.resource_id,
                url = %entry.destination_url,
                reason = %reason,
                "webhook destination rejected"
            );
            if let Err(err) = ctx.queue.mark_rejected(entry.id).await {
                warn!(entry = %entry.id, error = %err, "failed to mark webhook rejected");
            }
        }
        DeliveryOutcome::Failed(reason) => {
            metric_inc("webhook.delivery.failure");
            let delay = retry_delay_for_attempt(entry.attempts + 1, &ctx.config)
                + jitter_delay(ctx.config.retry_jitter_ms);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            match ctx.queue.mark_failed(entry.id, retry_at).await {
                Ok(updated) if updated.status == QueueStatus::Failed => {
                    metric_inc("webhook.delivery.abandoned");
                    warn!(
                        entry = %entry.id,
                        resource = %entry.resource_id,
                        url = %entry.destination_url,
                        attempts = updated.attempts,
                        reason = %reason,
                        "webhook abandoned after final attempt"
                    );
                }
                Ok(updated) => {
                    debug!(
                        entry = %entry.id,
                        attempts = updated.attempts,
                        reason = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "webhook delivery failed, will retry"
                    );
                }
                Err(err) => {
                    warn!(entry = %entry.id, error = %err, "failed to record webhook failure");
                }
            }
        }
    }

    outcome
}

async fn attempt(ctx: &WorkerContext, entry: &QueueEntry) -> DeliveryOutcome {
    if entry.destination_url.is_empty() {
        return DeliveryOutcome::Rejected(crate::error::ValidationError::MissingHost);
    }
    let verdict = validate_destination(&entry.destination_url, ctx.config.resolve_timeout).await;
    if let Err(reason) = verdict {
        return DeliveryOutcome::Rejected(reason);
    }

    let body = entry.payload.as_bytes();
    let mut headers = vec![
        ("User-Agent".to_string(), ctx.config.user_agent.clone()),
        ("X-Callback-Attempt".to_string(), (entry.attempts + 1).to_string()),
    ];
    if let Some(signer) = &ctx.config.signer {
        headers.extend(signer.headers(body));
    }

    let request = CallbackRequest {
        url: &entry.destination_url,
        body,
        headers,
        timeout: ctx.config.delivery_timeout,
    };

    // The transport applies its own timeout; this guards transports that don't.
    let guard = ctx.config.delivery_timeout + Duration::from_millis(100);
    match tokio::time::timeout(guard, ctx.transport.post(request)).await {
        Ok(Ok(())) => DeliveryOutcome::Delivered,
        Ok(Err(reason)) => DeliveryOutcome::Failed(reason),
        Err(_) => DeliveryOutcome::Failed(FailureReason::Timeout),
    }
}

/// Exponential backoff before attempt number `attempt` (1-based).
pub(crate) fn retry_delay_for_attempt(attempt: u32, config: &WorkerConfig) -> Duration {
    let base = config.retry_base_ms.max(1);
    let max = config.retry_max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::error::StoreError;
    use crate::types::{MessageStatus, NewQueueEntry, ResourceId, ResourceStatus};
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        calls: AtomicUsize,
        result: Result<(), FailureReason>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn post(&self, _request: CallbackRequest<'_>) -> Result<(), FailureReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    struct SlowTransport {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn post(&self, _request: CallbackRequest<'_>) -> Result<(), FailureReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            Ok(())
        }
    }

    /// Queue whose `fetch_due` hands back a snapshot that ages before the caller sees it.
    struct LaggingQueue {
        inner: InMemoryStore,
        lag: Duration,
    }

    #[async_trait]
    impl WebhookQueue for LaggingQueue {
        fn max_attempts(&self) -> u32 {
            self.inner.max_attempts()
        }

        async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
            self.inner.enqueue(entry).await
        }

        async fn fetch_due(
            &self,
            now: chrono::DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<QueueEntry>, StoreError> {
            let due = self.inner.fetch_due(now, limit).await;
            sleep(self.lag).await;
            due
        }

        async fn mark_delivered(&self, id: QueueEntryId) -> Result<(), StoreError> {
            self.inner.mark_delivered(id).await
        }

        async fn mark_failed(
            &self,
            id: QueueEntryId,
            retry_at: chrono::DateTime<Utc>,
        ) -> Result<QueueEntry, StoreError> {
            self.inner.mark_failed(id, retry_at).await
        }

        async fn mark_rejected(&self, id: QueueEntryId) -> Result<(), StoreError> {
            self.inner.mark_rejected(id).await
        }

        async fn has_entry(
            &self,
            resource_id: &ResourceId,
            status: ResourceStatus,
        ) -> Result<bool, StoreError> {
            self.inner.has_entry(resource_id, status).await
        }

        async fn entries_for(
            &self,
            resource_id: &ResourceId,
        ) -> Result<Vec<QueueEntry>, StoreError> {
            self.inner.entries_for(resource_id).await
        }

        async fn get_entry(&self, id: QueueEntryId) -> Result<QueueEntry, StoreError> {
            self.inner.get_entry(id).await
        }

        async fn abandoned(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
            self.inner.abandoned(limit).await
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            retry_base_ms: 1,
            retry_max_ms: 1,
            retry_jitter_ms: 0,
            resolve_timeout: None,
            ..Default::default()
        }
    }

    async fn enqueue(store: &InMemoryStore, url: &str) -> QueueEntry {
        store
            .enqueue(NewQueueEntry {
                resource_id: ResourceId("SM1".into()),
                resource_status: MessageStatus::Queued.into(),
                destination_url: url.to_string(),
                payload: "{}".to_string(),
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = WorkerConfig::default();
        assert_eq!(retry_delay_for_attempt(1, &config), Duration::from_millis(100));
        assert_eq!(retry_delay_for_attempt(2, &config), Duration::from_millis(200));
        assert_eq!(retry_delay_for_attempt(3, &config), Duration::from_millis(400));
        assert_eq!(retry_delay_for_attempt(40, &config), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn unsafe_destination_is_rejected_without_network() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(CountingTransport { calls: AtomicUsize::new(0), result: Ok(()) });
        let ctx = WorkerContext::new(store.clone(), transport.clone(), config());
        let entry = enqueue(&store, "http://169.254.169.254/latest").await;

        let outcome = deliver_entry(&ctx, entry.clone()).await;
        assert!(matches!(outcome, DeliveryOutcome::Rejected(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let stored = store.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn failures_count_attempts_until_abandoned() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            result: Err(FailureReason::RemoteStatus(503)),
        });
        let ctx = WorkerContext::new(store.clone(), transport.clone(), config());
        let entry = enqueue(&store, "http://example.com/cb").await;

        for _ in 0..3 {
            let current = store.get_entry(entry.id).await.unwrap();
            deliver_entry(&ctx, current).await;
        }

        let stored = store.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_delivery_marks_entry_delivered() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(CountingTransport { calls: AtomicUsize::new(0), result: Ok(()) });
        let ctx = Arc::new(WorkerContext::new(store.clone(), transport.clone(), config()));
        let entry = enqueue(&store, "https://example.com/cb").await;

        assert_eq!(poll_once(&ctx).await, 1);
        for _ in 0..50 {
            if store.get_entry(entry.id).await.unwrap().status == QueueStatus::Delivered {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let stored = store.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Delivered);
        assert!(stored.delivered_at.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_poll_snapshot_does_not_resend_a_delivered_entry() {
        let queue = Arc::new(LaggingQueue {
            inner: InMemoryStore::new(),
            lag: Duration::from_millis(100),
        });
        let transport = Arc::new(SlowTransport {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let ctx = Arc::new(WorkerContext::new(queue.clone(), transport.clone(), config()));
        let entry = enqueue(&queue.inner, "https://example.com/cb").await;

        // The second snapshot is taken while the first delivery is still running
        // and handed back after it finished.
        assert_eq!(poll_once(&ctx).await, 1);
        poll_once(&ctx).await;
        sleep(Duration::from_millis(200)).await;

        let stored = queue.get_entry(entry.id).await.unwrap();
        assert_eq!(stored.status, QueueStatus::Delivered);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
