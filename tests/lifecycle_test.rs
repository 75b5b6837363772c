use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lifecycle_dispatcher::{
    AccountId, CallStatus, CallbackRequest, FailureReason, InMemoryStore, LifecycleConfig,
    MessageStatus, NewCall, NewMessage, QueueStatus, ReqwestTransport, Resource, ResourceStatus,
    ResourceStore, ScheduleError, Simulator, SimulatorConfig, Transport, WebhookQueue,
    WorkerConfig,
};
use tokio::time::sleep;

const CALLBACK: &str = "https://callbacks.example.com/status";

/// Accepts requests and never answers, so entries stay pending.
struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn post(&self, _request: CallbackRequest<'_>) -> Result<(), FailureReason> {
        std::future::pending().await
    }
}

/// Answers every request with the configured result and counts them.
struct ScriptedTransport {
    calls: AtomicUsize,
    result: Result<(), FailureReason>,
}

impl ScriptedTransport {
    fn new(result: Result<(), FailureReason>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result,
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, _request: CallbackRequest<'_>) -> Result<(), FailureReason> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn fast_worker() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(20),
        retry_base_ms: 10,
        retry_max_ms: 40,
        retry_jitter_ms: 5,
        resolve_timeout: None,
        ..Default::default()
    }
}

fn simulator(
    store: &Arc<InMemoryStore>,
    lifecycle: LifecycleConfig,
    transport: Arc<dyn Transport>,
) -> Simulator {
    let config = SimulatorConfig {
        lifecycle,
        worker: fast_worker(),
    };
    Simulator::with_transport(config, store.clone(), store.clone(), transport)
}

async fn new_message(store: &InMemoryStore, callback: Option<&str>) -> Resource {
    let message = store
        .create_message(
            &AccountId::new("AC_test"),
            NewMessage {
                from: "+15550001111".into(),
                to: "+15550002222".into(),
                body: "hello".into(),
                status_callback: callback.map(str::to_string),
            },
        )
        .await
        .unwrap();
    Resource::Message(message)
}

async fn new_call(store: &InMemoryStore, callback: &str) -> Resource {
    let call = store
        .create_call(
            &AccountId::new("AC_test"),
            NewCall {
                from: "+15550001111".into(),
                to: "+15550003333".into(),
                status_callback: Some(callback.into()),
            },
        )
        .await
        .unwrap();
    Resource::Call(call)
}

#[tokio::test]
async fn message_lifecycle_enqueues_one_callback_per_status() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let message = new_message(&store, Some(CALLBACK)).await;

    sim.schedule_lifecycle(&message, CALLBACK).await.unwrap();

    // The initial notification is queued before scheduling returns.
    let entries = store.entries_for(message.id()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].resource_status, ResourceStatus::from(MessageStatus::Queued));
    assert_eq!(entries[0].status, QueueStatus::Pending);
    assert_eq!(entries[0].destination_url, CALLBACK);
    assert!(Utc::now() - entries[0].scheduled_at < chrono::Duration::seconds(1));

    sleep(Duration::from_millis(40)).await;
    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Queued));

    sleep(Duration::from_millis(260)).await;
    let entries = store.entries_for(message.id()).await.unwrap();
    assert_eq!(entries.len(), 2);
    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Sent));
    let sent = current.as_message().unwrap();
    let sent_after = sent.sent_at.unwrap() - sent.created_at;
    assert!(sent_after >= chrono::Duration::milliseconds(100), "sent after {sent_after}");

    sleep(Duration::from_millis(500)).await;
    let entries = store.entries_for(message.id()).await.unwrap();
    let statuses: Vec<_> = entries.iter().map(|e| e.resource_status).collect();
    assert_eq!(
        statuses,
        vec![
            ResourceStatus::from(MessageStatus::Queued),
            ResourceStatus::from(MessageStatus::Sent),
            ResourceStatus::from(MessageStatus::Delivered),
        ]
    );
    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Delivered));
    let delivered = current.as_message().unwrap();
    let delivered_after = delivered.updated_at - delivered.created_at;
    assert!(
        delivered_after >= chrono::Duration::milliseconds(500),
        "delivered after {delivered_after}"
    );
    // The sent time is kept when delivery lands.
    assert_eq!(delivered.sent_at, sent.sent_at);

    // Terminal: nothing else is ever queued.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(store.entries_for(message.id()).await.unwrap().len(), 3);

    sim.shutdown().await;
}

#[tokio::test]
async fn call_callbacks_are_abandoned_after_three_failed_attempts() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(Err(FailureReason::RemoteStatus(500)));
    let lifecycle = LifecycleConfig {
        call_ringing_after: Duration::from_millis(50),
        call_answered_after: Duration::from_millis(100),
        call_completed_min: Duration::from_millis(1_000),
        call_completed_max: Duration::from_millis(1_200),
        ..Default::default()
    };
    let mut sim = simulator(&store, lifecycle, transport.clone());
    let call = new_call(&store, CALLBACK).await;

    sim.schedule_lifecycle(&call, CALLBACK).await.unwrap();
    sleep(Duration::from_millis(2_500)).await;

    let current = store.get_resource(call.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(CallStatus::Completed));
    let duration = current.as_call().unwrap().duration_secs.unwrap();
    assert!((30..=600).contains(&duration), "duration {duration}");

    let entries = store.entries_for(call.id()).await.unwrap();
    assert_eq!(entries.len(), 4);
    for entry in &entries {
        assert_eq!(entry.status, QueueStatus::Failed, "entry {:?}", entry.resource_status);
        assert_eq!(entry.attempts, 3);
    }
    // Attempts are capped in the queue; every entry was tried at least that often.
    assert!(transport.calls.load(Ordering::SeqCst) >= 12);
    assert_eq!(sim.abandoned_webhooks(10).await.unwrap().len(), 4);

    sim.shutdown().await;
}

#[tokio::test]
async fn successful_callbacks_are_delivered_once() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(Ok(()));
    let mut sim = simulator(&store, LifecycleConfig::default(), transport.clone());
    let message = new_message(&store, Some(CALLBACK)).await;

    sim.schedule_lifecycle(&message, CALLBACK).await.unwrap();
    sleep(Duration::from_millis(900)).await;

    let entries = store.entries_for(message.id()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == QueueStatus::Delivered));
    assert!(entries.iter().all(|e| e.delivered_at.is_some()));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    sim.shutdown().await;
}

#[tokio::test]
async fn unsafe_callback_is_rejected_while_status_still_advances() {
    let store = Arc::new(InMemoryStore::new());
    let transport = ScriptedTransport::new(Ok(()));
    let mut sim = simulator(&store, LifecycleConfig::default(), transport.clone());
    let message = new_message(&store, None).await;

    sim.schedule_lifecycle(&message, "http://127.0.0.1:8080/hook").await.unwrap();
    sleep(Duration::from_millis(800)).await;

    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Delivered));

    let entries = store.entries_for(message.id()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == QueueStatus::Failed && e.attempts == 0));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

    sim.shutdown().await;
}

#[tokio::test]
async fn empty_destination_skips_callbacks() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let message = new_message(&store, None).await;

    sim.schedule_lifecycle(&message, "").await.unwrap();
    sleep(Duration::from_millis(700)).await;

    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Delivered));
    assert!(store.entries_for(message.id()).await.unwrap().is_empty());

    sim.shutdown().await;
}

#[tokio::test]
async fn scheduling_twice_is_refused() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let message = new_message(&store, Some(CALLBACK)).await;

    sim.schedule_lifecycle(&message, CALLBACK).await.unwrap();
    let err = sim.schedule_lifecycle(&message, CALLBACK).await.unwrap_err();
    assert!(matches!(err, ScheduleError::AlreadyScheduled(id) if &id == message.id()));
    assert_eq!(store.entries_for(message.id()).await.unwrap().len(), 1);

    sim.shutdown().await;
}

#[tokio::test]
async fn cancelled_lifecycle_stops_advancing() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let call = new_call(&store, CALLBACK).await;

    sim.schedule_lifecycle(&call, CALLBACK).await.unwrap();

    let pending = sim.pending_transitions().await;
    let statuses: Vec<_> = pending.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            ResourceStatus::from(CallStatus::Ringing),
            ResourceStatus::from(CallStatus::InProgress),
            ResourceStatus::from(CallStatus::Completed),
        ]
    );
    assert!(pending.windows(2).all(|w| w[0].due_in <= w[1].due_in));

    sim.cancel_lifecycle(call.id()).unwrap();
    assert!(sim.pending_transitions().await.is_empty());

    sleep(Duration::from_millis(400)).await;
    let current = store.get_resource(call.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(CallStatus::Initiated));

    sim.shutdown().await;
}

#[tokio::test]
async fn recover_fills_in_missing_callbacks_and_resumes() {
    let store = Arc::new(InMemoryStore::new());
    let message = new_message(&store, Some(CALLBACK)).await;

    // Status advanced by a previous process that died before queueing.
    store
        .update_status(message.id(), ResourceStatus::from(MessageStatus::Sent), None)
        .await
        .unwrap();

    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    assert_eq!(sim.recover().await.unwrap(), 1);

    let statuses: Vec<_> = store
        .entries_for(message.id())
        .await
        .unwrap()
        .iter()
        .map(|e| e.resource_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ResourceStatus::from(MessageStatus::Queued),
            ResourceStatus::from(MessageStatus::Sent),
        ]
    );

    // Already tracked; a second pass resumes nothing.
    assert_eq!(sim.recover().await.unwrap(), 0);

    sleep(Duration::from_millis(700)).await;
    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Delivered));
    assert_eq!(store.entries_for(message.id()).await.unwrap().len(), 3);

    sim.shutdown().await;
}

#[tokio::test]
async fn shutdown_refuses_new_work() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let message = new_message(&store, Some(CALLBACK)).await;

    sim.shutdown().await;
    assert!(!sim.is_running());

    let err = sim.schedule_lifecycle(&message, CALLBACK).await.unwrap_err();
    assert!(matches!(err, ScheduleError::Shutdown));
    assert!(matches!(sim.recover().await, Err(ScheduleError::Shutdown)));
    assert!(sim.pending_transitions().await.is_empty());
}

#[tokio::test]
async fn unreachable_destination_exhausts_attempts_over_http() {
    // Documentation range: never routed, and not an internal address.
    const UNREACHABLE: &str = "http://192.0.2.1:9/status";

    let store = Arc::new(InMemoryStore::new());
    let config = SimulatorConfig {
        lifecycle: LifecycleConfig {
            call_ringing_after: Duration::from_millis(50),
            call_answered_after: Duration::from_millis(100),
            call_completed_min: Duration::from_millis(1_000),
            call_completed_max: Duration::from_millis(1_200),
            ..Default::default()
        },
        worker: WorkerConfig {
            delivery_timeout: Duration::from_millis(200),
            ..fast_worker()
        },
    };
    let mut sim = Simulator::with_transport(
        config,
        store.clone(),
        store.clone(),
        Arc::new(ReqwestTransport::default()),
    );
    let call = new_call(&store, UNREACHABLE).await;

    sim.schedule_lifecycle(&call, UNREACHABLE).await.unwrap();
    sleep(Duration::from_millis(3_500)).await;

    let current = store.get_resource(call.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(CallStatus::Completed));

    let entries = store.entries_for(call.id()).await.unwrap();
    assert_eq!(entries.len(), 4);
    for entry in &entries {
        assert_eq!(entry.status, QueueStatus::Failed, "entry {:?}", entry.resource_status);
        assert_eq!(entry.attempts, 3);
    }

    sim.shutdown().await;
}

#[tokio::test]
async fn destination_given_at_scheduling_survives_a_restart() {
    let store = Arc::new(InMemoryStore::new());
    // The resource itself carries no callback; the caller resolved it elsewhere.
    let message = new_message(&store, None).await;

    let mut first = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    first.schedule_lifecycle(&message, CALLBACK).await.unwrap();
    first.shutdown().await;

    let stored = store.get_resource(message.id()).await.unwrap();
    assert_eq!(stored.status_callback(), Some(CALLBACK));

    let mut second = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    assert_eq!(second.recover().await.unwrap(), 1);
    sleep(Duration::from_millis(800)).await;

    let current = store.get_resource(message.id()).await.unwrap();
    assert_eq!(current.status(), ResourceStatus::from(MessageStatus::Delivered));
    let entries = store.entries_for(message.id()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.destination_url == CALLBACK));

    second.shutdown().await;
}

#[tokio::test]
async fn finished_lifecycles_are_released_but_not_restarted() {
    let store = Arc::new(InMemoryStore::new());
    let mut sim = simulator(&store, LifecycleConfig::default(), Arc::new(HangingTransport));
    let message = new_message(&store, Some(CALLBACK)).await;

    sim.schedule_lifecycle(&message, CALLBACK).await.unwrap();
    assert_eq!(sim.active_lifecycles().await, 1);

    sleep(Duration::from_millis(700)).await;
    assert_eq!(sim.active_lifecycles().await, 0);

    // The stored status is past the initial one, so the lifecycle cannot start over.
    let err = sim.schedule_lifecycle(&message, CALLBACK).await.unwrap_err();
    assert!(matches!(err, ScheduleError::AlreadyScheduled(_)));
    assert_eq!(sim.active_lifecycles().await, 0);
    assert_eq!(store.entries_for(message.id()).await.unwrap().len(), 3);

    sim.shutdown().await;
}
