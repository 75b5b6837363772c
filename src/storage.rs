use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    Account, AccountId, Call, CallStatus, Message, MessageStatus, NewCall, NewMessage,
    NewQueueEntry, PhoneNumber, QueueEntry, QueueEntryId, QueueStatus, Resource, ResourceId,
    ResourceStatus,
};

/// Default number of delivery attempts before a queue entry is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub(crate) const SEGMENT_LEN: usize = 160;
pub(crate) const PRICE_PER_SEGMENT: f64 = 0.0075;

/// Persistence for accounts, phone numbers, messages and calls.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an account, provisioning it with a fresh auth token on first use.
    async fn get_or_create_account(&self, account_id: &AccountId) -> Result<Account, StoreError>;

    /// Check credentials of an active account.
    async fn validate_account(
        &self,
        account_id: &AccountId,
        auth_token: &str,
    ) -> Result<bool, StoreError>;

    async fn create_phone_number(
        &self,
        account_id: &AccountId,
        number: &str,
        friendly_name: Option<&str>,
        status_callback: Option<&str>,
    ) -> Result<PhoneNumber, StoreError>;

    async fn list_phone_numbers(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<PhoneNumber>, StoreError>;

    /// Status callback configured on the account's number matching `from_number`.
    async fn status_callback_for(
        &self,
        account_id: &AccountId,
        from_number: &str,
    ) -> Result<Option<String>, StoreError> {
        let numbers = self.list_phone_numbers(account_id).await?;
        Ok(numbers
            .into_iter()
            .filter(|pn| pn.number == from_number)
            .find_map(|pn| pn.status_callback.filter(|url| !url.is_empty())))
    }

    async fn create_message(
        &self,
        account_id: &AccountId,
        new: NewMessage,
    ) -> Result<Message, StoreError>;

    async fn create_call(&self, account_id: &AccountId, new: NewCall) -> Result<Call, StoreError>;

    async fn get_resource(&self, id: &ResourceId) -> Result<Resource, StoreError>;

    /// Most recent messages first.
    async fn list_messages(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Most recent calls first.
    async fn list_calls(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Call>, StoreError>;

    /// Overwrite a resource's status.
    ///
    /// Entering `sent` or `delivered` stamps the sent time if it is unset.
    /// `duration_secs` is only recorded when a call enters `completed`.
    async fn update_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        duration_secs: Option<u32>,
    ) -> Result<Resource, StoreError>;

    /// Record the callback URL notifications for this resource go to.
    async fn set_status_callback(
        &self,
        id: &ResourceId,
        status_callback: Option<&str>,
    ) -> Result<Resource, StoreError>;

    /// Resources whose status is not terminal yet.
    async fn in_flight_resources(&self) -> Result<Vec<Resource>, StoreError>;
}

/// Durable table of scheduled lifecycle notifications.
///
/// Rows are never deleted; `mark_*` are the only mutations after `enqueue`.
#[async_trait]
pub trait WebhookQueue: Send + Sync {
    /// Attempts after which an entry is abandoned.
    fn max_attempts(&self) -> u32;

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError>;

    /// Up to `limit` pending entries with `scheduled_at <= now` and attempts
    /// below the cap, oldest due first.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    async fn mark_delivered(&self, id: QueueEntryId) -> Result<(), StoreError>;

    /// Record a failed attempt. The entry becomes `failed` once attempts reach
    /// the cap, otherwise it is due again at `retry_at`.
    async fn mark_failed(
        &self,
        id: QueueEntryId,
        retry_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError>;

    /// Fail an entry without counting an attempt (unsafe or unusable destination).
    async fn mark_rejected(&self, id: QueueEntryId) -> Result<(), StoreError>;

    /// Whether a notification for this resource status was already enqueued.
    async fn has_entry(
        &self,
        resource_id: &ResourceId,
        status: ResourceStatus,
    ) -> Result<bool, StoreError>;

    async fn entries_for(&self, resource_id: &ResourceId) -> Result<Vec<QueueEntry>, StoreError>;

    async fn get_entry(&self, id: QueueEntryId) -> Result<QueueEntry, StoreError>;

    /// Entries that ended `failed`, most recently created first.
    async fn abandoned(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError>;
}

pub(crate) fn generate_auth_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn segment_count(body: &str) -> u32 {
    let len = body.chars().count();
    len.div_ceil(SEGMENT_LEN).max(1) as u32
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// In-memory storage for tests and single-run simulations.
#[derive(Default)]
pub struct InMemoryStore {
    accounts: Mutex<HashMap<AccountId, Account>>,
    phone_numbers: Mutex<Vec<PhoneNumber>>,
    resources: Mutex<HashMap<ResourceId, Resource>>,
    queue: Mutex<QueueTable>,
    max_attempts: Option<u32>,
}

#[derive(Default)]
struct QueueTable {
    next_id: i64,
    entries: BTreeMap<QueueEntryId, QueueEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the attempt cap of the webhook queue.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_or_create_account(&self, account_id: &AccountId) -> Result<Account, StoreError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.entry(account_id.clone()).or_insert_with(|| Account {
            id: account_id.clone(),
            auth_token: generate_auth_token(),
            friendly_name: None,
            active: true,
            created_at: Utc::now(),
        });
        Ok(account.clone())
    }

    async fn validate_account(
        &self,
        account_id: &AccountId,
        auth_token: &str,
    ) -> Result<bool, StoreError> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(account_id)
            .filter(|a| a.active)
            .map(|a| constant_time_eq(a.auth_token.as_bytes(), auth_token.as_bytes()))
            .unwrap_or(false))
    }

    async fn create_phone_number(
        &self,
        account_id: &AccountId,
        number: &str,
        friendly_name: Option<&str>,
        status_callback: Option<&str>,
    ) -> Result<PhoneNumber, StoreError> {
        let phone_number = PhoneNumber {
            id: ResourceId::generate(ResourceId::PHONE_NUMBER_PREFIX),
            account_id: account_id.clone(),
            number: number.to_string(),
            friendly_name: friendly_name.map(str::to_string),
            status_callback: status_callback.map(str::to_string),
            created_at: Utc::now(),
        };
        self.phone_numbers.lock().await.push(phone_number.clone());
        Ok(phone_number)
    }

    async fn list_phone_numbers(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<PhoneNumber>, StoreError> {
        let numbers = self.phone_numbers.lock().await;
        Ok(numbers.iter().filter(|pn| &pn.account_id == account_id).cloned().collect())
    }

    async fn create_message(
        &self,
        account_id: &AccountId,
        new: NewMessage,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let num_segments = segment_count(&new.body);
        let message = Message {
            id: ResourceId::generate(ResourceId::MESSAGE_PREFIX),
            account_id: account_id.clone(),
            from: new.from,
            to: new.to,
            body: new.body,
            status: MessageStatus::Queued,
            direction: "outbound-api".to_string(),
            num_segments,
            price: f64::from(num_segments) * PRICE_PER_SEGMENT,
            price_unit: "USD".to_string(),
            status_callback: new.status_callback,
            created_at: now,
            updated_at: now,
            sent_at: None,
        };
        self.resources
            .lock()
            .await
            .insert(message.id.clone(), Resource::Message(message.clone()));
        Ok(message)
    }

    async fn create_call(&self, account_id: &AccountId, new: NewCall) -> Result<Call, StoreError> {
        let now = Utc::now();
        let call = Call {
            id: ResourceId::generate(ResourceId::CALL_PREFIX),
            account_id: account_id.clone(),
            from: new.from,
            to: new.to,
            status: CallStatus::Initiated,
            direction: "outbound-api".to_string(),
            duration_secs: None,
            status_callback: new.status_callback,
            created_at: now,
            updated_at: now,
        };
        self.resources
            .lock()
            .await
            .insert(call.id.clone(), Resource::Call(call.clone()));
        Ok(call)
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<Resource, StoreError> {
        let resources = self.resources.lock().await;
        resources.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_messages(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let resources = self.resources.lock().await;
        let mut messages: Vec<Message> = resources
            .values()
            .filter_map(Resource::as_message)
            .filter(|m| &m.account_id == account_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn list_calls(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Call>, StoreError> {
        let resources = self.resources.lock().await;
        let mut calls: Vec<Call> = resources
            .values()
            .filter_map(Resource::as_call)
            .filter(|c| &c.account_id == account_id)
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls.truncate(limit);
        Ok(calls)
    }

    async fn update_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        duration_secs: Option<u32>,
    ) -> Result<Resource, StoreError> {
        let mut resources = self.resources.lock().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let now = Utc::now();

        match (resource, status) {
            (Resource::Message(message), ResourceStatus::Message(status)) => {
                message.status = status;
                message.updated_at = now;
                if matches!(status, MessageStatus::Sent | MessageStatus::Delivered)
                    && message.sent_at.is_none()
                {
                    message.sent_at = Some(now);
                }
            }
            (Resource::Call(call), ResourceStatus::Call(status)) => {
                call.status = status;
                call.updated_at = now;
                if status == CallStatus::Completed {
                    if let Some(duration) = duration_secs {
                        call.duration_secs = Some(duration);
                    }
                }
            }
            (_, status) => {
                return Err(StoreError::KindMismatch {
                    id: id.clone(),
                    expected: status.kind(),
                })
            }
        }

        resources
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn set_status_callback(
        &self,
        id: &ResourceId,
        status_callback: Option<&str>,
    ) -> Result<Resource, StoreError> {
        let mut resources = self.resources.lock().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let now = Utc::now();

        match resource {
            Resource::Message(message) => {
                message.status_callback = status_callback.map(str::to_string);
                message.updated_at = now;
            }
            Resource::Call(call) => {
                call.status_callback = status_callback.map(str::to_string);
                call.updated_at = now;
            }
        }
        Ok(resource.clone())
    }

    async fn in_flight_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let resources = self.resources.lock().await;
        let mut in_flight: Vec<Resource> = resources
            .values()
            .filter(|r| !r.status().is_terminal())
            .cloned()
            .collect();
        in_flight.sort_by_key(Resource::created_at);
        Ok(in_flight)
    }
}

#[async_trait]
impl WebhookQueue for InMemoryStore {
    fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        let mut queue = self.queue.lock().await;
        queue.next_id += 1;
        let id = QueueEntryId(queue.next_id);
        let row = QueueEntry {
            id,
            resource_id: entry.resource_id,
            resource_status: entry.resource_status,
            destination_url: entry.destination_url,
            payload: entry.payload,
            scheduled_at: entry.scheduled_at,
            delivered_at: None,
            status: QueueStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
        };
        queue.entries.insert(id, row.clone());
        Ok(row)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let max_attempts = self.max_attempts();
        let queue = self.queue.lock().await;
        let mut due: Vec<QueueEntry> = queue
            .entries
            .values()
            .filter(|e| {
                e.status == QueueStatus::Pending
                    && e.scheduled_at <= now
                    && e.attempts < max_attempts
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_delivered(&self, id: QueueEntryId) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        let entry = queue.entries.get_mut(&id).ok_or(StoreError::EntryNotFound(id))?;
        if entry.status == QueueStatus::Pending {
            entry.status = QueueStatus::Delivered;
            entry.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: QueueEntryId,
        retry_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let max_attempts = self.max_attempts();
        let mut queue = self.queue.lock().await;
        let entry = queue.entries.get_mut(&id).ok_or(StoreError::EntryNotFound(id))?;
        if entry.status == QueueStatus::Pending {
            entry.attempts = (entry.attempts + 1).min(max_attempts);
            if entry.attempts >= max_attempts {
                entry.status = QueueStatus::Failed;
            } else {
                entry.scheduled_at = retry_at;
            }
        }
        Ok(entry.clone())
    }

    async fn mark_rejected(&self, id: QueueEntryId) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        let entry = queue.entries.get_mut(&id).ok_or(StoreError::EntryNotFound(id))?;
        if entry.status == QueueStatus::Pending {
            entry.status = QueueStatus::Failed;
        }
        Ok(())
    }

    async fn has_entry(
        &self,
        resource_id: &ResourceId,
        status: ResourceStatus,
    ) -> Result<bool, StoreError> {
        let queue = self.queue.lock().await;
        Ok(queue
            .entries
            .values()
            .any(|e| &e.resource_id == resource_id && e.resource_status == status))
    }

    async fn entries_for(&self, resource_id: &ResourceId) -> Result<Vec<QueueEntry>, StoreError> {
        let queue = self.queue.lock().await;
        Ok(queue
            .entries
            .values()
            .filter(|e| &e.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn get_entry(&self, id: QueueEntryId) -> Result<QueueEntry, StoreError> {
        let queue = self.queue.lock().await;
        queue.entries.get(&id).cloned().ok_or(StoreError::EntryNotFound(id))
    }

    async fn abandoned(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let queue = self.queue.lock().await;
        Ok(queue
            .entries
            .values()
            .rev()
            .filter(|e| e.status == QueueStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }
}
