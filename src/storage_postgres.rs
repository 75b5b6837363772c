use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::storage::{
    constant_time_eq, generate_auth_token, segment_count, ResourceStore, WebhookQueue,
    DEFAULT_MAX_ATTEMPTS, PRICE_PER_SEGMENT,
};
use crate::types::{
    Account, AccountId, Call, CallStatus, Message, MessageStatus, NewCall, NewMessage,
    NewQueueEntry, PhoneNumber, QueueEntry, QueueEntryId, QueueStatus, Resource, ResourceId,
    ResourceKind, ResourceStatus,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sim_accounts (
    account_id TEXT PRIMARY KEY,
    auth_token TEXT NOT NULL,
    friendly_name TEXT,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS sim_phone_numbers (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    number TEXT NOT NULL,
    friendly_name TEXT,
    status_callback TEXT,
    created_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sim_phone_numbers_account ON sim_phone_numbers (account_id);
CREATE TABLE IF NOT EXISTS sim_messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    from_number TEXT NOT NULL,
    to_number TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL,
    direction TEXT NOT NULL,
    num_segments INTEGER NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    price_unit TEXT NOT NULL,
    status_callback TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    sent_at BIGINT
);
CREATE INDEX IF NOT EXISTS idx_sim_messages_account ON sim_messages (account_id, created_at);
CREATE TABLE IF NOT EXISTS sim_calls (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    from_number TEXT NOT NULL,
    to_number TEXT NOT NULL,
    status TEXT NOT NULL,
    direction TEXT NOT NULL,
    duration_secs INTEGER,
    status_callback TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sim_calls_account ON sim_calls (account_id, created_at);
CREATE TABLE IF NOT EXISTS sim_webhook_queue (
    id BIGSERIAL PRIMARY KEY,
    resource_id TEXT NOT NULL,
    resource_status TEXT NOT NULL,
    destination_url TEXT NOT NULL,
    payload TEXT NOT NULL,
    scheduled_at BIGINT NOT NULL,
    delivered_at BIGINT,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sim_webhook_queue_due ON sim_webhook_queue (status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_sim_webhook_queue_resource ON sim_webhook_queue (resource_id);
";

const MESSAGE_COLUMNS: &str = "id, account_id, from_number, to_number, body, status, direction, \
    num_segments, price, price_unit, status_callback, created_at, updated_at, sent_at";
const CALL_COLUMNS: &str = "id, account_id, from_number, to_number, status, direction, \
    duration_secs, status_callback, created_at, updated_at";
const QUEUE_COLUMNS: &str = "id, resource_id, resource_status, destination_url, payload, \
    scheduled_at, delivered_at, status, attempts, created_at";

/// Resource store and webhook queue backed by PostgreSQL.
///
/// Timestamps are stored as milliseconds since the Unix epoch.
pub struct PostgresStore {
    client: Client,
    max_attempts: u32,
}

impl PostgresStore {
    /// Wrap a connected client, creating the tables if needed.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client.batch_execute(SCHEMA).await?;
        Ok(Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn get_message(&self, id: &ResourceId) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM sim_messages WHERE id = $1");
        let row = self.client.query_opt(&sql, &[&id.0]).await.map_err(backend)?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_call(&self, id: &ResourceId) -> Result<Option<Call>, StoreError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM sim_calls WHERE id = $1");
        let row = self.client.query_opt(&sql, &[&id.0]).await.map_err(backend)?;
        row.as_ref().map(call_from_row).transpose()
    }
}

#[async_trait]
impl ResourceStore for PostgresStore {
    async fn get_or_create_account(&self, account_id: &AccountId) -> Result<Account, StoreError> {
        self.client
            .execute(
                "INSERT INTO sim_accounts (account_id, auth_token, created_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (account_id) DO NOTHING",
                &[&account_id.0, &generate_auth_token(), &to_millis(Utc::now())],
            )
            .await
            .map_err(backend)?;

        let row = self
            .client
            .query_one(
                "SELECT account_id, auth_token, friendly_name, active, created_at
                 FROM sim_accounts WHERE account_id = $1",
                &[&account_id.0],
            )
            .await
            .map_err(backend)?;

        Ok(Account {
            id: AccountId(row.try_get(0).map_err(backend)?),
            auth_token: row.try_get(1).map_err(backend)?,
            friendly_name: row.try_get(2).map_err(backend)?,
            active: row.try_get(3).map_err(backend)?,
            created_at: from_millis(row.try_get(4).map_err(backend)?)?,
        })
    }

    async fn validate_account(
        &self,
        account_id: &AccountId,
        auth_token: &str,
    ) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT auth_token FROM sim_accounts WHERE account_id = $1 AND active",
                &[&account_id.0],
            )
            .await
            .map_err(backend)?;

        let Some(row) = row else { return Ok(false) };
        let stored: String = row.try_get(0).map_err(backend)?;
        Ok(constant_time_eq(stored.as_bytes(), auth_token.as_bytes()))
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
        self.client
            .execute(
                "INSERT INTO sim_phone_numbers
                    (id, account_id, number, friendly_name, status_callback, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &phone_number.id.0,
                    &phone_number.account_id.0,
                    &phone_number.number,
                    &phone_number.friendly_name,
                    &phone_number.status_callback,
                    &to_millis(phone_number.created_at),
                ],
            )
            .await
            .map_err(backend)?;
        Ok(phone_number)
    }

    async fn list_phone_numbers(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<PhoneNumber>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, account_id, number, friendly_name, status_callback, created_at
                 FROM sim_phone_numbers WHERE account_id = $1 ORDER BY created_at",
                &[&account_id.0],
            )
            .await
            .map_err(backend)?;

        rows.iter()
            .map(|row| {
                Ok(PhoneNumber {
                    id: ResourceId(row.try_get(0).map_err(backend)?),
                    account_id: AccountId(row.try_get(1).map_err(backend)?),
                    number: row.try_get(2).map_err(backend)?,
                    friendly_name: row.try_get(3).map_err(backend)?,
                    status_callback: row.try_get(4).map_err(backend)?,
                    created_at: from_millis(row.try_get(5).map_err(backend)?)?,
                })
            })
            .collect()
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

        let sql = format!(
            "INSERT INTO sim_messages ({MESSAGE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NULL)"
        );
        self.client
            .execute(
                &sql,
                &[
                    &message.id.0,
                    &message.account_id.0,
                    &message.from,
                    &message.to,
                    &message.body,
                    &message.status.as_str(),
                    &message.direction,
                    &(message.num_segments as i32),
                    &message.price,
                    &message.price_unit,
                    &message.status_callback,
                    &to_millis(message.created_at),
                    &to_millis(message.updated_at),
                ],
            )
            .await
            .map_err(backend)?;
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

        let sql = format!(
            "INSERT INTO sim_calls ({CALL_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9)"
        );
        self.client
            .execute(
                &sql,
                &[
                    &call.id.0,
                    &call.account_id.0,
                    &call.from,
                    &call.to,
                    &call.status.as_str(),
                    &call.direction,
                    &call.status_callback,
                    &to_millis(call.created_at),
                    &to_millis(call.updated_at),
                ],
            )
            .await
            .map_err(backend)?;
        Ok(call)
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<Resource, StoreError> {
        let found = match id.kind() {
            Some(ResourceKind::Message) => self.get_message(id).await?.map(Resource::Message),
            Some(ResourceKind::Call) => self.get_call(id).await?.map(Resource::Call),
            None => None,
        };
        found.ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_messages(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM sim_messages
             WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = self
            .client
            .query(&sql, &[&account_id.0, &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_calls(
        &self,
        account_id: &AccountId,
        limit: usize,
    ) -> Result<Vec<Call>, StoreError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM sim_calls
             WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = self
            .client
            .query(&sql, &[&account_id.0, &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(call_from_row).collect()
    }

    async fn update_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        duration_secs: Option<u32>,
    ) -> Result<Resource, StoreError> {
        let kind = id.kind().ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if kind != status.kind() {
            return Err(StoreError::KindMismatch {
                id: id.clone(),
                expected: status.kind(),
            });
        }
        let now = to_millis(Utc::now());

        let updated = match status {
            ResourceStatus::Message(s) => {
                let stamps_sent = matches!(s, MessageStatus::Sent | MessageStatus::Delivered);
                self.client
                    .execute(
                        "UPDATE sim_messages
                         SET status = $2,
                             updated_at = $3,
                             sent_at = CASE WHEN $4 AND sent_at IS NULL THEN $3 ELSE sent_at END
                         WHERE id = $1",
                        &[&id.0, &s.as_str(), &now, &stamps_sent],
                    )
                    .await
                    .map_err(backend)?
            }
            ResourceStatus::Call(s) => {
                let duration = if s == CallStatus::Completed {
                    duration_secs.map(|d| d as i32)
                } else {
                    None
                };
                self.client
                    .execute(
                        "UPDATE sim_calls
                         SET status = $2,
                             updated_at = $3,
                             duration_secs = COALESCE($4, duration_secs)
                         WHERE id = $1",
                        &[&id.0, &s.as_str(), &now, &duration],
                    )
                    .await
                    .map_err(backend)?
            }
        };

        if updated == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.get_resource(id).await
    }

    async fn set_status_callback(
        &self,
        id: &ResourceId,
        status_callback: Option<&str>,
    ) -> Result<Resource, StoreError> {
        let sql = match id.kind() {
            Some(ResourceKind::Message) => {
                "UPDATE sim_messages SET status_callback = $2, updated_at = $3 WHERE id = $1"
            }
            Some(ResourceKind::Call) => {
                "UPDATE sim_calls SET status_callback = $2, updated_at = $3 WHERE id = $1"
            }
            None => return Err(StoreError::NotFound(id.clone())),
        };
        let updated = self
            .client
            .execute(sql, &[&id.0, &status_callback, &to_millis(Utc::now())])
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.get_resource(id).await
    }

    async fn in_flight_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let message_sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM sim_messages WHERE status NOT IN ('delivered', 'failed')"
        );
        let call_sql = format!(
            "SELECT {CALL_COLUMNS} FROM sim_calls WHERE status NOT IN ('completed', 'failed')"
        );

        let mut resources = Vec::new();
        for row in self.client.query(&message_sql, &[]).await.map_err(backend)? {
            resources.push(Resource::Message(message_from_row(&row)?));
        }
        for row in self.client.query(&call_sql, &[]).await.map_err(backend)? {
            resources.push(Resource::Call(call_from_row(&row)?));
        }
        resources.sort_by_key(Resource::created_at);
        Ok(resources)
    }
}

#[async_trait]
impl WebhookQueue for PostgresStore {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        let sql = format!(
            "INSERT INTO sim_webhook_queue
                (resource_id, resource_status, destination_url, payload, scheduled_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {QUEUE_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                &sql,
                &[
                    &entry.resource_id.0,
                    &entry.resource_status.as_str(),
                    &entry.destination_url,
                    &entry.payload,
                    &to_millis(entry.scheduled_at),
                    &to_millis(Utc::now()),
                ],
            )
            .await
            .map_err(backend)?;
        queue_entry_from_row(&row)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sim_webhook_queue
             WHERE status = 'pending' AND scheduled_at <= $1 AND attempts < $2
             ORDER BY scheduled_at, id
             LIMIT $3"
        );
        let rows = self
            .client
            .query(&sql, &[&to_millis(now), &(self.max_attempts as i32), &(limit as i64)])
            .await
            .map_err(backend)?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    async fn mark_delivered(&self, id: QueueEntryId) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE sim_webhook_queue SET status = 'delivered', delivered_at = $2
                 WHERE id = $1 AND status = 'pending'",
                &[&id.0, &to_millis(Utc::now())],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: QueueEntryId,
        retry_at: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        self.client
            .execute(
                "UPDATE sim_webhook_queue
                 SET attempts = LEAST(attempts + 1, $2),
                     status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE status END,
                     scheduled_at = CASE WHEN attempts + 1 >= $2 THEN scheduled_at ELSE $3 END
                 WHERE id = $1 AND status = 'pending'",
                &[&id.0, &(self.max_attempts as i32), &to_millis(retry_at)],
            )
            .await
            .map_err(backend)?;
        self.get_entry(id).await
    }

    async fn mark_rejected(&self, id: QueueEntryId) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE sim_webhook_queue SET status = 'failed'
                 WHERE id = $1 AND status = 'pending'",
                &[&id.0],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn has_entry(
        &self,
        resource_id: &ResourceId,
        status: ResourceStatus,
    ) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM sim_webhook_queue WHERE resource_id = $1 AND resource_status = $2
                 )",
                &[&resource_id.0, &status.as_str()],
            )
            .await
            .map_err(backend)?;
        row.try_get(0).map_err(backend)
    }

    async fn entries_for(&self, resource_id: &ResourceId) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sim_webhook_queue WHERE resource_id = $1 ORDER BY id"
        );
        let rows = self.client.query(&sql, &[&resource_id.0]).await.map_err(backend)?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    async fn get_entry(&self, id: QueueEntryId) -> Result<QueueEntry, StoreError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM sim_webhook_queue WHERE id = $1");
        let row = self.client.query_opt(&sql, &[&id.0]).await.map_err(backend)?;
        match row {
            Some(row) => queue_entry_from_row(&row),
            None => Err(StoreError::EntryNotFound(id)),
        }
    }

    async fn abandoned(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sim_webhook_queue
             WHERE status = 'failed' ORDER BY id DESC LIMIT $1"
        );
        let rows = self.client.query(&sql, &[&(limit as i64)]).await.map_err(backend)?;
        rows.iter().map(queue_entry_from_row).collect()
    }
}

fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn message_from_row(row: &Row) -> Result<Message, StoreError> {
    let status: String = row.try_get(5).map_err(backend)?;
    let num_segments: i32 = row.try_get(7).map_err(backend)?;
    let sent_at: Option<i64> = row.try_get(13).map_err(backend)?;
    Ok(Message {
        id: ResourceId(row.try_get(0).map_err(backend)?),
        account_id: AccountId(row.try_get(1).map_err(backend)?),
        from: row.try_get(2).map_err(backend)?,
        to: row.try_get(3).map_err(backend)?,
        body: row.try_get(4).map_err(backend)?,
        status: status.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        direction: row.try_get(6).map_err(backend)?,
        num_segments: num_segments.max(1) as u32,
        price: row.try_get(8).map_err(backend)?,
        price_unit: row.try_get(9).map_err(backend)?,
        status_callback: row.try_get(10).map_err(backend)?,
        created_at: from_millis(row.try_get(11).map_err(backend)?)?,
        updated_at: from_millis(row.try_get(12).map_err(backend)?)?,
        sent_at: sent_at.map(from_millis).transpose()?,
    })
}

fn call_from_row(row: &Row) -> Result<Call, StoreError> {
    let status: String = row.try_get(4).map_err(backend)?;
    let duration: Option<i32> = row.try_get(6).map_err(backend)?;
    Ok(Call {
        id: ResourceId(row.try_get(0).map_err(backend)?),
        account_id: AccountId(row.try_get(1).map_err(backend)?),
        from: row.try_get(2).map_err(backend)?,
        to: row.try_get(3).map_err(backend)?,
        status: status.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        direction: row.try_get(5).map_err(backend)?,
        duration_secs: duration.map(|d| d.max(0) as u32),
        status_callback: row.try_get(7).map_err(backend)?,
        created_at: from_millis(row.try_get(8).map_err(backend)?)?,
        updated_at: from_millis(row.try_get(9).map_err(backend)?)?,
    })
}

fn queue_entry_from_row(row: &Row) -> Result<QueueEntry, StoreError> {
    let resource_id = ResourceId(row.try_get(1).map_err(backend)?);
    let kind = resource_id
        .kind()
        .ok_or_else(|| StoreError::Corrupt(format!("unknown resource id: {resource_id}")))?;
    let resource_status: String = row.try_get(2).map_err(backend)?;
    let status: String = row.try_get(7).map_err(backend)?;
    let attempts: i32 = row.try_get(8).map_err(backend)?;
    let delivered_at: Option<i64> = row.try_get(6).map_err(backend)?;

    Ok(QueueEntry {
        id: QueueEntryId(row.try_get(0).map_err(backend)?),
        resource_status: ResourceStatus::parse(kind, &resource_status)
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        resource_id,
        destination_url: row.try_get(3).map_err(backend)?,
        payload: row.try_get(4).map_err(backend)?,
        scheduled_at: from_millis(row.try_get(5).map_err(backend)?)?,
        delivered_at: delivered_at.map(from_millis).transpose()?,
        status: status
            .parse::<QueueStatus>()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        attempts: attempts.max(0) as u32,
        created_at: from_millis(row.try_get(9).map_err(backend)?)?,
    })
}
