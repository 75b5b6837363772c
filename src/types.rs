use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant identifier (the provider's account id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type-prefixed identifier of a simulated resource.
///
/// Messages carry an `SM` prefix, calls a `CA` prefix, phone numbers `PN`.
/// The prefix is followed by 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub const MESSAGE_PREFIX: &'static str = "SM";
    pub const CALL_PREFIX: &'static str = "CA";
    pub const PHONE_NUMBER_PREFIX: &'static str = "PN";

    /// Generate a fresh id with the given two-letter prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    /// Resource kind implied by the id prefix, if any.
    pub fn kind(&self) -> Option<ResourceKind> {
        if self.0.starts_with(Self::MESSAGE_PREFIX) {
            Some(ResourceKind::Message)
        } else if self.0.starts_with(Self::CALL_PREFIX) {
            Some(ResourceKind::Call)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a webhook queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueEntryId(pub i64);

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Message,
    Call,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Message => "message",
            ResourceKind::Call => "call",
        }
    }
}

/// Error returned when a status string does not name a known status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MessageStatus::Queued),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }
}

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "ringing" => Ok(CallStatus::Ringing),
            "in-progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Status of either resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceStatus {
    Message(MessageStatus),
    Call(CallStatus),
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Message(s) => s.as_str(),
            ResourceStatus::Call(s) => s.as_str(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceStatus::Message(_) => ResourceKind::Message,
            ResourceStatus::Call(_) => ResourceKind::Call,
        }
    }

    /// Whether no further lifecycle transition follows this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Message(MessageStatus::Delivered | MessageStatus::Failed)
                | ResourceStatus::Call(CallStatus::Completed | CallStatus::Failed)
        )
    }

    /// Parse a status string for the given kind.
    pub fn parse(kind: ResourceKind, s: &str) -> Result<Self, UnknownStatus> {
        match kind {
            ResourceKind::Message => s.parse().map(ResourceStatus::Message),
            ResourceKind::Call => s.parse().map(ResourceStatus::Call),
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<MessageStatus> for ResourceStatus {
    fn from(status: MessageStatus) -> Self {
        ResourceStatus::Message(status)
    }
}

impl From<CallStatus> for ResourceStatus {
    fn from(status: CallStatus) -> Self {
        ResourceStatus::Call(status)
    }
}

/// A tenant. Auto-provisioned on first use; the auth token never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub auth_token: String,
    pub friendly_name: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A provisioned number. Its status callback is where lifecycle
/// notifications for resources sent from this number are POSTed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub number: String,
    pub friendly_name: Option<String>,
    pub status_callback: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub from: String,
    pub to: String,
    pub body: String,
    pub status: MessageStatus,
    pub direction: String,
    pub num_segments: u32,
    pub price: f64,
    pub price_unit: String,
    pub status_callback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub from: String,
    pub to: String,
    pub status: CallStatus,
    pub direction: String,
    /// Talk time in seconds, only set once the call reaches `completed`.
    pub duration_secs: Option<u32>,
    pub status_callback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record whose status is simulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resource_type", rename_all = "lowercase")]
pub enum Resource {
    Message(Message),
    Call(Call),
}

impl Resource {
    pub fn id(&self) -> &ResourceId {
        match self {
            Resource::Message(m) => &m.id,
            Resource::Call(c) => &c.id,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        match self {
            Resource::Message(m) => &m.account_id,
            Resource::Call(c) => &c.account_id,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Message(_) => ResourceKind::Message,
            Resource::Call(_) => ResourceKind::Call,
        }
    }

    pub fn status(&self) -> ResourceStatus {
        match self {
            Resource::Message(m) => ResourceStatus::Message(m.status),
            Resource::Call(c) => ResourceStatus::Call(c.status),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Resource::Message(m) => m.created_at,
            Resource::Call(c) => c.created_at,
        }
    }

    pub fn status_callback(&self) -> Option<&str> {
        let callback = match self {
            Resource::Message(m) => m.status_callback.as_deref(),
            Resource::Call(c) => c.status_callback.as_deref(),
        };
        callback.filter(|url| !url.is_empty())
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Resource::Message(m) => Some(m),
            Resource::Call(_) => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Resource::Call(c) => Some(c),
            Resource::Message(_) => None,
        }
    }
}

/// Parameters for creating a message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub status_callback: Option<String>,
}

/// Parameters for creating a call.
#[derive(Debug, Clone, Default)]
pub struct NewCall {
    pub from: String,
    pub to: String,
    pub status_callback: Option<String>,
}

/// Delivery status of a webhook queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Delivered,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "delivered" => Ok(QueueStatus::Delivered),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A notification to be written to the queue.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub resource_id: ResourceId,
    pub resource_status: ResourceStatus,
    pub destination_url: String,
    pub payload: String,
    pub scheduled_at: DateTime<Utc>,
}

/// A scheduled notification.
///
/// Eligible for delivery iff `status == Pending`, `scheduled_at <= now`
/// and `attempts` is below the queue's attempt cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub resource_id: ResourceId,
    /// Lifecycle status this notification reports.
    pub resource_status: ResourceStatus,
    pub destination_url: String,
    pub payload: String,
    pub scheduled_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_hex_suffix() {
        let id = ResourceId::generate(ResourceId::MESSAGE_PREFIX);
        assert!(id.as_str().starts_with("SM"));
        assert_eq!(id.as_str().len(), 34);
        assert!(id.as_str()[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.kind(), Some(ResourceKind::Message));

        let call = ResourceId::generate(ResourceId::CALL_PREFIX);
        assert_eq!(call.kind(), Some(ResourceKind::Call));
        assert_ne!(call, ResourceId::generate(ResourceId::CALL_PREFIX));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        assert_eq!(
            ResourceStatus::parse(ResourceKind::Call, "in-progress"),
            Ok(ResourceStatus::Call(CallStatus::InProgress))
        );
        assert!(ResourceStatus::parse(ResourceKind::Message, "ringing").is_err());
        assert!(ResourceStatus::Message(MessageStatus::Delivered).is_terminal());
        assert!(!ResourceStatus::Call(CallStatus::InProgress).is_terminal());
    }

    #[test]
    fn empty_status_callback_counts_as_unset() {
        let now = Utc::now();
        let message = Resource::Message(Message {
            id: ResourceId::generate(ResourceId::MESSAGE_PREFIX),
            account_id: AccountId::new("AC1"),
            from: "+15550001".into(),
            to: "+15550002".into(),
            body: "hi".into(),
            status: MessageStatus::Queued,
            direction: "outbound-api".into(),
            num_segments: 1,
            price: 0.0075,
            price_unit: "USD".into(),
            status_callback: Some(String::new()),
            created_at: now,
            updated_at: now,
            sent_at: None,
        });
        assert_eq!(message.status_callback(), None);
    }
}
