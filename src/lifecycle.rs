//! Provider-realistic status lifecycles.
//!
//! Each resource kind follows a fixed order of statuses. A [`Plan`] lists
//! them with their delay measured from the resource's creation time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{CallStatus, MessageStatus, Resource, ResourceId, ResourceKind, ResourceStatus};

/// Shortest and longest talk time reported for a completed call, in seconds.
pub const MIN_CALL_DURATION_SECS: u32 = 30;
pub const MAX_CALL_DURATION_SECS: u32 = 600;

/// Lifecycle timing.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub message_sent_after: Duration,
    pub message_delivered_after: Duration,
    pub call_ringing_after: Duration,
    pub call_answered_after: Duration,
    /// Bounds of the uniformly random completion delay.
    pub call_completed_min: Duration,
    pub call_completed_max: Duration,
    /// Simulated seconds of talk time per real second between answer and hang-up.
    pub talk_time_scale: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            message_sent_after: Duration::from_millis(100),
            message_delivered_after: Duration::from_millis(500),
            call_ringing_after: Duration::from_millis(200),
            call_answered_after: Duration::from_millis(800),
            call_completed_min: Duration::from_millis(5_000),
            call_completed_max: Duration::from_millis(30_000),
            talk_time_scale: 20,
        }
    }
}

/// One step of a lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: ResourceStatus,
    /// Delay since resource creation.
    pub after: Duration,
    /// Talk time recorded with this status; only set on call completion.
    pub duration_secs: Option<u32>,
}

/// Ordered transitions for one resource, first one at zero delay.
#[derive(Debug, Clone)]
pub struct Plan {
    pub resource_id: ResourceId,
    pub transitions: Vec<Transition>,
}

impl Plan {
    /// Compute the lifecycle of `resource`.
    pub fn for_resource(resource: &Resource, config: &LifecycleConfig) -> Self {
        let transitions = match resource.kind() {
            ResourceKind::Message => message_transitions(config),
            ResourceKind::Call => call_transitions(config),
        };
        Self {
            resource_id: resource.id().clone(),
            transitions,
        }
    }

    pub fn initial(&self) -> Option<&Transition> {
        self.transitions.first()
    }

    /// Transitions ordered after `status`.
    pub fn after_status(&self, status: ResourceStatus) -> &[Transition] {
        match self.position(status) {
            Some(index) => &self.transitions[index + 1..],
            None => &[],
        }
    }

    /// Transitions up to and including `status`.
    pub fn reached(&self, status: ResourceStatus) -> &[Transition] {
        match self.position(status) {
            Some(index) => &self.transitions[..=index],
            None => &[],
        }
    }

    fn position(&self, status: ResourceStatus) -> Option<usize> {
        self.transitions.iter().position(|t| t.status == status)
    }
}

fn message_transitions(config: &LifecycleConfig) -> Vec<Transition> {
    let sent = config.message_sent_after;
    let delivered = config.message_delivered_after.max(sent);
    vec![
        transition(MessageStatus::Queued, Duration::ZERO),
        transition(MessageStatus::Sent, sent),
        transition(MessageStatus::Delivered, delivered),
    ]
}

fn call_transitions(config: &LifecycleConfig) -> Vec<Transition> {
    let ringing = config.call_ringing_after;
    let answered = config.call_answered_after.max(ringing);

    let completed = random_between(config.call_completed_min, config.call_completed_max)
        .max(answered + Duration::from_millis(1));
    let duration = talk_time_secs(completed - answered, config.talk_time_scale);

    vec![
        transition(CallStatus::Initiated, Duration::ZERO),
        transition(CallStatus::Ringing, ringing),
        transition(CallStatus::InProgress, answered),
        Transition {
            status: CallStatus::Completed.into(),
            after: completed,
            duration_secs: Some(duration),
        },
    ]
}

fn transition(status: impl Into<ResourceStatus>, after: Duration) -> Transition {
    Transition {
        status: status.into(),
        after,
        duration_secs: None,
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    let low = min.as_millis() as u64;
    let high = (max.as_millis() as u64).max(low);
    Duration::from_millis(fastrand::u64(low..=high))
}

/// Talk time reported for a call that was connected for `connected`.
pub fn talk_time_secs(connected: Duration, scale: u32) -> u32 {
    let scaled = connected.as_secs_f64() * f64::from(scale.max(1));
    (scaled.round() as u32).clamp(MIN_CALL_DURATION_SECS, MAX_CALL_DURATION_SECS)
}

/// JSON body POSTed to the destination for each transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCallback<'a> {
    pub resource_id: &'a str,
    pub resource_type: ResourceKind,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub account_id: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

impl<'a> StatusCallback<'a> {
    /// Describe `resource` as having reached `status`.
    pub fn new(resource: &'a Resource, status: ResourceStatus, timestamp: DateTime<Utc>) -> Self {
        match resource {
            Resource::Message(m) => Self {
                resource_id: m.id.as_str(),
                resource_type: ResourceKind::Message,
                status: status.as_str(),
                timestamp,
                account_id: m.account_id.as_str(),
                from: &m.from,
                to: &m.to,
                body: Some(&m.body),
                duration: None,
            },
            Resource::Call(c) => Self {
                resource_id: c.id.as_str(),
                resource_type: ResourceKind::Call,
                status: status.as_str(),
                timestamp,
                account_id: c.account_id.as_str(),
                from: &c.from,
                to: &c.to,
                body: None,
                duration: if status == ResourceStatus::Call(CallStatus::Completed) {
                    c.duration_secs
                } else {
                    None
                },
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
