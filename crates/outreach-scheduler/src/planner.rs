//! Pure per-recipient decisions.
//!
//! The engine asks the planner what should change, then hands the resulting
//! [`Transition`] to [`CampaignDb::commit`](crate::persistence::CampaignDb::commit),
//! which writes exactly those fields. Nothing here touches the store.

use chrono::{DateTime, Duration, Utc};
use outreach_core::error::{OutreachError, Result};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::models::{DeliveryStatus, NewMessageLog, Recipient, Step};

/// State change for one recipient in one pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Sequence complete: pause, no send, no log.
    Exhausted { recipient_id: i64 },
    /// Step sent: move to the next one.
    Advanced {
        recipient_id: i64,
        from_step: u32,
        to_step: u32,
        last_sent_at: DateTime<Utc>,
        next_send_at: DateTime<Utc>,
        log: NewMessageLog,
    },
    /// Step failed: same step, retried after the deferral.
    Deferred {
        recipient_id: i64,
        step: u32,
        last_sent_at: DateTime<Utc>,
        next_send_at: DateTime<Utc>,
        log: NewMessageLog,
    },
}

impl Transition {
    pub fn recipient_id(&self) -> i64 {
        match self {
            Transition::Exhausted { recipient_id }
            | Transition::Advanced { recipient_id, .. }
            | Transition::Deferred { recipient_id, .. } => *recipient_id,
        }
    }

    pub fn log(&self) -> Option<&NewMessageLog> {
        match self {
            Transition::Exhausted { .. } => None,
            Transition::Advanced { log, .. } | Transition::Deferred { log, .. } => Some(log),
        }
    }
}

/// What was (or would have been) sent for this recipient.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub provider: String,
    pub subject: String,
    /// `None` when rendering failed before a body existed.
    pub body: Option<String>,
    pub variant_label: Option<String>,
    pub attempts: u32,
}

/// Pause when the recipient has run past the last step.
pub fn plan_exhausted(recipient: &Recipient, step_count: usize) -> Option<Transition> {
    (recipient.current_step as usize >= step_count).then_some(Transition::Exhausted {
        recipient_id: recipient.id,
    })
}

/// How a dispatch ended, with the time the recipient falls due next.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Sent {
        provider_message_id: Option<String>,
        next_send_at: DateTime<Utc>,
    },
    /// Terminal failure: rendering, scheduling, or the last transport attempt.
    Failed {
        error: String,
        retry_at: DateTime<Utc>,
    },
}

/// When the next step falls due if `step` goes out at `now`.
pub fn advance_at(now: DateTime<Utc>, step: &Step) -> Result<DateTime<Utc>> {
    let hours = step.send_delay_hours;
    if hours < 0 {
        return Err(OutreachError::Schedule(format!(
            "step {} has a negative send delay ({hours}h)",
            step.sequence_order
        )));
    }
    Duration::try_hours(hours)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| {
            OutreachError::Schedule(format!(
                "step {} send delay of {hours}h is out of range",
                step.sequence_order
            ))
        })
}

/// When a failed recipient is retried.
pub fn retry_at(now: DateTime<Utc>, failure_deferral: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(failure_deferral).ok_or_else(|| {
        OutreachError::Config(format!(
            "failure deferral of {}m is out of range",
            failure_deferral.num_minutes()
        ))
    })
}

/// Transition for a finished dispatch.
pub fn plan_dispatch(
    recipient: &Recipient,
    step: &Step,
    record: &SendRecord,
    outcome: Dispatch,
    now: DateTime<Utc>,
) -> Transition {
    let (status, provider_message_id, error) = match &outcome {
        Dispatch::Sent { provider_message_id, .. } => (DeliveryStatus::Sent, provider_message_id.clone(), None),
        Dispatch::Failed { error, .. } => (DeliveryStatus::Failed, None, Some(error.clone())),
    };

    let log = NewMessageLog {
        recipient_id: Some(recipient.id),
        lead_id: recipient.lead_id,
        provider: record.provider.clone(),
        provider_message_id,
        status,
        error,
        subject: record.subject.clone(),
        body_hash: record.body.as_deref().map(body_hash),
        metadata: json!({
            "campaign_id": recipient.campaign_id,
            "step_index": recipient.current_step,
            "step_order": step.sequence_order,
            "is_follow_up": step.is_follow_up,
            "variant": record.variant_label,
            "attempts": record.attempts,
        }),
        sent_at: now,
    };

    match outcome {
        Dispatch::Sent { next_send_at, .. } => Transition::Advanced {
            recipient_id: recipient.id,
            from_step: recipient.current_step,
            to_step: recipient.current_step.saturating_add(1),
            last_sent_at: now,
            next_send_at,
            log,
        },
        Dispatch::Failed { retry_at, .. } => Transition::Deferred {
            recipient_id: recipient.id,
            step: recipient.current_step,
            last_sent_at: now,
            next_send_at: retry_at,
            log,
        },
    }
}

/// Hex SHA-256 of a rendered body.
pub fn body_hash(body: &str) -> String {
    format!("{:x}", Sha256::digest(body.as_bytes()))
}
