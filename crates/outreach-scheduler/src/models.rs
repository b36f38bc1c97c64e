//! Campaign data model: the rows a send pass reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A campaign owns an ordered sequence of steps and its enrolled recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    /// Free-text offer exposed to templates as `campaign.offer`.
    pub offer: Option<String>,
    pub status: String,
}

/// The person behind a recipient enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
}

/// One enrollment of an address into a campaign's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub campaign_id: i64,
    pub lead_id: Option<i64>,
    pub email: String,
    /// Index of the next step to send. Never decreases.
    pub current_step: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// `None` means not scheduled.
    pub next_send_at: Option<DateTime<Utc>>,
    pub paused: bool,
    /// Pinned A/B variant; overrides the weighted pick when the step has it.
    pub variant_label: Option<String>,
}

impl Recipient {
    /// Due and not paused at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_send_at.is_some_and(|at| at <= now)
    }
}

/// One position in a campaign's content sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub campaign_id: i64,
    /// 1-based, unique within the campaign.
    pub sequence_order: u32,
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
    /// Hours until the following step becomes due once this one is sent.
    /// Stored as read; negative or oversized values are refused at send time.
    pub send_delay_hours: i64,
    pub is_follow_up: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl Step {
    pub fn new(sequence_order: u32) -> Self {
        Self {
            id: 0,
            campaign_id: 0,
            sequence_order,
            subject_template: None,
            body_template: None,
            send_delay_hours: 24,
            is_follow_up: sequence_order > 1,
            variants: Vec::new(),
        }
    }

    pub fn subject(mut self, template: &str) -> Self {
        self.subject_template = Some(template.to_string());
        self
    }

    pub fn body(mut self, template: &str) -> Self {
        self.body_template = Some(template.to_string());
        self
    }

    pub fn delay_hours(mut self, hours: i64) -> Self {
        self.send_delay_hours = hours;
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }
}

/// Alternative rendering of a step (A/B testing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: i64,
    pub step_id: i64,
    pub label: String,
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
    /// Stored as entered; see [`Variant::effective_weight`].
    pub weight: i64,
}

impl Variant {
    pub fn new(label: &str, weight: i64) -> Self {
        Self {
            id: 0,
            step_id: 0,
            label: label.to_string(),
            subject_template: None,
            body_template: None,
            weight,
        }
    }

    pub fn subject(mut self, template: &str) -> Self {
        self.subject_template = Some(template.to_string());
        self
    }

    pub fn body(mut self, template: &str) -> Self {
        self.body_template = Some(template.to_string());
        self
    }

    /// Zero and negative weights count as 1 so every variant stays reachable.
    pub fn effective_weight(&self) -> u64 {
        self.weight.max(1) as u64
    }
}

/// Outcome recorded in a message log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One scheduler pass, as written to `scheduler_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub sent_count: u32,
    pub failed_count: u32,
}

/// Message log row about to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageLog {
    pub recipient_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub subject: String,
    /// SHA-256 hex of the rendered body.
    pub body_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Persisted message log row (audit trail, append-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: i64,
    pub recipient_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub subject: String,
    pub body_hash: Option<String>,
    pub metadata: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
