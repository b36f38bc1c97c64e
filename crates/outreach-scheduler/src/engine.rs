//! Scheduler engine: one send pass over every due recipient.
//!
//! A pass takes the run lock, records a run, walks due recipients one at a
//! time (pacing, retry, deferral), commits each recipient's transition with
//! its log row, and closes the run. The lock is left to expire.

use chrono::{DateTime, SubsecRound, Utc};
use outreach_core::config::SchedulerConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::{OutboundMessage, Transport};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

use crate::lock::RunLock;
use crate::models::Recipient;
use crate::persistence::CampaignDb;
use crate::planner::{self, Dispatch, SendRecord, Transition};
use crate::render::{self, RenderContext};
use crate::retry::{self, RateLimiter, RetryPolicy};
use crate::variant;

/// Counters for one completed pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub run_id: i64,
    pub owner_token: String,
    pub sent: u32,
    pub failed: u32,
    /// Recipients paused because their sequence is complete.
    pub exhausted: u32,
    /// Recipients dropped because their campaign, lead, or row vanished.
    pub skipped: u32,
    /// Due recipients left for the next pass when the deadline hit.
    pub carried_over: u32,
}

/// Result of [`SchedulerEngine::run_once`].
#[derive(Debug, Clone, Serialize)]
pub enum PassOutcome {
    /// Another replica holds a live lock. Not an error.
    LockUnavailable,
    Completed(PassReport),
}

impl PassOutcome {
    pub fn sent_count(&self) -> u32 {
        match self {
            PassOutcome::LockUnavailable => 0,
            PassOutcome::Completed(r) => r.sent,
        }
    }
}

/// Per-recipient result inside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientOutcome {
    Sent,
    Failed,
    Exhausted,
    Skipped,
}

/// The send pass orchestrator.
pub struct SchedulerEngine {
    db: Arc<CampaignDb>,
    transport: Arc<dyn Transport>,
    config: SchedulerConfig,
    lock: RunLock,
    policy: RetryPolicy,
}

impl SchedulerEngine {
    pub fn new(db: Arc<CampaignDb>, transport: Arc<dyn Transport>, config: SchedulerConfig) -> Self {
        let lock = RunLock::new(&config.lock_name, config.lock_lease());
        let policy = RetryPolicy::from_config(&config);
        Self {
            db,
            transport,
            config,
            lock,
            policy,
        }
    }

    pub fn run_lock(&self) -> &RunLock {
        &self.lock
    }

    /// Run one pass at the current time.
    pub async fn run_once(&self) -> Result<PassOutcome> {
        self.run_once_at(Utc::now()).await
    }

    /// Run one pass as of `now`. Every timestamp written by the pass derives
    /// from `now`, truncated to milliseconds.
    ///
    /// Per-recipient problems end up in the run counters and message logs.
    /// Anything else (store failures, transport misconfiguration) aborts the
    /// pass with `Err`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<PassOutcome> {
        // Schedule columns keep millisecond precision
        let now = now.trunc_subsecs(3);
        let Some(lease) = self.lock.acquire(&self.db, now)? else {
            tracing::debug!("🔒 Lock '{}' held elsewhere, skipping pass", self.lock.name());
            return Ok(PassOutcome::LockUnavailable);
        };

        let started = Instant::now();
        let run_id = self.db.start_run(&lease.owner_token, now)?;
        let mut report = PassReport {
            run_id,
            owner_token: lease.owner_token,
            ..Default::default()
        };

        let swept = self.sweep(now, &mut report).await;

        let finished_at = now
            + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        let closed = self
            .db
            .finish_run(run_id, report.sent, report.failed, finished_at);

        match swept {
            Ok(()) => {
                closed?;
                if report.sent + report.failed + report.exhausted > 0 {
                    tracing::info!(
                        "📬 Pass #{run_id} done: {} sent, {} failed, {} completed, {} skipped",
                        report.sent,
                        report.failed,
                        report.exhausted,
                        report.skipped
                    );
                }
                Ok(PassOutcome::Completed(report))
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    tracing::warn!("⚠️ Could not close run #{run_id}: {close_err}");
                }
                tracing::error!("❌ Pass #{run_id} aborted: {e}");
                Err(e)
            }
        }
    }

    fn failure_deferral(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.config.failure_deferral())
            .map_err(|e| OutreachError::Config(format!("failure_deferral_minutes out of range: {e}")))
    }

    async fn sweep(&self, now: DateTime<Utc>, report: &mut PassReport) -> Result<()> {
        let due = self.db.due_recipients(now)?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!("📋 {} recipient(s) due", due.len());

        let mut limiter = RateLimiter::new(self.config.send_spacing());
        let deadline = self.config.pass_deadline().map(|d| Instant::now() + d);

        for (i, recipient) in due.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.carried_over = (due.len() - i) as u32;
                tracing::warn!(
                    "⏱️ Pass deadline reached, {} recipient(s) left for the next pass",
                    report.carried_over
                );
                break;
            }

            match self.process(recipient, now, &mut limiter, deadline).await? {
                RecipientOutcome::Sent => report.sent += 1,
                RecipientOutcome::Failed => report.failed += 1,
                RecipientOutcome::Exhausted => {
                    report.exhausted += 1;
                    continue;
                }
                RecipientOutcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
            }
            self.db
                .update_run_counts(report.run_id, report.sent, report.failed)?;
        }
        Ok(())
    }

    async fn process(
        &self,
        queued: &Recipient,
        now: DateTime<Utc>,
        limiter: &mut RateLimiter,
        deadline: Option<Instant>,
    ) -> Result<RecipientOutcome> {
        // Re-read: the row may have been deleted or paused since the due query
        let Some(recipient) = self.db.get_recipient(queued.id)? else {
            return Ok(RecipientOutcome::Skipped);
        };
        if !recipient.is_due(now) {
            return Ok(RecipientOutcome::Skipped);
        }

        let Some(campaign) = self.db.get_campaign(recipient.campaign_id)? else {
            tracing::debug!("Recipient {} has no campaign {}, skipping", recipient.id, recipient.campaign_id);
            return Ok(RecipientOutcome::Skipped);
        };
        let lead = match recipient.lead_id {
            Some(lead_id) => match self.db.get_lead(lead_id)? {
                Some(lead) => Some(lead),
                None => {
                    tracing::debug!("Recipient {} has no lead {lead_id}, skipping", recipient.id);
                    return Ok(RecipientOutcome::Skipped);
                }
            },
            None => None,
        };

        let steps = self.db.steps_for_campaign(campaign.id)?;
        if let Some(done) = planner::plan_exhausted(&recipient, steps.len()) {
            self.db.commit(&done)?;
            tracing::info!("🏁 {} finished campaign '{}'", recipient.email, campaign.name);
            return Ok(RecipientOutcome::Exhausted);
        }
        let Some(step) = steps.get(recipient.current_step as usize) else {
            return Ok(RecipientOutcome::Skipped);
        };

        let chosen = recipient
            .variant_label
            .as_deref()
            .and_then(|label| variant::pinned(step, label))
            .or_else(|| variant::pick_variant(step));

        let subject_template = chosen
            .and_then(|v| v.subject_template.as_deref())
            .filter(|t| !t.is_empty())
            .or(step.subject_template.as_deref());
        let body_template = chosen
            .and_then(|v| v.body_template.as_deref())
            .filter(|t| !t.is_empty())
            .or(step.body_template.as_deref());

        let ctx = RenderContext::for_recipient(&recipient, lead.as_ref(), &campaign, step);
        let prepared = planner::advance_at(now, step).and_then(|next_send_at| {
            let subject = render::render(subject_template, &ctx)?;
            let body = render::render(body_template, &ctx)?;
            Ok((next_send_at, subject, body))
        });
        let retry_at = planner::retry_at(now, self.failure_deferral()?)?;

        let mut record = SendRecord {
            provider: self.transport.name().to_string(),
            subject: String::new(),
            body: None,
            variant_label: chosen.map(|v| v.label.clone()),
            attempts: 0,
        };

        let outcome = match prepared {
            Ok((next_send_at, subject, body)) => {
                let message = OutboundMessage::new(recipient.email.as_str(), subject.as_str(), body.as_str());
                let delivery = retry::send_with_retry(
                    self.transport.as_ref(),
                    &message,
                    &self.policy,
                    limiter,
                    deadline,
                )
                .await;
                record.subject = subject;
                record.body = Some(body);
                record.attempts = delivery.attempts;
                match delivery.result {
                    Ok(provider_message_id) => Dispatch::Sent { provider_message_id, next_send_at },
                    Err(e) if !e.is_recipient_scoped() => return Err(e),
                    Err(e) => Dispatch::Failed { error: e.to_string(), retry_at },
                }
            }
            Err(e) if !e.is_recipient_scoped() => return Err(e),
            Err(e) => {
                tracing::warn!("⚠️ Step {} for {} not sendable: {e}", step.sequence_order, recipient.email);
                Dispatch::Failed { error: e.to_string(), retry_at }
            }
        };

        let transition = planner::plan_dispatch(&recipient, step, &record, outcome, now);
        if !self.db.commit(&transition)? {
            tracing::warn!(
                "⚠️ Recipient {} changed mid-pass; state left as is",
                transition.recipient_id()
            );
        }

        Ok(match transition {
            Transition::Advanced { .. } => {
                tracing::info!("📤 Step {} sent to {}", step.sequence_order, recipient.email);
                RecipientOutcome::Sent
            }
            Transition::Deferred { next_send_at, .. } => {
                tracing::info!("⏸️ {} deferred until {next_send_at}", recipient.email);
                RecipientOutcome::Failed
            }
            Transition::Exhausted { .. } => RecipientOutcome::Exhausted,
        })
    }
}

/// Run passes forever on a fixed interval. Errors are logged; the next tick
/// simply tries again.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>, check_interval_secs: u64) {
    tracing::info!(
        "⏰ Scheduler started (pass every {}s, lock '{}')",
        check_interval_secs,
        engine.run_lock().name()
    );

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match engine.run_once().await {
            Ok(PassOutcome::LockUnavailable) => {}
            Ok(PassOutcome::Completed(_)) => {}
            Err(e) => tracing::warn!("⚠️ Send pass failed: {e}"),
        }
    }
}
