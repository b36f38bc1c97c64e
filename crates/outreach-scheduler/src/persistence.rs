//! SQLite-backed persistence for campaigns, recipients, run records, and
//! message logs. Shared by every scheduler replica; one connection per process.
//!
//! Timestamps the store compares (`next_send_at`, lock expiry) are INTEGER unix
//! milliseconds. Audit timestamps are RFC 3339 text.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    Campaign, DeliveryStatus, Lead, MessageLog, NewMessageLog, Recipient, RunRecord, Step, Variant,
};
use crate::planner::Transition;

/// SQLite-backed store for all scheduler data.
pub struct CampaignDb {
    conn: Mutex<Connection>,
}

pub(crate) fn db_err(context: &str, e: rusqlite::Error) -> OutreachError {
    OutreachError::Database(format!("{context}: {e}"))
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Corrupt stored values surface as conversion errors instead of being replaced.
fn bad_column(idx: usize, kind: Type, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, kind, e.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, Type::Text, e))
}

const RECIPIENT_SELECT: &str = "SELECT id, campaign_id, lead_id, email, current_step, last_sent_at, next_send_at, paused, variant_label FROM campaign_recipients";

const LOG_SELECT: &str = "SELECT id, recipient_id, lead_id, provider, provider_message_id, status, error, subject, body_hash, metadata, sent_at, created_at FROM email_message_logs";

const RUN_SELECT: &str = "SELECT id, run_started_at, run_finished_at, owner_token, sent_count, failed_count FROM scheduler_runs";

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        lead_id: row.get(2)?,
        email: row.get(3)?,
        current_step: row.get(4)?,
        last_sent_at: from_millis(row.get(5)?),
        next_send_at: from_millis(row.get(6)?),
        paused: row.get(7)?,
        variant_label: row.get(8)?,
    })
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<MessageLog> {
    let status: String = row.get(5)?;
    let metadata: String = row.get(9)?;
    let sent_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let status = DeliveryStatus::parse(&status)
        .ok_or_else(|| bad_column(5, Type::Text, format!("unknown delivery status '{status}'")))?;
    let metadata = serde_json::from_str(&metadata).map_err(|e| bad_column(9, Type::Text, e))?;
    Ok(MessageLog {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        lead_id: row.get(2)?,
        provider: row.get(3)?,
        provider_message_id: row.get(4)?,
        status,
        error: row.get(6)?,
        subject: row.get(7)?,
        body_hash: row.get(8)?,
        metadata,
        sent_at: sent_at.as_deref().map(|s| parse_ts(10, s)).transpose()?,
        created_at: parse_ts(11, &created_at)?,
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    let started: String = row.get(1)?;
    let finished: Option<String> = row.get(2)?;
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: parse_ts(1, &started)?,
        finished_at: finished.as_deref().map(|s| parse_ts(2, s)).transpose()?,
        owner_token: row.get(3)?,
        sent_count: row.get(4)?,
        failed_count: row.get(5)?,
    })
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;

        // WAL + busy timeout so replicas sharing the file wait instead of failing
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| db_err("DB pragma", e))?;

        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| db_err("DB pragma", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OutreachError::Database("connection mutex poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                offer TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                email TEXT,
                company TEXT,
                role TEXT,
                industry TEXT,
                location TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS campaign_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                sequence_order INTEGER NOT NULL,
                subject_template TEXT,
                body_template TEXT,
                send_delay_hours INTEGER NOT NULL DEFAULT 24,
                is_follow_up INTEGER NOT NULL DEFAULT 0,
                UNIQUE(campaign_id, sequence_order)
            );

            CREATE TABLE IF NOT EXISTS campaign_step_variants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                step_id INTEGER NOT NULL REFERENCES campaign_steps(id) ON DELETE CASCADE,
                label TEXT NOT NULL DEFAULT 'A',
                subject_template TEXT,
                body_template TEXT,
                weight INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                lead_id INTEGER REFERENCES leads(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                last_sent_at INTEGER,        -- unix ms
                next_send_at INTEGER,        -- unix ms, NULL = not scheduled
                paused INTEGER NOT NULL DEFAULT 0,
                variant_label TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_due
                ON campaign_recipients(paused, next_send_at);

            -- Cooperative run lock, one row per lock name
            CREATE TABLE IF NOT EXISTS scheduler_locks (
                name TEXT PRIMARY KEY,
                owner_token TEXT,
                expires_at INTEGER           -- unix ms
            );

            CREATE TABLE IF NOT EXISTS scheduler_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_started_at TEXT NOT NULL,
                run_finished_at TEXT,
                owner_token TEXT,
                sent_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS email_message_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER REFERENCES campaign_recipients(id) ON DELETE SET NULL,
                lead_id INTEGER REFERENCES leads(id) ON DELETE SET NULL,
                provider TEXT NOT NULL,
                provider_message_id TEXT,
                status TEXT NOT NULL,        -- sent, failed
                error TEXT,
                subject TEXT NOT NULL DEFAULT '',
                body_hash TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                sent_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_recipient ON email_message_logs(recipient_id);
            CREATE INDEX IF NOT EXISTS idx_logs_provider_id ON email_message_logs(provider_message_id);
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Campaigns, leads, steps ─────────────────────────────

    /// Create a campaign, returning its id.
    pub fn create_campaign(&self, name: &str, offer: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO campaigns (name, offer, status) VALUES (?1, ?2, 'active')",
            params![name, offer],
        )
        .map_err(|e| db_err("Create campaign", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete a campaign; steps, variants, and recipients cascade.
    pub fn delete_campaign(&self, id: i64) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM campaigns WHERE id = ?1", [id])
            .map_err(|e| db_err("Delete campaign", e))?;
        Ok(())
    }

    pub fn get_campaign(&self, id: i64) -> Result<Option<Campaign>> {
        self.conn()?
            .query_row(
                "SELECT id, name, offer, status FROM campaigns WHERE id = ?1",
                [id],
                |row| {
                    Ok(Campaign {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        offer: row.get(2)?,
                        status: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get campaign", e))
    }

    pub fn create_lead(&self, lead: &Lead) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO leads (name, email, company, role, industry, location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![lead.name, lead.email, lead.company, lead.role, lead.industry, lead.location],
        )
        .map_err(|e| db_err("Create lead", e))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_lead(&self, id: i64) -> Result<Option<Lead>> {
        self.conn()?
            .query_row(
                "SELECT id, name, email, company, role, industry, location FROM leads WHERE id = ?1",
                [id],
                |row| {
                    Ok(Lead {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        company: row.get(3)?,
                        role: row.get(4)?,
                        industry: row.get(5)?,
                        location: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get lead", e))
    }

    /// Append a step (and its variants) to a campaign's sequence.
    pub fn add_step(&self, campaign_id: i64, step: &Step) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        tx.execute(
            "INSERT INTO campaign_steps
             (campaign_id, sequence_order, subject_template, body_template, send_delay_hours, is_follow_up)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                campaign_id,
                step.sequence_order,
                step.subject_template,
                step.body_template,
                step.send_delay_hours,
                step.is_follow_up,
            ],
        )
        .map_err(|e| db_err("Save step", e))?;
        let step_id = tx.last_insert_rowid();
        for variant in &step.variants {
            tx.execute(
                "INSERT INTO campaign_step_variants (step_id, label, subject_template, body_template, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    step_id,
                    variant.label,
                    variant.subject_template,
                    variant.body_template,
                    variant.weight,
                ],
            )
            .map_err(|e| db_err("Save variant", e))?;
        }
        tx.commit().map_err(|e| db_err("Commit step", e))?;
        Ok(step_id)
    }

    /// Ordered steps of a campaign, variants attached.
    pub fn steps_for_campaign(&self, campaign_id: i64) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, sequence_order, subject_template, body_template, send_delay_hours, is_follow_up
                 FROM campaign_steps WHERE campaign_id = ?1 ORDER BY sequence_order",
            )
            .map_err(|e| db_err("Prepare steps", e))?;
        let mut steps = stmt
            .query_map([campaign_id], |row| {
                Ok(Step {
                    id: row.get(0)?,
                    campaign_id: row.get(1)?,
                    sequence_order: row.get(2)?,
                    subject_template: row.get(3)?,
                    body_template: row.get(4)?,
                    send_delay_hours: row.get(5)?,
                    is_follow_up: row.get(6)?,
                    variants: Vec::new(),
                })
            })
            .map_err(|e| db_err("Load steps", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read step", e))?;

        let mut vstmt = conn
            .prepare(
                "SELECT id, step_id, label, subject_template, body_template, weight
                 FROM campaign_step_variants WHERE step_id = ?1 ORDER BY id",
            )
            .map_err(|e| db_err("Prepare variants", e))?;
        for step in &mut steps {
            step.variants = vstmt
                .query_map([step.id], |row| {
                    Ok(Variant {
                        id: row.get(0)?,
                        step_id: row.get(1)?,
                        label: row.get(2)?,
                        subject_template: row.get(3)?,
                        body_template: row.get(4)?,
                        weight: row.get(5)?,
                    })
                })
                .map_err(|e| db_err("Load variants", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| db_err("Read variant", e))?;
        }
        Ok(steps)
    }

    // ─── Recipients ──────────────────────────────────────────

    /// Enroll an address into a campaign. `start_at = None` leaves it unscheduled.
    pub fn enroll(
        &self,
        campaign_id: i64,
        lead_id: Option<i64>,
        email: &str,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO campaign_recipients (campaign_id, lead_id, email, next_send_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![campaign_id, lead_id, email, start_at.map(to_millis)],
        )
        .map_err(|e| db_err("Enroll recipient", e))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_recipient(&self, id: i64) -> Result<Option<Recipient>> {
        self.conn()?
            .query_row(&format!("{RECIPIENT_SELECT} WHERE id = ?1"), [id], row_to_recipient)
            .optional()
            .map_err(|e| db_err("Get recipient", e))
    }

    /// Unpaused recipients whose `next_send_at` is set and not after `now`.
    pub fn due_recipients(&self, now: DateTime<Utc>) -> Result<Vec<Recipient>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{RECIPIENT_SELECT} WHERE paused = 0 AND next_send_at IS NOT NULL AND next_send_at <= ?1
                 ORDER BY next_send_at, id"
            ))
            .map_err(|e| db_err("Prepare due recipients", e))?;
        stmt.query_map([to_millis(now)], row_to_recipient)
            .map_err(|e| db_err("Load due recipients", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read recipient", e))
    }

    /// Pin (or unpin) the A/B variant a recipient receives.
    pub fn pin_variant(&self, recipient_id: i64, label: Option<&str>) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE campaign_recipients SET variant_label = ?1 WHERE id = ?2",
                params![label, recipient_id],
            )
            .map_err(|e| db_err("Pin variant", e))?;
        Ok(n > 0)
    }

    /// Operator pause/resume. Resuming an unscheduled recipient makes it due at `now`.
    pub fn set_paused(&self, recipient_id: i64, paused: bool, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE campaign_recipients
                 SET paused = ?1,
                     next_send_at = CASE WHEN ?1 = 0 AND next_send_at IS NULL THEN ?2 ELSE next_send_at END
                 WHERE id = ?3",
                params![paused, to_millis(now), recipient_id],
            )
            .map_err(|e| db_err("Set paused", e))?;
        Ok(n > 0)
    }

    /// Apply a planned transition. The recipient update and its log row are
    /// written in one transaction.
    ///
    /// Updates are guarded on the step the plan was made from. Returns `false`
    /// when the recipient row is gone or has moved on; a log row is still kept
    /// (detached from the recipient) so an actual send is never unaudited.
    pub fn commit(&self, transition: &Transition) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;

        let rows = match transition {
            Transition::Exhausted { recipient_id } => tx
                .execute(
                    "UPDATE campaign_recipients SET paused = 1 WHERE id = ?1",
                    [recipient_id],
                )
                .map_err(|e| db_err("Pause recipient", e))?,
            Transition::Advanced {
                recipient_id,
                from_step,
                to_step,
                last_sent_at,
                next_send_at,
                ..
            } => tx
                .execute(
                    "UPDATE campaign_recipients
                     SET current_step = ?1, last_sent_at = ?2, next_send_at = ?3
                     WHERE id = ?4 AND current_step = ?5",
                    params![
                        to_step,
                        to_millis(*last_sent_at),
                        to_millis(*next_send_at),
                        recipient_id,
                        from_step,
                    ],
                )
                .map_err(|e| db_err("Advance recipient", e))?,
            Transition::Deferred {
                recipient_id,
                step,
                last_sent_at,
                next_send_at,
                ..
            } => tx
                .execute(
                    "UPDATE campaign_recipients
                     SET last_sent_at = ?1, next_send_at = ?2
                     WHERE id = ?3 AND current_step = ?4",
                    params![
                        to_millis(*last_sent_at),
                        to_millis(*next_send_at),
                        recipient_id,
                        step,
                    ],
                )
                .map_err(|e| db_err("Defer recipient", e))?,
        };
        let applied = rows > 0;

        if let Some(log) = transition.log() {
            let mut log = log.clone();
            if !applied {
                log.recipient_id = None;
                // The lead may have gone with the recipient
                if let Some(lead_id) = log.lead_id {
                    let exists = tx
                        .query_row("SELECT 1 FROM leads WHERE id = ?1", [lead_id], |_| Ok(()))
                        .optional()
                        .map_err(|e| db_err("Check lead", e))?
                        .is_some();
                    if !exists {
                        log.lead_id = None;
                    }
                }
            }
            insert_log(&tx, &log)?;
        }

        tx.commit().map_err(|e| db_err("Commit transition", e))?;
        Ok(applied)
    }

    // ─── Run records ─────────────────────────────────────────

    pub fn start_run(&self, owner_token: &str, started_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduler_runs (run_started_at, owner_token) VALUES (?1, ?2)",
            params![started_at.to_rfc3339(), owner_token],
        )
        .map_err(|e| db_err("Start run", e))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_run_counts(&self, run_id: i64, sent: u32, failed: u32) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE scheduler_runs SET sent_count = ?1, failed_count = ?2 WHERE id = ?3",
                params![sent, failed, run_id],
            )
            .map_err(|e| db_err("Update run", e))?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        run_id: i64,
        sent: u32,
        failed: u32,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE scheduler_runs SET sent_count = ?1, failed_count = ?2, run_finished_at = ?3
                 WHERE id = ?4",
                params![sent, failed, finished_at.to_rfc3339(), run_id],
            )
            .map_err(|e| db_err("Finish run", e))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn()?
            .query_row(&format!("{RUN_SELECT} WHERE id = ?1"), [run_id], row_to_run)
            .optional()
            .map_err(|e| db_err("Get run", e))
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{RUN_SELECT} ORDER BY id DESC LIMIT ?1"))
            .map_err(|e| db_err("Prepare runs", e))?;
        stmt.query_map([limit as i64], row_to_run)
            .map_err(|e| db_err("Load runs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read run", e))
    }

    // ─── Message logs ────────────────────────────────────────

    /// Most recent log rows first.
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<MessageLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{LOG_SELECT} ORDER BY id DESC LIMIT ?1"))
            .map_err(|e| db_err("Prepare logs", e))?;
        stmt.query_map([limit as i64], row_to_log)
            .map_err(|e| db_err("Load logs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read log", e))
    }

    /// Log rows of one recipient, oldest first.
    pub fn logs_for_recipient(&self, recipient_id: i64) -> Result<Vec<MessageLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{LOG_SELECT} WHERE recipient_id = ?1 ORDER BY id"))
            .map_err(|e| db_err("Prepare logs", e))?;
        stmt.query_map([recipient_id], row_to_log)
            .map_err(|e| db_err("Load logs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Read log", e))
    }
}

fn insert_log(conn: &Connection, log: &NewMessageLog) -> Result<()> {
    conn.execute(
        "INSERT INTO email_message_logs
         (recipient_id, lead_id, provider, provider_message_id, status, error, subject, body_hash,
          metadata, sent_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            log.recipient_id,
            log.lead_id,
            log.provider,
            log.provider_message_id,
            log.status.as_str(),
            log.error,
            log.subject,
            log.body_hash,
            log.metadata.to_string(),
            log.sent_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| db_err("Save message log", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};

    fn seeded() -> (CampaignDb, i64) {
        let db = CampaignDb::open_in_memory().unwrap();
        let campaign = db.create_campaign("Q3 outbound", Some("20% off")).unwrap();
        (db, campaign)
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let db = CampaignDb::open(&dir.path().join("test.db")).unwrap();
        assert!(db.recent_runs(10).unwrap().is_empty());
        assert!(db.due_recipients(Utc::now()).unwrap().is_empty());
        // Re-open runs migrations again without error
        drop(db);
        CampaignDb::open(&dir.path().join("test.db")).unwrap();
    }

    #[test]
    fn test_steps_ordered_with_variants() {
        let (db, campaign) = seeded();
        db.add_step(campaign, &Step::new(2).subject("Follow up")).unwrap();
        db.add_step(
            campaign,
            &Step::new(1)
                .subject("Hello")
                .variant(Variant::new("A", 1).subject("Hi A"))
                .variant(Variant::new("B", 3)),
        )
        .unwrap();

        let steps = db.steps_for_campaign(campaign).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].sequence_order, 1);
        assert_eq!(steps[0].variants.len(), 2);
        assert_eq!(steps[0].variants[1].weight, 3);
        assert_eq!(steps[1].subject_template.as_deref(), Some("Follow up"));
        assert!(steps[1].variants.is_empty());
    }

    #[test]
    fn test_due_recipients_filters() {
        let (db, campaign) = seeded();
        let now = Utc::now();
        let due = db.enroll(campaign, None, "due@example.com", Some(now)).unwrap();
        db.enroll(campaign, None, "later@example.com", Some(now + Duration::hours(1)))
            .unwrap();
        db.enroll(campaign, None, "unscheduled@example.com", None).unwrap();
        let paused = db.enroll(campaign, None, "paused@example.com", Some(now)).unwrap();
        db.set_paused(paused, true, now).unwrap();

        let rows = db.due_recipients(now).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, due);
    }

    #[test]
    fn test_resume_schedules_unscheduled() {
        let (db, campaign) = seeded();
        let now = Utc::now();
        let id = db.enroll(campaign, None, "a@example.com", None).unwrap();
        db.set_paused(id, false, now).unwrap();
        let r = db.get_recipient(id).unwrap().unwrap();
        assert_eq!(r.next_send_at.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
    }

    #[test]
    fn test_campaign_delete_cascades() {
        let (db, campaign) = seeded();
        db.add_step(campaign, &Step::new(1)).unwrap();
        let id = db.enroll(campaign, None, "a@example.com", Some(Utc::now())).unwrap();
        db.delete_campaign(campaign).unwrap();
        assert!(db.get_recipient(id).unwrap().is_none());
        assert!(db.steps_for_campaign(campaign).unwrap().is_empty());
    }

    #[test]
    fn test_run_record_lifecycle() {
        let (db, _) = seeded();
        let started = Utc::now();
        let run = db.start_run("tok-1", started).unwrap();
        db.update_run_counts(run, 2, 1).unwrap();
        let rec = db.get_run(run).unwrap().unwrap();
        assert!(rec.finished_at.is_none());
        assert_eq!((rec.sent_count, rec.failed_count), (2, 1));

        db.finish_run(run, 3, 1, started + Duration::seconds(5)).unwrap();
        let rec = db.get_run(run).unwrap().unwrap();
        assert!(rec.finished_at.is_some());
        assert_eq!(rec.sent_count, 3);
        assert_eq!(rec.owner_token.as_deref(), Some("tok-1"));
    }

    fn sent_log(recipient_id: i64, lead_id: Option<i64>, at: DateTime<Utc>) -> NewMessageLog {
        NewMessageLog {
            recipient_id: Some(recipient_id),
            lead_id,
            provider: "log".into(),
            provider_message_id: Some("pm-1".into()),
            status: DeliveryStatus::Sent,
            error: None,
            subject: "Hello".into(),
            body_hash: None,
            metadata: serde_json::json!({ "attempts": 1 }),
            sent_at: at,
        }
    }

    fn advance(recipient_id: i64, from_step: u32, log: NewMessageLog) -> Transition {
        let at = log.sent_at;
        Transition::Advanced {
            recipient_id,
            from_step,
            to_step: from_step + 1,
            last_sent_at: at,
            next_send_at: at + Duration::hours(24),
            log,
        }
    }

    #[test]
    fn test_stale_commit_keeps_state_and_detaches_log() {
        let (db, campaign) = seeded();
        let now = Utc::now().trunc_subsecs(3);
        let id = db.enroll(campaign, None, "a@example.com", Some(now)).unwrap();

        // Written against step 3 while the row is still at step 0
        let applied = db.commit(&advance(id, 3, sent_log(id, None, now))).unwrap();
        assert!(!applied);

        let r = db.get_recipient(id).unwrap().unwrap();
        assert_eq!(r.current_step, 0);
        assert_eq!(r.next_send_at, Some(now));
        assert!(r.last_sent_at.is_none());

        let logs = db.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].recipient_id.is_none());
        assert_eq!(logs[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_stale_commit_after_lead_removed() {
        let (db, campaign) = seeded();
        let now = Utc::now();
        let lead = db.create_lead(&Lead { name: Some("Ada".into()), ..Default::default() }).unwrap();
        let id = db.enroll(campaign, Some(lead), "ada@example.com", Some(now)).unwrap();
        let transition = advance(id, 0, sent_log(id, Some(lead), now));

        // Lead goes away mid-pass; the recipient cascades with it
        db.conn().unwrap().execute("DELETE FROM leads WHERE id = ?1", [lead]).unwrap();

        assert!(!db.commit(&transition).unwrap());
        let logs = db.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].recipient_id.is_none());
        assert!(logs[0].lead_id.is_none());
    }

    #[test]
    fn test_commit_rolls_back_when_log_insert_fails() {
        let (db, campaign) = seeded();
        let now = Utc::now();
        let id = db.enroll(campaign, None, "a@example.com", Some(now)).unwrap();

        // Unknown lead violates the log's foreign key after the update ran
        let err = db.commit(&advance(id, 0, sent_log(id, Some(9_999), now)));
        assert!(err.is_err());

        let r = db.get_recipient(id).unwrap().unwrap();
        assert_eq!(r.current_step, 0);
        assert!(r.last_sent_at.is_none());
        assert!(db.recent_logs(10).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_rows_are_errors() {
        let (db, campaign) = seeded();
        let now = Utc::now();
        let id = db.enroll(campaign, None, "a@example.com", Some(now)).unwrap();
        db.commit(&advance(id, 0, sent_log(id, None, now))).unwrap();
        assert_eq!(db.recent_logs(10).unwrap().len(), 1);

        db.conn()
            .unwrap()
            .execute("UPDATE email_message_logs SET status = 'bounced'", [])
            .unwrap();
        assert!(db.recent_logs(10).is_err());

        db.conn()
            .unwrap()
            .execute("UPDATE email_message_logs SET status = 'sent', metadata = '{not json'", [])
            .unwrap();
        assert!(db.recent_logs(10).is_err());

        db.conn()
            .unwrap()
            .execute("UPDATE email_message_logs SET metadata = '{}', created_at = 'yesterday'", [])
            .unwrap();
        assert!(db.recent_logs(10).is_err());

        let run = db.start_run("tok-1", now).unwrap();
        db.conn()
            .unwrap()
            .execute("UPDATE scheduler_runs SET run_started_at = 'soon' WHERE id = ?1", [run])
            .unwrap();
        assert!(db.get_run(run).is_err());
        assert!(db.recent_runs(10).is_err());
    }
}
