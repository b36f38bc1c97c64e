//! Cooperative run lock stored in `scheduler_locks`.
//!
//! A lock is held while its owner token is set and its expiry lies in the
//! future. There is no heartbeat and no explicit unlock on the normal path:
//! the holder simply lets the lease run out. An expired lock can be taken by
//! any caller.
//!
//! Known race: a holder that stalls past its lease can have the lock taken by
//! another replica while it is still mid-pass. Both then believe they hold it
//! until the stalled one finishes. Keep the lease well above a pass's runtime
//! (or set a pass deadline below it).

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::time::Duration;

use crate::persistence::{CampaignDb, db_err, from_millis, to_millis};

/// A successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockLease {
    pub name: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Raw lock row.
#[derive(Debug, Clone, Serialize)]
pub struct LockState {
    pub name: String,
    pub owner_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.owner_token.is_some() && self.expires_at.is_some_and(|at| at > now)
    }
}

/// Named lock with a fixed lease duration.
#[derive(Debug, Clone)]
pub struct RunLock {
    name: String,
    lease: Duration,
}

impl RunLock {
    pub fn new(name: &str, lease: Duration) -> Self {
        Self {
            name: name.to_string(),
            lease,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take the lock at `now`. `Ok(None)` means another replica holds it.
    ///
    /// One upsert statement: a missing row is inserted, an existing row is only
    /// overwritten when free or expired. One affected row means we own it.
    pub fn acquire(&self, db: &CampaignDb, now: DateTime<Utc>) -> Result<Option<LockLease>> {
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| OutreachError::Config(format!("Lock lease out of range: {e}")))?;
        let expires_at = now
            .checked_add_signed(lease)
            .ok_or_else(|| OutreachError::Config(format!("Lock lease of {}s runs past the calendar", lease.num_seconds())))?;
        let token = uuid::Uuid::new_v4().to_string();

        let changed = db
            .conn()?
            .execute(
                "INSERT INTO scheduler_locks (name, owner_token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE
                 SET owner_token = excluded.owner_token, expires_at = excluded.expires_at
                 WHERE scheduler_locks.owner_token IS NULL
                    OR scheduler_locks.expires_at IS NULL
                    OR scheduler_locks.expires_at <= ?4",
                params![self.name, token, to_millis(expires_at), to_millis(now)],
            )
            .map_err(|e| db_err("Acquire lock", e))?;

        if changed == 1 {
            tracing::debug!("🔒 Lock '{}' acquired by {token} until {expires_at}", self.name);
            Ok(Some(LockLease {
                name: self.name.clone(),
                owner_token: token,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Administrative override: clear owner and expiry so the next caller wins.
    pub fn force_release(&self, db: &CampaignDb) -> Result<bool> {
        let changed = db
            .conn()?
            .execute(
                "UPDATE scheduler_locks SET owner_token = NULL, expires_at = NULL WHERE name = ?1",
                [&self.name],
            )
            .map_err(|e| db_err("Release lock", e))?;
        if changed > 0 {
            tracing::warn!("🔓 Lock '{}' force-released", self.name);
        }
        Ok(changed > 0)
    }

    /// Current row, if the lock was ever attempted.
    pub fn inspect(&self, db: &CampaignDb) -> Result<Option<LockState>> {
        db.conn()?
            .query_row(
                "SELECT name, owner_token, expires_at FROM scheduler_locks WHERE name = ?1",
                [&self.name],
                |row| {
                    Ok(LockState {
                        name: row.get(0)?,
                        owner_token: row.get(1)?,
                        expires_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Inspect lock", e))
    }
}
