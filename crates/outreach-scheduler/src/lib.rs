//! # Outreach Scheduler
//!
//! Campaign send scheduler: periodically sends the next step of each due
//! recipient's email sequence, safely across several replicas.
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (tokio interval)
//!   └── SchedulerEngine::run_once
//!         ├── RunLock::acquire        (one SQL upsert, lease + steal)
//!         ├── CampaignDb::start_run
//!         ├── for each due recipient
//!         │     ├── variant::pick_variant / pinned label
//!         │     ├── render::render    (subject + body)
//!         │     ├── retry::send_with_retry → dyn Transport
//!         │     ├── planner::plan_dispatch
//!         │     └── CampaignDb::commit (recipient update + message log)
//!         └── CampaignDb::finish_run
//! ```
//!
//! All state lives in one SQLite file shared by every replica.

pub mod engine;
pub mod lock;
pub mod models;
pub mod persistence;
pub mod planner;
pub mod render;
pub mod retry;
pub mod variant;

pub use engine::{PassOutcome, PassReport, SchedulerEngine, spawn_scheduler};
pub use lock::{LockLease, LockState, RunLock};
pub use models::{
    Campaign, DeliveryStatus, Lead, MessageLog, NewMessageLog, Recipient, RunRecord, Step,
    Variant,
};
pub use persistence::CampaignDb;
