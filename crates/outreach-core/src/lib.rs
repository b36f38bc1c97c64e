//! # Outreach Core
//!
//! Configuration, error types, and the transport contract shared by the
//! scheduler and channel crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::OutreachConfig;
pub use error::{OutreachError, Result};
pub use traits::Transport;
pub use types::OutboundMessage;
