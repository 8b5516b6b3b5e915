pub mod event_log;
pub mod user_store;

use crate::common::Result;
use crate::core::matcher::EnrolledUser;
use chrono::{DateTime, Utc};

pub use event_log::{EventLog, VerificationEvent};
pub use user_store::{UserData, UserStore};

/// Source of enrolled users. Order is enrollment order.
pub trait UserRecordProvider: Send + Sync {
    fn list_users(&self) -> Result<Vec<EnrolledUser>>;
}

/// Receives one record per verified identity.
pub trait VerificationSink: Send + Sync {
    fn record_verification(&self, user_id: &str, timestamp: DateTime<Utc>) -> Result<()>;
}
