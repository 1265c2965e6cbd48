//! Free-tier usage accounting helpers.
//!
//! The reserve-or-reject transaction itself lives behind
//! [`crate::store::JobStore::reserve_usage`]; this module owns the month-key
//! convention: `YYYY-MM` in one fixed timezone, so a month boundary means the
//! same instant for every worker.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub fn month_key(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%Y-%m").to_string()
}
