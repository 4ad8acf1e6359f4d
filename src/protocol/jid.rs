//! Job identifiers.
//!
//! A job id is the UTC dispatch time rendered as `YYYYMMDDhhmmssffffff`
//! (20 digits, microsecond precision). Ids from one [`JidGenerator`] are
//! strictly increasing even when the clock stalls or steps backwards.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const JID_FORMAT: &str = "%Y%m%d%H%M%S%6f";
const JID_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format(JID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dispatch time embedded in the id, if the id uses the timestamp format.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let digits = self.0.get(..JID_LEN)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (secs, micros) = digits.split_at(14);
        let naive = NaiveDateTime::parse_from_str(secs, "%Y%m%d%H%M%S").ok()?;
        let micros: i64 = micros.parse().ok()?;
        Some(naive.and_utc() + TimeDelta::microseconds(micros))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hands out strictly increasing job ids.
#[derive(Debug, Default)]
pub struct JidGenerator {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl JidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: DateTime<Utc>) -> JobId {
        let now = truncate_to_micros(now);
        let mut last = self.last.lock();
        let ts = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(ts);
        JobId::from_timestamp(ts)
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let extra = ts.timestamp_subsec_nanos() % 1_000;
    ts - TimeDelta::nanoseconds(i64::from(extra))
}
