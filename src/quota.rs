//! Rolling-window quota over the usage ledger.

use std::fmt;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::config::QuotaSection;
use crate::db::Store;
use crate::error::GatewayError;
use crate::models::UsageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    Daily,
    Burst,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Daily => f.write_str("Daily limit reached"),
            QuotaWindow::Burst => f.write_str("Too many requests, please slow down"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub daily_limit: u64,
    pub daily_window: Duration,
    pub burst_limit: u64,
    pub burst_window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from(&QuotaSection::default())
    }
}

impl From<&QuotaSection> for QuotaPolicy {
    fn from(section: &QuotaSection) -> Self {
        Self {
            daily_limit: section.daily_limit.into(),
            daily_window: Duration::seconds(section.daily_window_secs),
            burst_limit: section.burst_limit.into(),
            burst_window: Duration::seconds(section.burst_window_secs),
        }
    }
}

impl QuotaPolicy {
    /// Check both windows, then charge one usage record.
    ///
    /// The charge happens before inference and is never refunded. Two racing
    /// calls can both pass the count check; small overshoot is accepted.
    pub fn charge(
        &self,
        store: &Store,
        user_id: &str,
        model: &str,
        action: &str,
        now: OffsetDateTime,
    ) -> Result<(), GatewayError> {
        let daily = store.count_usage_since(user_id, now - self.daily_window)?;
        if daily >= self.daily_limit {
            warn!(user = %user_id, count = daily, limit = self.daily_limit, "Daily quota exhausted");
            return Err(GatewayError::QuotaExceeded(QuotaWindow::Daily));
        }

        let burst = store.count_usage_since(user_id, now - self.burst_window)?;
        if burst >= self.burst_limit {
            warn!(user = %user_id, count = burst, limit = self.burst_limit, "Burst quota exhausted");
            return Err(GatewayError::QuotaExceeded(QuotaWindow::Burst));
        }

        store.record_usage(&UsageRecord {
            user_id: user_id.to_string(),
            model: model.to_string(),
            action: action.to_string(),
            created_at: unix_millis(now),
        })?;
        info!(user = %user_id, daily = daily + 1, burst = burst + 1, "Usage charged");
        Ok(())
    }
}

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &Store, user: &str, count: usize, at: OffsetDateTime) {
        for _ in 0..count {
            store
                .record_usage(&UsageRecord {
                    user_id: user.to_string(),
                    model: "gemini-2.5-flash".to_string(),
                    action: "invoice".to_string(),
                    created_at: unix_millis(at),
                })
                .unwrap();
        }
    }

    #[test]
    fn test_fresh_user_is_charged_once() {
        let store = Store::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();

        QuotaPolicy::default()
            .charge(&store, "u1", "gemini-2.5-flash", "invoice", now)
            .unwrap();

        assert_eq!(store.count_usage_since("u1", now - Duration::days(1)).unwrap(), 1);
    }

    #[test]
    fn test_daily_limit_rejects_fifty_first() {
        let store = Store::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        seed(&store, "u1", 50, now - Duration::hours(2));

        let err = QuotaPolicy::default()
            .charge(&store, "u1", "m", "invoice", now)
            .unwrap_err();

        assert!(matches!(err, GatewayError::QuotaExceeded(QuotaWindow::Daily)));
        // rejected calls are not charged
        assert_eq!(store.count_usage_since("u1", now - Duration::days(1)).unwrap(), 50);
    }

    #[test]
    fn test_burst_limit_rejects_eleventh() {
        let store = Store::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        seed(&store, "u1", 10, now - Duration::seconds(5));

        let err = QuotaPolicy::default()
            .charge(&store, "u1", "m", "invoice", now)
            .unwrap_err();

        assert!(matches!(err, GatewayError::QuotaExceeded(QuotaWindow::Burst)));
    }

    #[test]
    fn test_old_records_fall_out_of_windows() {
        let store = Store::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        seed(&store, "u1", 60, now - Duration::hours(25));
        seed(&store, "u1", 10, now - Duration::minutes(5));

        QuotaPolicy::default()
            .charge(&store, "u1", "m", "invoice", now)
            .unwrap();
    }

    #[test]
    fn test_usage_is_per_identity() {
        let store = Store::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        seed(&store, "u1", 50, now - Duration::minutes(30));

        QuotaPolicy::default()
            .charge(&store, "u2", "m", "invoice", now)
            .unwrap();
    }
}
