//! Monthly database cleanup.
//!
//! A background task sleeps until local midnight on the first of the
//! next month, purges rows older than the retention window, and goes
//! back to sleep. Socket rows are not handled here; they are wiped
//! once at startup because they only describe live connections.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::relay::RelayState;
use crate::storage::RETENTION_DAYS;

/// Local midnight on the first of the month after `now`.
pub fn next_month_start(now: DateTime<Local>) -> DateTime<Local> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Local
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .earliest()
        .unwrap_or_else(|| now + ChronoDuration::days(1))
}

/// Spawn the cleanup task for the lifetime of the process.
pub fn spawn_monthly(state: Arc<RelayState>) {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next = next_month_start(now);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(3600));
            info!("cleanup worker sleeping {}s until {next}", wait.as_secs());
            tokio::time::sleep(wait).await;

            info!("running monthly database cleanup");
            let cutoff = Utc::now().timestamp_millis() - RETENTION_DAYS * 24 * 60 * 60 * 1000;
            match state.db.purge_stale(cutoff) {
                Ok((devices, requests, notifications)) => info!(
                    "cleanup removed {devices} devices, {requests} requests, {notifications} notifications"
                ),
                Err(e) => error!("monthly cleanup failed: {e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn advances_to_first_of_next_month() {
        let now = Local.with_ymd_and_hms(2026, 7, 15, 13, 45, 0).unwrap();
        let next = next_month_start(now);
        assert_eq!((next.year(), next.month(), next.day()), (2026, 8, 1));
        assert_eq!((next.hour(), next.minute(), next.second()), (0, 0, 0));
    }

    #[test]
    fn december_rolls_over_to_january() {
        let now = Local.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let next = next_month_start(now);
        assert_eq!((next.year(), next.month(), next.day()), (2027, 1, 1));
    }

    #[test]
    fn boundary_is_always_in_the_future() {
        let now = Local.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_month_start(now);
        assert!(next > now);
    }
}
