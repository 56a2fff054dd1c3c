// Aggregates for the admin support dashboard
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::ids::UserId;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TicketTotals {
    pub total: i64,
    pub open: i64,
    pub closed: i64,
    pub today: i64,
    pub week: i64,
    pub month: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageTotals {
    pub from_users: i64,
    pub from_staff: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaffActivity {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub is_admin: bool,
    pub messages: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyMetric {
    pub date: NaiveDate,
    pub created: i64,
    pub closed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupportStats {
    pub tickets: TicketTotals,
    pub messages: MessageTotals,
    /// Mean minutes from ticket creation to the first staff reply, last 7 days
    pub avg_response_minutes: Option<f64>,
    pub staff: Vec<StaffActivity>,
    pub daily: Vec<DailyMetric>,
}

/// Mean of (first staff reply - creation) in minutes
pub fn average_response_minutes(pairs: &[(DateTime<Utc>, DateTime<Utc>)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let total: i64 = pairs
        .iter()
        .map(|(created, answered)| (*answered - *created).num_seconds().max(0))
        .sum();
    Some(total as f64 / pairs.len() as f64 / 60.0)
}

/// Bucket creation and closing times into one row per day, oldest first,
/// covering the `days` days that end at `now`.
pub fn daily_metrics(
    created: &[DateTime<Utc>],
    closed: &[DateTime<Utc>],
    now: DateTime<Utc>,
    days: i64,
) -> Vec<DailyMetric> {
    let today = now.date_naive();
    let mut buckets: BTreeMap<NaiveDate, (i64, i64)> = (0..days)
        .map(|offset| (today - Duration::days(offset), (0, 0)))
        .collect();

    for ts in created {
        if let Some(bucket) = buckets.get_mut(&ts.date_naive()) {
            bucket.0 += 1;
        }
    }
    for ts in closed {
        if let Some(bucket) = buckets.get_mut(&ts.date_naive()) {
            bucket.1 += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(date, (created, closed))| DailyMetric {
            date,
            created,
            closed,
        })
        .collect()
}
