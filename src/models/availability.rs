use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row of the weekly template: weekday 1 (Monday) .. 7 (Sunday),
/// minutes since local midnight. Multiple rows per weekday are allowed;
/// the engine treats them as a union.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WeeklyWindow {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub weekday: i16,
    pub start_min: i32,
    pub end_min: i32,
}

/// Absolute-time exception interval overriding the weekly template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimeOff {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A bookable `[start, end)` interval, both ends UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// -------- request bodies --------

#[derive(Debug, Deserialize)]
pub struct WeeklyEntry {
    pub weekday: i16,
    pub start_min: i32,
    pub end_min: i32,
}

#[derive(Debug, Deserialize)]
pub struct SetWeeklyRequest {
    pub entries: Vec<WeeklyEntry>,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddTimeOffRequest {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub step_min: Option<i64>,
    pub duration_min: Option<i64>,
}
