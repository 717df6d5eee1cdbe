use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProviderKind {
    Vet,
    Daycare,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub kind: ProviderKind,
    pub address: Option<String>,
    /// IANA timezone name; falls back to the configured default when unset.
    pub timezone: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Per-provider commission override (DA); config default when NULL.
    pub vet_commission_da: Option<i64>,
    /// Daycare late-fee rate overrides (DA); config defaults when NULL.
    pub daycare_hourly_rate_da: Option<i64>,
    pub daycare_daily_rate_da: Option<i64>,
    pub is_approved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub title: String,
    pub price_da: Option<i64>,
    pub duration_min: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pet {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub species: Option<String>,
}
