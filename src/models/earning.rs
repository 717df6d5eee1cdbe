use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per completed booking (unique on booking_id — upsert target).
/// Deleted when the booking is cancelled, stamped paid_at by the monthly
/// collection pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderEarning {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub booking_id: Uuid,
    pub service_id: Uuid,
    pub gross_price_da: i64,
    pub commission_da: i64,
    pub net_to_provider_da: i64,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningTotals {
    pub gross_da: i64,
    pub commission_da: i64,
    pub net_da: i64,
}
