use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::earning::{EarningTotals, ProviderEarning},
};

// Advisory lock namespace for the monthly collection pass.
const COLLECT_LOCK_CLASS: i32 = 0x4561_726e;

/// Per-provider commission override wins; the platform default applies
/// otherwise. Commission never exceeds the gross price.
pub fn resolve_commission(provider_override: Option<i64>, default_da: i64, gross_da: i64) -> i64 {
    provider_override.unwrap_or(default_da).clamp(0, gross_da.max(0))
}

pub fn net_to_provider(gross_da: i64, commission_da: i64) -> i64 {
    (gross_da - commission_da).max(0)
}

pub struct EarningsService;

impl EarningsService {
    /// Ledger write on booking completion. Keyed on booking_id so replays
    /// of the completion handler overwrite instead of duplicating.
    pub async fn upsert_for_completion(
        pool: &PgPool,
        provider_id: Uuid,
        booking_id: Uuid,
        service_id: Uuid,
        gross_da: i64,
        commission_da: i64,
    ) -> ApiResult<()> {
        let net = net_to_provider(gross_da, commission_da);
        sqlx::query(
            "INSERT INTO provider_earnings
                 (id, provider_id, booking_id, service_id,
                  gross_price_da, commission_da, net_to_provider_da, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
             ON CONFLICT (booking_id) DO UPDATE SET
                 gross_price_da = EXCLUDED.gross_price_da,
                 commission_da = EXCLUDED.commission_da,
                 net_to_provider_da = EXCLUDED.net_to_provider_da",
        )
        .bind(Uuid::new_v4())
        .bind(provider_id)
        .bind(booking_id)
        .bind(service_id)
        .bind(gross_da)
        .bind(commission_da)
        .bind(net)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// A cancelled booking earns nothing; drop its ledger row if present.
    pub async fn delete_for_booking(pool: &PgPool, booking_id: Uuid) -> ApiResult<()> {
        sqlx::query("DELETE FROM provider_earnings WHERE booking_id = $1")
            .bind(booking_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn my_earnings(pool: &PgPool, provider_id: Uuid) -> ApiResult<Value> {
        let rows = sqlx::query_as::<_, ProviderEarning>(
            "SELECT * FROM provider_earnings
             WHERE provider_id = $1
             ORDER BY created_at DESC",
        )
        .bind(provider_id)
        .fetch_all(pool)
        .await?;

        let totals = EarningTotals {
            gross_da: rows.iter().map(|r| r.gross_price_da).sum(),
            commission_da: rows.iter().map(|r| r.commission_da).sum(),
            net_da: rows.iter().map(|r| r.net_to_provider_da).sum(),
        };
        let pending_da: i64 = rows
            .iter()
            .filter(|r| r.paid_at.is_none())
            .map(|r| r.net_to_provider_da)
            .sum();

        Ok(json!({
            "earnings": rows,
            "totals": totals,
            "pending_da": pending_da,
        }))
    }

    /// Admin pass stamping every unpaid row of the given month as collected.
    /// paid_at is pinned mid-month so rows sort stably regardless of when
    /// the admin runs the pass. Advisory-locked: concurrent runs for the
    /// same month serialize instead of double-stamping.
    pub async fn collect_month(pool: &PgPool, year: i32, month: u32) -> ApiResult<u64> {
        let (start, end, paid_stamp) = month_bounds(year, month)?;

        let mut tx = pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(COLLECT_LOCK_CLASS)
            .bind(year * 100 + month as i32)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE provider_earnings SET paid_at = $1
             WHERE paid_at IS NULL AND created_at >= $2 AND created_at < $3",
        )
        .bind(paid_stamp)
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            "collected {} earning row(s) for {year}-{month:02}",
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Reverses a collection pass run by mistake.
    pub async fn uncollect_month(pool: &PgPool, year: i32, month: u32) -> ApiResult<u64> {
        let (start, end, _) = month_bounds(year, month)?;

        let mut tx = pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(COLLECT_LOCK_CLASS)
            .bind(year * 100 + month as i32)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE provider_earnings SET paid_at = NULL
             WHERE paid_at IS NOT NULL AND created_at >= $1 AND created_at < $2",
        )
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

fn month_bounds(
    year: i32,
    month: u32,
) -> ApiResult<(
    chrono::DateTime<Utc>,
    chrono::DateTime<Utc>,
    chrono::DateTime<Utc>,
)> {
    if !(1..=12).contains(&month) {
        return Err(ApiError::invalid("Mois invalide"));
    }
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| ApiError::invalid("Mois invalide"))?;
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let end = Utc
        .with_ymd_and_hms(ny, nm, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| ApiError::invalid("Mois invalide"))?;
    let paid_stamp = Utc
        .with_ymd_and_hms(year, month, 15, 12, 0, 0)
        .single()
        .ok_or_else(|| ApiError::invalid("Mois invalide"))?;
    Ok((start, end, paid_stamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_default() {
        assert_eq!(resolve_commission(Some(250), 100, 3000), 250);
        assert_eq!(resolve_commission(None, 100, 3000), 100);
    }

    #[test]
    fn commission_never_exceeds_gross() {
        assert_eq!(resolve_commission(Some(500), 100, 300), 300);
        assert_eq!(resolve_commission(None, 100, 50), 50);
        assert_eq!(resolve_commission(None, 100, 0), 0);
    }

    #[test]
    fn net_never_goes_negative() {
        assert_eq!(net_to_provider(3000, 100), 2900);
        assert_eq!(net_to_provider(50, 100), 0);
    }

    #[test]
    fn month_bounds_cover_december_rollover() {
        let (start, end, stamp) = month_bounds(2025, 12).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(stamp, Utc.with_ymd_and_hms(2025, 12, 15, 12, 0, 0).unwrap());
        assert!(month_bounds(2025, 13).is_err());
    }
}
