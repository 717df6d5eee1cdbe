use sqlx::PgPool;
use tracing::{info, warn};

use crate::services::bookings::BookingService;

const SWEEP_INTERVAL_SECS: u64 = 3600;

// Advisory lock id for the sweep; only one instance runs it at a time.
const SWEEP_LOCK_CLASS: i32 = 0x5377_6565;
const SWEEP_LOCK_ID: i32 = 1;

/// Spawn the hourly grace sweep. Pass one pushes past, unattested bookings
/// into their grace period; pass two expires bookings whose grace ran out.
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_once(&pool).await {
                warn!("grace sweep failed: {e:#}");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
        }
    });
}

pub async fn run_once(pool: &PgPool) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let mut tx = pool.begin().await?;

    // Skip the cycle instead of queueing behind another instance.
    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1, $2)")
        .bind(SWEEP_LOCK_CLASS)
        .bind(SWEEP_LOCK_ID)
        .fetch_one(&mut *tx)
        .await?;
    if !acquired {
        return Ok(());
    }

    let into_grace = BookingService::sweep_into_grace(&mut *tx, now)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let expired = BookingService::sweep_expire(&mut *tx, now)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    tx.commit().await?;

    if into_grace > 0 || expired > 0 {
        info!("grace sweep: {into_grace} booking(s) into grace, {expired} expired");
    }
    Ok(())
}
