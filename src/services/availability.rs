use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::availability::{Slot, TimeOff, WeeklyEntry, WeeklyWindow},
};

/// Minimum duration any slot occupies, and the default when a booking's
/// service row is missing.
pub const MIN_SLOT_MINUTES: i64 = 15;
pub const DEFAULT_DURATION_MINUTES: i64 = 30;

/// Everything the engine needs to answer availability questions for one
/// provider over a bounded window, prefetched so the checks themselves are
/// pure. The same context is loaded inside the serializable create
/// transaction for the race-free re-check.
#[derive(Debug, Clone)]
pub struct AvailabilityContext {
    pub tz: Tz,
    /// (weekday 1-7, start_min, end_min) rows of the weekly template.
    pub weekly: Vec<(i16, i32, i32)>,
    /// Absolute exception intervals, UTC.
    pub time_offs: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    /// Slot-holding booking intervals (PENDING/CONFIRMED), UTC, already
    /// expanded to `[scheduled_at, scheduled_at + duration)`.
    pub bookings: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Half-open interval intersection.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

fn ceil_to_step(t: DateTime<Utc>, step_min: i64) -> DateTime<Utc> {
    let step_ms = step_min * 60_000;
    let ms = t.timestamp_millis();
    let ceiled = ms.div_euclid(step_ms) * step_ms + if ms.rem_euclid(step_ms) == 0 { 0 } else { step_ms };
    DateTime::from_timestamp_millis(ceiled).unwrap_or(t)
}

impl AvailabilityContext {
    /// Is `[start, start + duration)` bookable?
    ///
    /// Fail-closed order: time-off overlap first, then the weekly template
    /// in the provider's local time, then slot-holding bookings.
    pub fn slot_is_free(&self, start_utc: DateTime<Utc>, duration_min: i64) -> bool {
        let duration = duration_min.max(MIN_SLOT_MINUTES);
        let end_utc = start_utc + Duration::minutes(duration);

        if self
            .time_offs
            .iter()
            .any(|&(s, e)| overlaps(start_utc, end_utc, s, e))
        {
            return false;
        }

        let local = start_utc.with_timezone(&self.tz);
        let weekday = local.weekday().number_from_monday() as i16; // 1 = Monday .. 7 = Sunday
        let minute_of_day = (local.hour() * 60 + local.minute()) as i64;

        let inside = self
            .weekly
            .iter()
            .filter(|&&(wd, _, _)| wd == weekday)
            .any(|&(_, s, e)| minute_of_day >= s as i64 && minute_of_day + duration <= e as i64);
        if !inside {
            return false;
        }

        !self
            .bookings
            .iter()
            .any(|&(s, e)| overlaps(start_utc, end_utc, s, e))
    }

    /// Enumerate free `{start, end}` slots between `from` and `to`,
    /// candidates ceiling-aligned to `step_min` boundaries.
    pub fn enumerate_slots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step_min: i64,
        duration_min: i64,
    ) -> Vec<Slot> {
        let step = step_min.max(1);
        let duration = duration_min.max(MIN_SLOT_MINUTES);
        let mut out = Vec::new();

        let mut candidate = ceil_to_step(from, step);
        while candidate < to {
            if self.slot_is_free(candidate, duration) {
                out.push(Slot {
                    start: candidate,
                    end: candidate + Duration::minutes(duration),
                });
            }
            candidate += Duration::minutes(step);
        }
        out
    }
}

fn resolve_tz(name: Option<&str>, default_tz: &str) -> Tz {
    name.and_then(|n| n.parse::<Tz>().ok())
        .or_else(|| default_tz.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

/// Load the context for `[from, to)`. Bookings are fetched with a ±12h
/// margin around the window: an individual appointment's duration is
/// bounded, so nothing scheduled further out can overlap it.
pub async fn load_context(
    conn: &mut PgConnection,
    provider_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    default_tz: &str,
) -> ApiResult<AvailabilityContext> {
    let tz_name: Option<Option<String>> =
        sqlx::query_scalar("SELECT timezone FROM provider_profiles WHERE id = $1")
            .bind(provider_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(tz_name) = tz_name else {
        return Err(ApiError::NotFound("Prestataire"));
    };

    let weekly: Vec<(i16, i32, i32)> = sqlx::query_as(
        "SELECT weekday, start_min, end_min FROM provider_availability
         WHERE provider_id = $1
         ORDER BY weekday, start_min",
    )
    .bind(provider_id)
    .fetch_all(&mut *conn)
    .await?;

    let time_offs: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT starts_at, ends_at FROM provider_time_offs
         WHERE provider_id = $1 AND starts_at < $2 AND ends_at > $3",
    )
    .bind(provider_id)
    .bind(to)
    .bind(from)
    .fetch_all(&mut *conn)
    .await?;

    let margin = Duration::hours(12);
    let raw: Vec<(DateTime<Utc>, Option<i32>)> = sqlx::query_as(
        "SELECT b.scheduled_at, s.duration_min
         FROM bookings b
         LEFT JOIN services s ON s.id = b.service_id
         WHERE b.provider_id = $1
           AND b.status IN ('PENDING', 'CONFIRMED')
           AND b.scheduled_at >= $2 AND b.scheduled_at <= $3",
    )
    .bind(provider_id)
    .bind(from - margin)
    .bind(to + margin)
    .fetch_all(&mut *conn)
    .await?;

    let bookings = raw
        .into_iter()
        .map(|(start, dur)| {
            let dur = (dur.map(i64::from).unwrap_or(DEFAULT_DURATION_MINUTES)).max(MIN_SLOT_MINUTES);
            (start, start + Duration::minutes(dur))
        })
        .collect();

    Ok(AvailabilityContext {
        tz: resolve_tz(tz_name.as_deref(), default_tz),
        weekly,
        time_offs,
        bookings,
    })
}

/// One-shot check against a connection (used both from the pool and from
/// inside the booking-creation transaction).
pub async fn is_slot_free(
    conn: &mut PgConnection,
    provider_id: Uuid,
    start_utc: DateTime<Utc>,
    duration_min: i64,
    default_tz: &str,
) -> ApiResult<bool> {
    let duration = duration_min.max(MIN_SLOT_MINUTES);
    let end = start_utc + Duration::minutes(duration);
    let ctx = load_context(conn, provider_id, start_utc, end, default_tz).await?;
    Ok(ctx.slot_is_free(start_utc, duration))
}

// ==================== provider schedule management ====================

pub struct AvailabilityService;

impl AvailabilityService {
    async fn provider_id_for_user(pool: &PgPool, user_id: Uuid) -> ApiResult<Uuid> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM provider_profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
        id.ok_or(ApiError::NotFound("Profil prestataire"))
    }

    pub async fn list_weekly(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<WeeklyWindow>> {
        let provider_id = Self::provider_id_for_user(pool, user_id).await?;
        let rows = sqlx::query_as::<_, WeeklyWindow>(
            "SELECT * FROM provider_availability
             WHERE provider_id = $1
             ORDER BY weekday, start_min",
        )
        .bind(provider_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Replace the weekly template wholesale, validating every entry first.
    pub async fn set_weekly(
        pool: &PgPool,
        user_id: Uuid,
        entries: &[WeeklyEntry],
        timezone: Option<&str>,
    ) -> ApiResult<usize> {
        let provider_id = Self::provider_id_for_user(pool, user_id).await?;

        for e in entries {
            if !(1..=7).contains(&e.weekday) {
                return Err(ApiError::invalid("weekday doit être entre 1 et 7"));
            }
            if e.start_min < 0 || e.end_min > 24 * 60 || e.end_min <= e.start_min {
                return Err(ApiError::invalid("intervalle invalide"));
            }
        }
        if let Some(tz) = timezone {
            if tz.parse::<Tz>().is_err() {
                return Err(ApiError::invalid(format!("fuseau horaire inconnu : {tz}")));
            }
        }

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM provider_availability WHERE provider_id = $1")
            .bind(provider_id)
            .execute(&mut *tx)
            .await?;
        for e in entries {
            sqlx::query(
                "INSERT INTO provider_availability (provider_id, weekday, start_min, end_min)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(provider_id)
            .bind(e.weekday)
            .bind(e.start_min)
            .bind(e.end_min)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(tz) = timezone {
            sqlx::query("UPDATE provider_profiles SET timezone = $1 WHERE id = $2")
                .bind(tz)
                .bind(provider_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(entries.len())
    }

    pub async fn add_time_off(
        pool: &PgPool,
        user_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> ApiResult<TimeOff> {
        let provider_id = Self::provider_id_for_user(pool, user_id).await?;
        if ends_at <= starts_at {
            return Err(ApiError::invalid("ends_at doit être après starts_at"));
        }
        let row = sqlx::query_as::<_, TimeOff>(
            "INSERT INTO provider_time_offs (provider_id, starts_at, ends_at, reason)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(provider_id)
        .bind(starts_at)
        .bind(ends_at)
        .bind(reason.map(str::trim).filter(|s| !s.is_empty()))
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn list_time_offs(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<TimeOff>> {
        let provider_id = Self::provider_id_for_user(pool, user_id).await?;
        let rows = sqlx::query_as::<_, TimeOff>(
            "SELECT * FROM provider_time_offs WHERE provider_id = $1 ORDER BY starts_at DESC",
        )
        .bind(provider_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_time_off(pool: &PgPool, user_id: Uuid, id: Uuid) -> ApiResult<()> {
        let provider_id = Self::provider_id_for_user(pool, user_id).await?;
        let res = sqlx::query(
            "DELETE FROM provider_time_offs WHERE id = $1 AND provider_id = $2",
        )
        .bind(id)
        .bind(provider_id)
        .execute(pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(ApiError::NotFound("Indisponibilité"));
        }
        Ok(())
    }

    /// Public slot enumeration for a provider's booking page.
    pub async fn public_slots(
        pool: &PgPool,
        provider_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step_min: i64,
        duration_min: Option<i64>,
        default_tz: &str,
    ) -> ApiResult<Vec<Slot>> {
        if from >= to {
            return Err(ApiError::invalid("from doit précéder to"));
        }
        let step = step_min.clamp(5, 24 * 60);
        let duration = duration_min.unwrap_or(step).max(MIN_SLOT_MINUTES);

        let mut conn = pool.acquire().await?;
        let ctx = load_context(&mut conn, provider_id, from, to, default_tz).await?;
        Ok(ctx.enumerate_slots(from, to, step, duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    /// Monday 09:00–17:00 local (Africa/Algiers = UTC+1), nothing else.
    fn monday_ctx() -> AvailabilityContext {
        AvailabilityContext {
            tz: "Africa/Algiers".parse().unwrap(),
            weekly: vec![(1, 9 * 60, 17 * 60)],
            time_offs: vec![],
            bookings: vec![],
        }
    }

    #[test]
    fn slot_duration_is_independent_of_step() {
        let ctx = monday_ctx();
        // 15-min visits offered on hourly boundaries keep their own length.
        let slots = ctx.enumerate_slots(utc(2025, 3, 3, 8, 0), utc(2025, 3, 3, 11, 0), 60, 15);
        assert!(!slots.is_empty());
        for slot in &slots {
            assert_eq!(slot.end - slot.start, Duration::minutes(15));
        }
    }

    #[test]
    fn overlap_is_half_open() {
        let a = utc(2025, 3, 3, 10, 0);
        let b = utc(2025, 3, 3, 10, 30);
        let c = utc(2025, 3, 3, 11, 0);
        assert!(!overlaps(a, b, b, c)); // touching intervals do not overlap
        assert!(overlaps(a, c, b, c));
    }

    #[test]
    fn slot_fits_inside_weekly_window() {
        let ctx = monday_ctx();
        // 2025-03-03 is a Monday. 10:00 local = 09:00 UTC.
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 9, 0), 30));
        // Sunday is closed.
        assert!(!ctx.slot_is_free(utc(2025, 3, 2, 9, 0), 30));
    }

    #[test]
    fn slot_ending_past_window_is_rejected() {
        let ctx = monday_ctx();
        // 16:45 local = 15:45 UTC; a 30-min service would end 17:15 local.
        let start = utc(2025, 3, 3, 15, 45);
        assert!(!ctx.slot_is_free(start, 30));
        // A 15-min service ends exactly at 17:00 and is accepted.
        assert!(ctx.slot_is_free(start, 15));
    }

    #[test]
    fn duration_clamped_to_fifteen_minutes() {
        let ctx = monday_ctx();
        // Even a "5-minute" request occupies 15 minutes: starting at 16:50
        // local would end 17:05, past the window.
        assert!(!ctx.slot_is_free(utc(2025, 3, 3, 15, 50), 5));
    }

    #[test]
    fn time_off_fails_closed() {
        let mut ctx = monday_ctx();
        ctx.time_offs = vec![(utc(2025, 3, 3, 9, 0), utc(2025, 3, 3, 12, 0))];
        assert!(!ctx.slot_is_free(utc(2025, 3, 3, 10, 0), 30));
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 12, 0), 30)); // half-open: free at the boundary
    }

    #[test]
    fn existing_booking_blocks_overlap() {
        let mut ctx = monday_ctx();
        ctx.bookings = vec![(utc(2025, 3, 3, 10, 0), utc(2025, 3, 3, 10, 30))];
        assert!(!ctx.slot_is_free(utc(2025, 3, 3, 10, 15), 30));
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 10, 30), 30));
    }

    #[test]
    fn multiple_windows_union() {
        let mut ctx = monday_ctx();
        ctx.weekly = vec![(1, 9 * 60, 12 * 60), (1, 14 * 60, 17 * 60)];
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 9, 0), 30)); // 10:00 local
        assert!(!ctx.slot_is_free(utc(2025, 3, 3, 12, 0), 30)); // 13:00 local, lunch gap
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 13, 30), 30)); // 14:30 local
    }

    #[test]
    fn enumerate_aligns_to_step_and_skips_busy() {
        let mut ctx = monday_ctx();
        ctx.bookings = vec![(utc(2025, 3, 3, 9, 0), utc(2025, 3, 3, 9, 30))];
        // 08:10 UTC from-bound ceils to 08:30 UTC (09:30 local).
        let slots = ctx.enumerate_slots(utc(2025, 3, 3, 8, 10), utc(2025, 3, 3, 10, 0), 30, 30);
        let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![utc(2025, 3, 3, 8, 30), utc(2025, 3, 3, 9, 30)]
        );
        assert_eq!(slots[0].end, utc(2025, 3, 3, 9, 0));
    }

    #[test]
    fn weekday_follows_provider_timezone() {
        // 23:30 Sunday UTC is already 00:30 Monday in Algiers — but outside
        // the 09:00 window, so still rejected; 08:30 Monday UTC is 09:30 local.
        let ctx = monday_ctx();
        assert!(!ctx.slot_is_free(utc(2025, 3, 2, 23, 30), 30));
        assert!(ctx.slot_is_free(utc(2025, 3, 3, 8, 30), 30));
    }
}
