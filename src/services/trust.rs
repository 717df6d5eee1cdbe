use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::{booking::ConfirmationMethod, user::TrustStatus},
};

/// Escalating restriction durations in days: 1st no-show 3d, 2nd 7d,
/// 3rd 14d, 4th and beyond 30d.
pub const RESTRICTION_DURATIONS: [i64; 4] = [3, 7, 14, 30];

/// Hours-to-appointment below which a NEW user's cancellation counts as a
/// no-show rather than a plain cancellation.
pub const VET_LATE_CANCEL_HOURS: i64 = 12;
pub const DAYCARE_LATE_CANCEL_HOURS: i64 = 24;

pub fn restriction_days(no_show_count: i32) -> i64 {
    let index = ((no_show_count - 1).max(0) as usize).min(RESTRICTION_DURATIONS.len() - 1);
    RESTRICTION_DURATIONS[index]
}

/// Late-cancellation heuristic. VERIFIED users cancel freely; NEW users
/// cancelling inside the threshold are treated as no-shows.
pub fn cancellation_is_no_show(
    trust: TrustStatus,
    starts_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_hours: i64,
) -> bool {
    if trust != TrustStatus::New {
        return false;
    }
    starts_at - now < Duration::hours(threshold_hours)
}

/// NEW → VERIFIED is earned through the confirmation protocol only. A
/// provider completing a booking unilaterally proves nothing about the
/// client having shown up, so it never promotes.
pub fn completion_verifies_client(attestation: Option<ConfirmationMethod>) -> bool {
    attestation.is_some()
}

#[derive(Debug, sqlx::FromRow)]
struct TrustRow {
    trust_status: TrustStatus,
    restricted_until: Option<DateTime<Utc>>,
    is_banned: bool,
    suspended_until: Option<DateTime<Utc>>,
    last_modified_booking: Option<Uuid>,
}

pub struct TrustService;

impl TrustService {
    async fn load(pool: &PgPool, user_id: Uuid) -> ApiResult<TrustRow> {
        let row = sqlx::query_as::<_, TrustRow>(
            "SELECT trust_status, restricted_until, is_banned, suspended_until,
                    last_modified_booking
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
        row.ok_or(ApiError::NotFound("Utilisateur"))
    }

    /// Admission gate consulted before any booking creation. Checks run in
    /// strict order: ban, suspension, restriction, NEW single-active rule.
    /// Expired suspensions and restrictions are cleared as a side effect.
    pub async fn check_can_book(pool: &PgPool, user_id: Uuid) -> ApiResult<()> {
        let row = Self::load(pool, user_id).await?;
        let now = Utc::now();

        if row.is_banned {
            return Err(ApiError::forbidden(
                "Votre compte a été banni. Veuillez contacter le support.",
            ));
        }

        if let Some(until) = row.suspended_until {
            if until > now {
                let days = (until - now).num_days() + 1;
                return Err(ApiError::forbidden(format!(
                    "Votre compte est suspendu encore {days} jour(s)."
                )));
            }
            // Expired suspension is lifted lazily.
            sqlx::query("UPDATE users SET suspended_until = NULL WHERE id = $1")
                .bind(user_id)
                .execute(pool)
                .await?;
        }

        let mut trust = row.trust_status;
        if trust == TrustStatus::Restricted {
            match row.restricted_until {
                Some(until) if until <= now => {
                    // Restriction served: demote to NEW for a fresh trial run.
                    sqlx::query(
                        "UPDATE users SET trust_status = 'NEW', restricted_until = NULL
                         WHERE id = $1",
                    )
                    .bind(user_id)
                    .execute(pool)
                    .await?;
                    trust = TrustStatus::New;
                }
                until => {
                    let days = until.map(|u| (u - now).num_days() + 1).unwrap_or(0);
                    return Err(ApiError::forbidden(format!(
                        "Votre compte est restreint encore {days} jour(s) suite à des \
                         annulations tardives ou absences répétées."
                    )));
                }
            }
        }

        if trust == TrustStatus::New {
            // One active future booking at a time, across vet AND daycare
            // pools: a new client must honour the current appointment first.
            let has_active: bool = sqlx::query_scalar(
                "SELECT EXISTS(
                    SELECT 1 FROM bookings
                    WHERE user_id = $1 AND scheduled_at >= $2
                      AND status IN ('PENDING', 'CONFIRMED',
                                     'AWAITING_CONFIRMATION', 'PENDING_PRO_VALIDATION')
                 ) OR EXISTS(
                    SELECT 1 FROM daycare_bookings
                    WHERE user_id = $1 AND end_date >= $2
                      AND status IN ('PENDING', 'CONFIRMED', 'PENDING_DROP_VALIDATION',
                                     'IN_PROGRESS', 'PENDING_PICKUP_VALIDATION')
                 )",
            )
            .bind(user_id)
            .bind(now)
            .fetch_one(pool)
            .await?;

            if has_active {
                return Err(ApiError::forbidden(
                    "En tant que nouveau client, veuillez d'abord honorer votre réservation en cours.",
                ));
            }
        }

        Ok(())
    }

    /// Increment the no-show counter and restrict the account for the
    /// escalating duration.
    pub async fn apply_no_show_penalty(pool: &PgPool, user_id: Uuid) -> ApiResult<()> {
        let count: Option<i32> = sqlx::query_scalar("SELECT no_show_count FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        let Some(count) = count else { return Ok(()) };

        let new_count = count + 1;
        let until = Utc::now() + Duration::days(restriction_days(new_count));
        sqlx::query(
            "UPDATE users
             SET no_show_count = $1, trust_status = 'RESTRICTED', restricted_until = $2
             WHERE id = $3",
        )
        .bind(new_count)
        .bind(until)
        .bind(user_id)
        .execute(pool)
        .await?;

        tracing::info!("no-show penalty applied to user {user_id}: count={new_count}, until={until}");
        Ok(())
    }

    /// NEW → VERIFIED after the first attestation-confirmed completion.
    /// The WHERE clause keeps the promotion idempotent under at-least-once
    /// delivery of completion events.
    pub async fn verify_user_if_needed(pool: &PgPool, user_id: Uuid) -> ApiResult<()> {
        sqlx::query(
            "UPDATE users
             SET trust_status = 'VERIFIED', verified_at = $1, no_show_count = 0
             WHERE id = $2 AND trust_status = 'NEW'",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// NEW users may reschedule each booking once in its lifetime.
    pub async fn check_can_reschedule(
        pool: &PgPool,
        user_id: Uuid,
        booking_id: Uuid,
    ) -> ApiResult<()> {
        let row = Self::load(pool, user_id).await?;
        if row.trust_status == TrustStatus::New && row.last_modified_booking == Some(booking_id) {
            return Err(ApiError::forbidden(
                "En tant que nouveau client, vous ne pouvez reporter cette réservation qu'une seule fois.",
            ));
        }
        Ok(())
    }

    /// Record the one reschedule a NEW user spent on this booking.
    pub async fn record_reschedule(pool: &PgPool, user_id: Uuid, booking_id: Uuid) -> ApiResult<()> {
        sqlx::query(
            "UPDATE users SET last_modified_booking = $1
             WHERE id = $2 AND trust_status = 'NEW'",
        )
        .bind(booking_id)
        .bind(user_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn trust_status(pool: &PgPool, user_id: Uuid) -> ApiResult<TrustStatus> {
        let status: Option<TrustStatus> =
            sqlx::query_scalar("SELECT trust_status FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
        status.ok_or(ApiError::NotFound("Utilisateur"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn restriction_escalates_and_caps() {
        assert_eq!(restriction_days(1), 3);
        assert_eq!(restriction_days(2), 7);
        assert_eq!(restriction_days(3), 14);
        assert_eq!(restriction_days(4), 30);
        assert_eq!(restriction_days(5), 30);
        assert_eq!(restriction_days(12), 30);
    }

    #[test]
    fn late_cancel_counts_as_no_show_for_new_users_only() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let in_six_hours = now + Duration::hours(6);
        let in_two_days = now + Duration::hours(48);

        assert!(cancellation_is_no_show(
            TrustStatus::New,
            in_six_hours,
            now,
            VET_LATE_CANCEL_HOURS
        ));
        assert!(!cancellation_is_no_show(
            TrustStatus::New,
            in_two_days,
            now,
            VET_LATE_CANCEL_HOURS
        ));
        assert!(!cancellation_is_no_show(
            TrustStatus::Verified,
            in_six_hours,
            now,
            VET_LATE_CANCEL_HOURS
        ));
    }

    #[test]
    fn daycare_threshold_is_wider() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let in_eighteen_hours = now + Duration::hours(18);
        assert!(!cancellation_is_no_show(
            TrustStatus::New,
            in_eighteen_hours,
            now,
            VET_LATE_CANCEL_HOURS
        ));
        assert!(cancellation_is_no_show(
            TrustStatus::New,
            in_eighteen_hours,
            now,
            DAYCARE_LATE_CANCEL_HOURS
        ));
    }

    #[test]
    fn unilateral_completion_never_promotes() {
        use ConfirmationMethod::*;
        assert!(!completion_verifies_client(None));
        for method in [QrScan, ReferenceCode, Simple, Auto, Otp, Proximity, Manual] {
            assert!(completion_verifies_client(Some(method)), "{method:?}");
        }
    }
}
