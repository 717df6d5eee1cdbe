use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    models::booking::{Booking, BookingStatus, ConfirmationMethod},
    services::{
        availability::{self, DEFAULT_DURATION_MINUTES},
        earnings::{resolve_commission, EarningsService},
        medical::MedicalService,
        trust::{self, TrustService},
    },
};

/// Unambiguous alphabet for reference codes (no 0/O, 1/I/L).
const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const REFERENCE_CODE_LEN: usize = 6;
const REFERENCE_CODE_RETRIES: usize = 5;

/// Hours after the scheduled end before an unattested booking enters its
/// grace period, and how long the client then has to confirm.
pub const GRACE_TRIGGER_HOURS: i64 = 4;
pub const GRACE_PERIOD_DAYS: i64 = 7;

pub fn generate_reference_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REFERENCE_CODE_LEN)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("VGC-{suffix}")
}

fn is_serialization_failure(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// A serialization failure under SERIALIZABLE means someone else touched
/// the same slot; surface it as a plainly busy slot, not a 500.
fn map_conflict_errors(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<sqlx::Error>() {
        Some(db) if is_serialization_failure(db) => ApiError::SlotUnavailable,
        _ => ApiError::Internal(e),
    }
}

/// Only settled outcomes pin the appointment to its time.
fn reschedulable(status: BookingStatus) -> bool {
    !matches!(status, BookingStatus::Completed | BookingStatus::Cancelled)
}

/// A disputed booking is out of the client's hands until an admin rules.
fn client_cancellable(status: BookingStatus) -> bool {
    status != BookingStatus::Disputed && status.can_transition(BookingStatus::Cancelled)
}

#[derive(Debug, sqlx::FromRow)]
struct ServiceRow {
    provider_id: Uuid,
    price_da: Option<i64>,
    duration_min: i32,
    is_approved: bool,
    provider_user_id: Uuid,
}

pub(crate) async fn provider_id_for_user(pool: &PgPool, user_id: Uuid) -> ApiResult<Uuid> {
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM provider_profiles WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    id.ok_or(ApiError::NotFound("Profil prestataire"))
}

pub(crate) async fn fetch_booking(pool: &PgPool, id: Uuid) -> ApiResult<Booking> {
    let booking = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    booking.ok_or(ApiError::NotFound("Réservation"))
}

pub struct BookingService;

impl BookingService {
    /// Create a PENDING vet booking. The availability re-check and the
    /// insert share one SERIALIZABLE transaction, so two clients racing for
    /// the same slot cannot both get it; the loser's serialization failure
    /// surfaces as the same error as a plainly busy slot.
    pub async fn create(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        service_id: Uuid,
        scheduled_at: DateTime<Utc>,
        pet_ids: &[Uuid],
    ) -> ApiResult<Booking> {
        if scheduled_at <= Utc::now() {
            return Err(ApiError::invalid("La date demandée doit être dans le futur"));
        }

        TrustService::check_can_book(pool, user_id).await?;

        let svc = sqlx::query_as::<_, ServiceRow>(
            "SELECT s.provider_id, s.price_da, s.duration_min,
                    p.is_approved, p.user_id AS provider_user_id
             FROM services s
             JOIN provider_profiles p ON p.id = s.provider_id
             WHERE s.id = $1",
        )
        .bind(service_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("Service"))?;

        if !svc.is_approved {
            return Err(ApiError::forbidden("Ce prestataire n'accepte pas encore de réservations."));
        }
        if svc.provider_user_id == user_id {
            return Err(ApiError::forbidden("Vous ne pouvez pas réserver votre propre service."));
        }

        for attempt in 0..REFERENCE_CODE_RETRIES {
            let reference_code = generate_reference_code();
            match Self::try_insert(
                pool,
                config,
                user_id,
                &svc,
                service_id,
                scheduled_at,
                pet_ids,
                &reference_code,
            )
            .await
            {
                Ok(b) => return Ok(b),
                Err(ApiError::Internal(e)) => {
                    if let Some(db) = e.downcast_ref::<sqlx::Error>() {
                        if is_serialization_failure(db) {
                            return Err(ApiError::SlotUnavailable);
                        }
                        if is_unique_violation(db) && attempt + 1 < REFERENCE_CODE_RETRIES {
                            continue;
                        }
                    }
                    return Err(ApiError::Internal(e));
                }
                Err(e) => return Err(e),
            }
        }
        Err(ApiError::Internal(anyhow::anyhow!(
            "could not generate a unique reference code"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_insert(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        svc: &ServiceRow,
        service_id: Uuid,
        scheduled_at: DateTime<Utc>,
        pet_ids: &[Uuid],
        reference_code: &str,
    ) -> ApiResult<Booking> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let duration = i64::from(svc.duration_min).max(1);
        let free = availability::is_slot_free(
            &mut *tx,
            svc.provider_id,
            scheduled_at,
            duration,
            &config.default_timezone,
        )
        .await?;
        if !free {
            return Err(ApiError::SlotUnavailable);
        }

        let booking = sqlx::query_as::<_, Booking>(
            "INSERT INTO bookings
                 (id, user_id, provider_id, service_id, scheduled_at, status,
                  reference_code, pet_ids, created_at)
             VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7, NOW())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(svc.provider_id)
        .bind(service_id)
        .bind(scheduled_at)
        .bind(reference_code)
        .bind(pet_ids)
        .fetch_one(&mut *tx)
        .await?;

        match tx.commit().await {
            Ok(()) => Ok(booking),
            Err(e) if is_serialization_failure(&e) => Err(ApiError::SlotUnavailable),
            Err(e) => Err(e.into()),
        }
    }

    /// Client moves the appointment to a free slot. The status is kept: an
    /// already-accepted booking stays accepted at its new time.
    pub async fn reschedule(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        booking_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> ApiResult<Booking> {
        if scheduled_at <= Utc::now() {
            return Err(ApiError::invalid("La date demandée doit être dans le futur"));
        }

        let booking = fetch_booking(pool, booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        if !reschedulable(booking.status) {
            return Err(ApiError::Conflict(format!(
                "Une réservation {:?} ne peut plus être reportée.",
                booking.status
            )));
        }

        TrustService::check_can_reschedule(pool, user_id, booking_id).await?;

        let duration: Option<i32> =
            sqlx::query_scalar("SELECT duration_min FROM services WHERE id = $1")
                .bind(booking.service_id)
                .fetch_optional(pool)
                .await?;
        let duration = duration.map(i64::from).unwrap_or(DEFAULT_DURATION_MINUTES);

        let updated = Self::try_move(pool, config, &booking, scheduled_at, duration)
            .await
            .map_err(|e| match e {
                ApiError::Internal(inner) => map_conflict_errors(inner),
                other => other,
            })?;

        TrustService::record_reschedule(pool, user_id, booking_id).await?;
        Ok(updated)
    }

    async fn try_move(
        pool: &PgPool,
        config: &Config,
        booking: &Booking,
        scheduled_at: DateTime<Utc>,
        duration: i64,
    ) -> ApiResult<Booking> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // The booking's own old slot must not block its new one.
        let mut ctx = availability::load_context(
            &mut *tx,
            booking.provider_id,
            scheduled_at,
            scheduled_at + Duration::minutes(duration),
            &config.default_timezone,
        )
        .await?;
        ctx.bookings.retain(|&(s, _)| s != booking.scheduled_at);
        if !ctx.slot_is_free(scheduled_at, duration) {
            return Err(ApiError::SlotUnavailable);
        }

        let updated = sqlx::query_as::<_, Booking>(
            "UPDATE bookings SET scheduled_at = $1 WHERE id = $2 RETURNING *",
        )
        .bind(scheduled_at)
        .bind(booking.id)
        .fetch_one(&mut *tx)
        .await?;

        match tx.commit().await {
            Ok(()) => Ok(updated),
            Err(e) if is_serialization_failure(&e) => Err(ApiError::SlotUnavailable),
            Err(e) => Err(e.into()),
        }
    }

    /// Client cancellation. A NEW user cancelling under 12h before the
    /// appointment takes the no-show penalty.
    pub async fn cancel(
        pool: &PgPool,
        user_id: Uuid,
        booking_id: Uuid,
        reason: Option<&str>,
    ) -> ApiResult<Booking> {
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        if !client_cancellable(booking.status) {
            return Err(ApiError::Conflict(format!(
                "Une réservation {:?} ne peut plus être annulée.",
                booking.status
            )));
        }

        let trust = TrustService::trust_status(pool, user_id).await?;
        let now = Utc::now();
        let penalize = booking.status.blocks_slot()
            && trust::cancellation_is_no_show(
                trust,
                booking.scheduled_at,
                now,
                trust::VET_LATE_CANCEL_HOURS,
            );

        let updated = sqlx::query_as::<_, Booking>(
            "UPDATE bookings SET status = 'CANCELLED', cancellation_reason = $1
             WHERE id = $2
             RETURNING *",
        )
        .bind(reason.map(str::trim).filter(|s| !s.is_empty()))
        .bind(booking_id)
        .fetch_one(pool)
        .await?;

        EarningsService::delete_for_booking(pool, booking_id).await?;
        if penalize {
            TrustService::apply_no_show_penalty(pool, user_id).await?;
        }
        Ok(updated)
    }

    /// Provider-side status change (accept, complete, cancel). Guarded by
    /// the transition table; completion runs its side effects.
    pub async fn provider_set_status(
        pool: &PgPool,
        config: &Config,
        pro_user_id: Uuid,
        booking_id: Uuid,
        to: BookingStatus,
    ) -> ApiResult<Booking> {
        let provider_id = provider_id_for_user(pool, pro_user_id).await?;
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.provider_id != provider_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        if !matches!(
            to,
            BookingStatus::Confirmed | BookingStatus::Completed | BookingStatus::Cancelled
        ) {
            return Err(ApiError::invalid("Changement de statut non autorisé"));
        }
        if booking.status == BookingStatus::Disputed {
            return Err(ApiError::forbidden(
                "Une réservation contestée ne peut être clôturée que par un administrateur.",
            ));
        }
        Self::apply_transition(pool, config, &booking, to, None).await
    }

    /// Administrative cancellation, the only exit from a dispute.
    pub async fn admin_cancel(pool: &PgPool, config: &Config, booking_id: Uuid) -> ApiResult<Booking> {
        let booking = fetch_booking(pool, booking_id).await?;
        Self::apply_transition(pool, config, &booking, BookingStatus::Cancelled, None).await
    }

    /// Shared transition executor. The UPDATE re-checks the source status
    /// so a concurrent change makes the second writer fail instead of
    /// double-applying side effects. `attestation` carries the confirmation
    /// method when completion comes through the confirmation protocol;
    /// a unilateral provider completion passes `None`.
    pub(crate) async fn apply_transition(
        pool: &PgPool,
        config: &Config,
        booking: &Booking,
        to: BookingStatus,
        attestation: Option<ConfirmationMethod>,
    ) -> ApiResult<Booking> {
        if !booking.status.can_transition(to) {
            return Err(ApiError::Conflict(format!(
                "Transition impossible de {:?} vers {:?}.",
                booking.status, to
            )));
        }

        let updated = sqlx::query_as::<_, Booking>(
            "UPDATE bookings SET status = $1 WHERE id = $2 AND status = $3 RETURNING *",
        )
        .bind(to)
        .bind(booking.id)
        .bind(booking.status)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::Conflict("La réservation a été modifiée entre-temps, réessayez.".into()))?;

        match to {
            BookingStatus::Completed => {
                Self::finalize_completion(pool, config, &updated).await?;
                if trust::completion_verifies_client(attestation) {
                    TrustService::verify_user_if_needed(pool, updated.user_id).await?;
                    Self::open_visit_records(pool, &updated).await?;
                }
            }
            BookingStatus::Cancelled => {
                EarningsService::delete_for_booking(pool, booking.id).await?;
            }
            _ => {}
        }
        Ok(updated)
    }

    /// Bookkeeping every completion gets, attested or not: commission
    /// snapshot and earning upsert. Both idempotent.
    pub(crate) async fn finalize_completion(
        pool: &PgPool,
        config: &Config,
        booking: &Booking,
    ) -> ApiResult<()> {
        #[derive(sqlx::FromRow)]
        struct PriceRow {
            price_da: Option<i64>,
            vet_commission_da: Option<i64>,
        }
        let row = sqlx::query_as::<_, PriceRow>(
            "SELECT s.price_da, p.vet_commission_da
             FROM services s
             JOIN provider_profiles p ON p.id = s.provider_id
             WHERE s.id = $1",
        )
        .bind(booking.service_id)
        .fetch_optional(pool)
        .await?;

        let (gross, commission_override) = match row {
            Some(r) => (r.price_da.unwrap_or(0), r.vet_commission_da),
            None => (0, None),
        };
        let commission = resolve_commission(commission_override, config.commission_da, gross);

        sqlx::query("UPDATE bookings SET commission_da = $1 WHERE id = $2")
            .bind(commission)
            .bind(booking.id)
            .execute(pool)
            .await?;

        EarningsService::upsert_for_completion(
            pool,
            booking.provider_id,
            booking.id,
            booking.service_id,
            gross,
            commission,
        )
        .await?;
        Ok(())
    }

    /// Medical record shells for an attested visit, one per pet.
    async fn open_visit_records(pool: &PgPool, booking: &Booking) -> ApiResult<()> {
        let label: Option<(String, String)> = sqlx::query_as(
            "SELECT s.title, p.display_name
             FROM services s
             JOIN provider_profiles p ON p.id = s.provider_id
             WHERE s.id = $1",
        )
        .bind(booking.service_id)
        .fetch_optional(pool)
        .await?;
        let summary = match label {
            Some((title, name)) => format!("{title} avec {name}"),
            None => "Visite".to_string(),
        };
        MedicalService::create_visit_records(
            pool,
            booking.id,
            booking.provider_id,
            &booking.pet_ids,
            &summary,
        )
        .await
    }

    /// Client history. Settled bookings age out of the list after a week;
    /// live ones always show.
    pub async fn list_mine(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings
             WHERE user_id = $1
               AND (status IN ('PENDING', 'CONFIRMED',
                               'AWAITING_CONFIRMATION', 'PENDING_PRO_VALIDATION')
                    OR scheduled_at >= NOW() - INTERVAL '7 days')
             ORDER BY scheduled_at DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_mine(pool: &PgPool, user_id: Uuid, booking_id: Uuid) -> ApiResult<Booking> {
        let booking = fetch_booking(pool, booking_id).await?;
        let provider_user: Option<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM provider_profiles WHERE id = $1")
                .bind(booking.provider_id)
                .fetch_optional(pool)
                .await?;
        if booking.user_id != user_id && provider_user != Some(user_id) {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        Ok(booking)
    }

    /// Provider agenda over a window, all non-cancelled statuses.
    pub async fn provider_agenda(
        pool: &PgPool,
        pro_user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ApiResult<Vec<Booking>> {
        let provider_id = provider_id_for_user(pool, pro_user_id).await?;
        let rows = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings
             WHERE provider_id = $1
               AND scheduled_at >= $2 AND scheduled_at < $3
               AND status <> 'CANCELLED'
             ORDER BY scheduled_at",
        )
        .bind(provider_id)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Bookings where the client has attested and the provider's word is
    /// still missing.
    pub async fn pending_validations(pool: &PgPool, pro_user_id: Uuid) -> ApiResult<Vec<Booking>> {
        let provider_id = provider_id_for_user(pool, pro_user_id).await?;
        let rows = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings
             WHERE provider_id = $1 AND status = 'PENDING_PRO_VALIDATION'
             ORDER BY scheduled_at",
        )
        .bind(provider_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sweep pass one: past bookings nobody attested enter the grace
    /// period. Runs inside the caller's advisory-locked transaction.
    pub async fn sweep_into_grace(
        conn: &mut sqlx::PgConnection,
        now: DateTime<Utc>,
    ) -> ApiResult<u64> {
        let trigger = now - Duration::hours(GRACE_TRIGGER_HOURS);
        let grace_until = now + Duration::days(GRACE_PERIOD_DAYS);
        let result = sqlx::query(
            "UPDATE bookings b
             SET status = 'AWAITING_CONFIRMATION', grace_period_ends_at = $1
             FROM services s
             WHERE s.id = b.service_id
               AND b.status IN ('PENDING', 'CONFIRMED')
               AND b.grace_period_ends_at IS NULL
               AND b.scheduled_at + make_interval(mins => s.duration_min) <= $2",
        )
        .bind(grace_until)
        .bind(trigger)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Sweep pass two: grace ran out with no resolution.
    pub async fn sweep_expire(conn: &mut sqlx::PgConnection, now: DateTime<Utc>) -> ApiResult<u64> {
        let result = sqlx::query(
            "UPDATE bookings
             SET status = 'EXPIRED'
             WHERE status IN ('AWAITING_CONFIRMATION', 'PENDING_PRO_VALIDATION')
               AND grace_period_ends_at IS NOT NULL
               AND grace_period_ends_at <= $1",
        )
        .bind(now)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_codes_use_the_safe_alphabet() {
        for _ in 0..200 {
            let code = generate_reference_code();
            assert_eq!(code.len(), 4 + REFERENCE_CODE_LEN);
            assert!(code.starts_with("VGC-"));
            for c in code[4..].bytes() {
                assert!(
                    REFERENCE_ALPHABET.contains(&c),
                    "unexpected char {} in {code}",
                    c as char
                );
            }
            for forbidden in [b'0', b'O', b'1', b'I', b'L'] {
                assert!(!code.as_bytes()[4..].contains(&forbidden));
            }
        }
    }

    #[test]
    fn only_settled_bookings_refuse_a_reschedule() {
        use BookingStatus::*;
        for status in [Pending, Confirmed, AwaitingConfirmation, PendingProValidation, Disputed, Expired] {
            assert!(reschedulable(status), "{status:?} should still be movable");
        }
        assert!(!reschedulable(Completed));
        assert!(!reschedulable(Cancelled));
    }

    #[test]
    fn disputed_bookings_escape_the_client_cancel() {
        use BookingStatus::*;
        assert!(client_cancellable(Pending));
        assert!(client_cancellable(Confirmed));
        assert!(!client_cancellable(Disputed));
        assert!(!client_cancellable(Completed));
    }

    #[derive(Debug)]
    struct FakeDbError(&'static str);

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "conflit"
        }
        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.0.into())
        }
        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn wrapped(code: &'static str) -> anyhow::Error {
        anyhow::Error::from(sqlx::Error::Database(Box::new(FakeDbError(code))))
    }

    #[test]
    fn serialization_failures_surface_as_a_busy_slot() {
        assert!(matches!(
            map_conflict_errors(wrapped("40001")),
            ApiError::SlotUnavailable
        ));
        assert!(matches!(
            map_conflict_errors(wrapped("23505")),
            ApiError::Internal(_)
        ));
        assert!(matches!(
            map_conflict_errors(anyhow::anyhow!("boom")),
            ApiError::Internal(_)
        ));
    }
}
