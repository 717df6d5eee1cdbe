use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    models::daycare::{DaycareBooking, DaycarePhase, DaycareStatus, LateFeeStatus},
    services::{
        confirmation::{generate_otp, haversine_km, CHECKIN_MAX_DISTANCE_KM, OTP_TTL_MINUTES},
        medical::MedicalService,
        otp_limit,
        trust::{self, TrustService},
    },
};

async fn fetch_stay(pool: &PgPool, id: Uuid) -> ApiResult<DaycareBooking> {
    let stay = sqlx::query_as::<_, DaycareBooking>("SELECT * FROM daycare_bookings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    stay.ok_or(ApiError::NotFound("Réservation garderie"))
}

fn phase_otp_key(phase: DaycarePhase) -> &'static str {
    phase.as_str()
}

pub struct DaycareService;

impl DaycareService {
    async fn owned_by_client(
        pool: &PgPool,
        user_id: Uuid,
        stay_id: Uuid,
    ) -> ApiResult<DaycareBooking> {
        let stay = fetch_stay(pool, stay_id).await?;
        if stay.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        Ok(stay)
    }

    async fn owned_by_pro(
        pool: &PgPool,
        pro_user_id: Uuid,
        stay_id: Uuid,
    ) -> ApiResult<DaycareBooking> {
        let provider_id =
            crate::services::bookings::provider_id_for_user(pool, pro_user_id).await?;
        let stay = fetch_stay(pool, stay_id).await?;
        if stay.provider_id != provider_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        Ok(stay)
    }

    async fn set_status(
        pool: &PgPool,
        stay: &DaycareBooking,
        to: DaycareStatus,
    ) -> ApiResult<DaycareBooking> {
        if !stay.status.can_transition(to) {
            return Err(ApiError::Conflict(format!(
                "Transition impossible de {:?} vers {:?}.",
                stay.status, to
            )));
        }
        let updated = sqlx::query_as::<_, DaycareBooking>(
            "UPDATE daycare_bookings SET status = $1 WHERE id = $2 AND status = $3 RETURNING *",
        )
        .bind(to)
        .bind(stay.id)
        .bind(stay.status)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::Conflict("La réservation a été modifiée entre-temps, réessayez.".into()))?;
        Ok(updated)
    }

    pub async fn create(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        provider_id: Uuid,
        pet_id: Uuid,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        price_da: i64,
        notes: Option<&str>,
    ) -> ApiResult<DaycareBooking> {
        if start_date <= Utc::now() {
            return Err(ApiError::invalid("La date de début doit être dans le futur"));
        }
        if end_date <= start_date {
            return Err(ApiError::invalid("La date de fin doit être après la date de début"));
        }
        if price_da < 0 {
            return Err(ApiError::invalid("Le prix doit être positif"));
        }

        TrustService::check_can_book(pool, user_id).await?;

        let approved: Option<bool> = sqlx::query_scalar(
            "SELECT is_approved FROM provider_profiles WHERE id = $1 AND kind = 'daycare'",
        )
        .bind(provider_id)
        .fetch_optional(pool)
        .await?;
        match approved {
            None => return Err(ApiError::NotFound("Prestataire garderie")),
            Some(false) => {
                return Err(ApiError::forbidden("Ce prestataire n'accepte pas encore de réservations."))
            }
            Some(true) => {}
        }

        let owns_pet: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pets WHERE id = $1 AND owner_id = $2)")
                .bind(pet_id)
                .bind(user_id)
                .fetch_one(pool)
                .await?;
        if !owns_pet {
            return Err(ApiError::forbidden("Cet animal ne vous appartient pas."));
        }

        let commission = config.commission_da.clamp(0, price_da);
        let stay = sqlx::query_as::<_, DaycareBooking>(
            "INSERT INTO daycare_bookings
                 (id, user_id, provider_id, pet_id, start_date, end_date, status,
                  price_da, commission_da, total_da, notes, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7, $8, $7, $9, NOW())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(provider_id)
        .bind(pet_id)
        .bind(start_date)
        .bind(end_date)
        .bind(price_da)
        .bind(commission)
        .bind(notes.map(str::trim).filter(|s| !s.is_empty()))
        .fetch_one(pool)
        .await?;
        Ok(stay)
    }

    /// Client cancellation; under 24h before drop-off a NEW user takes the
    /// no-show penalty.
    pub async fn cancel(
        pool: &PgPool,
        user_id: Uuid,
        stay_id: Uuid,
        reason: Option<&str>,
    ) -> ApiResult<DaycareBooking> {
        let stay = Self::owned_by_client(pool, user_id, stay_id).await?;
        if !matches!(stay.status, DaycareStatus::Pending | DaycareStatus::Confirmed) {
            return Err(ApiError::Conflict(
                "Seuls les séjours en attente ou confirmés peuvent être annulés.".into(),
            ));
        }

        let trust_status = TrustService::trust_status(pool, user_id).await?;
        let now = Utc::now();
        let penalize = trust::cancellation_is_no_show(
            trust_status,
            stay.start_date,
            now,
            trust::DAYCARE_LATE_CANCEL_HOURS,
        );

        let updated = Self::set_status(pool, &stay, DaycareStatus::Cancelled).await?;
        if let Some(r) = reason.map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query("UPDATE daycare_bookings SET dispute_note = $1 WHERE id = $2")
                .bind(r)
                .bind(stay_id)
                .execute(pool)
                .await?;
        }
        if penalize {
            TrustService::apply_no_show_penalty(pool, user_id).await?;
        }
        Ok(updated)
    }

    /// Provider accepts or cancels a stay.
    pub async fn provider_set_status(
        pool: &PgPool,
        pro_user_id: Uuid,
        stay_id: Uuid,
        to: DaycareStatus,
    ) -> ApiResult<DaycareBooking> {
        if !matches!(to, DaycareStatus::Confirmed | DaycareStatus::Cancelled) {
            return Err(ApiError::invalid("Changement de statut non autorisé"));
        }
        let stay = Self::owned_by_pro(pool, pro_user_id, stay_id).await?;
        Self::set_status(pool, &stay, to).await
    }

    /// Client attests a phase happened. Distance is advisory here: being
    /// near the daycare stamps `client_nearby_at` but never blocks.
    pub async fn client_phase_confirm(
        pool: &PgPool,
        user_id: Uuid,
        stay_id: Uuid,
        phase: DaycarePhase,
        lat: Option<f64>,
        lng: Option<f64>,
    ) -> ApiResult<DaycareBooking> {
        let stay = Self::owned_by_client(pool, user_id, stay_id).await?;
        let (expected, to) = match phase {
            DaycarePhase::Drop => (DaycareStatus::Confirmed, DaycareStatus::PendingDropValidation),
            DaycarePhase::Pickup => (
                DaycareStatus::InProgress,
                DaycareStatus::PendingPickupValidation,
            ),
        };
        if stay.status != expected {
            return Err(ApiError::Conflict(format!(
                "Un séjour {:?} n'a pas de confirmation {} à donner.",
                stay.status,
                phase.as_str()
            )));
        }

        let nearby_at = match (lat, lng) {
            (Some(lat), Some(lng)) => Self::nearby_stamp(pool, stay.provider_id, lat, lng).await?,
            _ => None,
        };

        let updated = Self::set_status(pool, &stay, to).await?;
        let now = Utc::now();
        match phase {
            DaycarePhase::Drop => {
                sqlx::query(
                    "UPDATE daycare_bookings
                     SET client_drop_confirmed_at = $1, drop_confirmation_method = 'SIMPLE',
                         drop_checkin_lat = $2, drop_checkin_lng = $3,
                         client_nearby_at = COALESCE($4, client_nearby_at)
                     WHERE id = $5",
                )
                .bind(now)
                .bind(lat)
                .bind(lng)
                .bind(nearby_at)
                .bind(stay_id)
                .execute(pool)
                .await?;
            }
            DaycarePhase::Pickup => {
                sqlx::query(
                    "UPDATE daycare_bookings
                     SET client_pickup_confirmed_at = $1, pickup_confirmation_method = 'SIMPLE',
                         pickup_checkin_lat = $2, pickup_checkin_lng = $3,
                         client_nearby_at = COALESCE($4, client_nearby_at)
                     WHERE id = $5",
                )
                .bind(now)
                .bind(lat)
                .bind(lng)
                .bind(nearby_at)
                .bind(stay_id)
                .execute(pool)
                .await?;
            }
        }
        fetch_stay(pool, stay_id).await
    }

    async fn nearby_stamp(
        pool: &PgPool,
        provider_id: Uuid,
        lat: f64,
        lng: f64,
    ) -> ApiResult<Option<DateTime<Utc>>> {
        let coords: Option<(Option<f64>, Option<f64>)> =
            sqlx::query_as("SELECT lat, lng FROM provider_profiles WHERE id = $1")
                .bind(provider_id)
                .fetch_optional(pool)
                .await?;
        if let Some((Some(plat), Some(plng))) = coords {
            if haversine_km(lat, lng, plat, plng) <= CHECKIN_MAX_DISTANCE_KM {
                return Ok(Some(Utc::now()));
            }
        }
        Ok(None)
    }

    /// Provider's word on a phase attestation. Rejection disputes the stay,
    /// flags it and penalizes the client.
    pub async fn pro_phase_validate(
        pool: &PgPool,
        config: &Config,
        pro_user_id: Uuid,
        stay_id: Uuid,
        phase: DaycarePhase,
        approved: bool,
    ) -> ApiResult<DaycareBooking> {
        let stay = Self::owned_by_pro(pool, pro_user_id, stay_id).await?;
        let expected = match phase {
            DaycarePhase::Drop => DaycareStatus::PendingDropValidation,
            DaycarePhase::Pickup => DaycareStatus::PendingPickupValidation,
        };
        if stay.status != expected {
            return Err(ApiError::Conflict(format!(
                "Ce séjour n'attend pas de validation {}.",
                phase.as_str()
            )));
        }

        if !approved {
            let updated = Self::set_status(pool, &stay, DaycareStatus::Disputed).await?;
            sqlx::query(
                "INSERT INTO admin_flags (id, user_id, daycare_booking_id, kind, note, created_at)
                 VALUES ($1, $2, $3, 'DISPUTED_STAY', $4, NOW())",
            )
            .bind(Uuid::new_v4())
            .bind(stay.user_id)
            .bind(stay_id)
            .bind(format!("Provider denied the {} attestation", phase.as_str()))
            .execute(pool)
            .await?;
            TrustService::apply_no_show_penalty(pool, stay.user_id).await?;
            return Ok(updated);
        }

        match phase {
            DaycarePhase::Drop => Self::start_stay(pool, &stay).await,
            DaycarePhase::Pickup => Self::complete_stay(pool, config, &stay).await,
        }
    }

    /// Client requests a one-time code for a phase handover.
    pub async fn request_phase_otp(
        pool: &PgPool,
        user_id: Uuid,
        stay_id: Uuid,
        phase: DaycarePhase,
    ) -> ApiResult<Value> {
        let stay = Self::owned_by_client(pool, user_id, stay_id).await?;
        let expected = match phase {
            DaycarePhase::Drop => DaycareStatus::Confirmed,
            DaycarePhase::Pickup => DaycareStatus::InProgress,
        };
        if stay.status != expected {
            return Err(ApiError::Conflict(format!(
                "Un séjour {:?} n'a pas de code {} à générer.",
                stay.status,
                phase.as_str()
            )));
        }

        let code = generate_otp();
        let expires_at = Utc::now() + Duration::minutes(OTP_TTL_MINUTES);
        let sql = match phase {
            DaycarePhase::Drop => {
                "UPDATE daycare_bookings SET drop_otp_code = $1, drop_otp_expires_at = $2 WHERE id = $3"
            }
            DaycarePhase::Pickup => {
                "UPDATE daycare_bookings SET pickup_otp_code = $1, pickup_otp_expires_at = $2 WHERE id = $3"
            }
        };
        sqlx::query(sql)
            .bind(&code)
            .bind(expires_at)
            .bind(stay_id)
            .execute(pool)
            .await?;

        Ok(json!({ "otp": code, "expires_at": expires_at, "phase": phase.as_str() }))
    }

    /// Provider validates the handover code. Success advances the stay
    /// directly, skipping the attestation round-trip.
    pub async fn validate_phase_otp(
        pool: &PgPool,
        config: &Config,
        redis: &mut redis::aio::MultiplexedConnection,
        pro_user_id: Uuid,
        stay_id: Uuid,
        phase: DaycarePhase,
        code: &str,
    ) -> ApiResult<DaycareBooking> {
        let stay = Self::owned_by_pro(pool, pro_user_id, stay_id).await?;
        otp_limit::check_not_locked(redis, stay_id, phase_otp_key(phase)).await?;

        let (stored, expires) = match phase {
            DaycarePhase::Drop => (&stay.drop_otp_code, stay.drop_otp_expires_at),
            DaycarePhase::Pickup => (&stay.pickup_otp_code, stay.pickup_otp_expires_at),
        };
        let valid = matches!(
            (stored, expires),
            (Some(s), Some(e)) if s == code.trim() && e > Utc::now()
        );
        if !valid {
            otp_limit::record_failure(redis, stay_id, phase_otp_key(phase)).await?;
            return Err(ApiError::invalid("Code invalide ou expiré"));
        }

        otp_limit::clear(redis, stay_id, phase_otp_key(phase)).await?;
        let (clear_sql, method_sql) = match phase {
            DaycarePhase::Drop => (
                "UPDATE daycare_bookings SET drop_otp_code = NULL, drop_otp_expires_at = NULL WHERE id = $1",
                "UPDATE daycare_bookings SET drop_confirmation_method = 'OTP' WHERE id = $1",
            ),
            DaycarePhase::Pickup => (
                "UPDATE daycare_bookings SET pickup_otp_code = NULL, pickup_otp_expires_at = NULL WHERE id = $1",
                "UPDATE daycare_bookings SET pickup_confirmation_method = 'OTP' WHERE id = $1",
            ),
        };
        sqlx::query(clear_sql).bind(stay_id).execute(pool).await?;
        sqlx::query(method_sql).bind(stay_id).execute(pool).await?;

        match phase {
            DaycarePhase::Drop => Self::start_stay(pool, &stay).await,
            DaycarePhase::Pickup => Self::complete_stay(pool, config, &stay).await,
        }
    }

    async fn start_stay(pool: &PgPool, stay: &DaycareBooking) -> ApiResult<DaycareBooking> {
        let updated = Self::set_status(pool, stay, DaycareStatus::InProgress).await?;
        sqlx::query("UPDATE daycare_bookings SET actual_drop_off = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(stay.id)
            .execute(pool)
            .await?;
        MedicalService::create_daycare_record(
            pool,
            stay.id,
            stay.provider_id,
            stay.pet_id,
            "Séjour en garderie",
        )
        .await?;
        fetch_stay(pool, updated.id).await
    }

    /// Completion: stamp the actual pickup, quote a late fee if the pickup
    /// ran past the scheduled end, promote a NEW client.
    async fn complete_stay(
        pool: &PgPool,
        config: &Config,
        stay: &DaycareBooking,
    ) -> ApiResult<DaycareBooking> {
        Self::set_status(pool, stay, DaycareStatus::Completed).await?;
        let now = Utc::now();

        let rates: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT daycare_hourly_rate_da, daycare_daily_rate_da
             FROM provider_profiles WHERE id = $1",
        )
        .bind(stay.provider_id)
        .fetch_optional(pool)
        .await?;
        let (hourly, daily) = rates.unwrap_or((None, None));
        let quote = super::late_fee::calculate_late_fee(
            stay.end_date,
            now,
            hourly.unwrap_or(config.late_fee_hourly_rate_da),
            daily.unwrap_or(config.late_fee_daily_rate_da),
        );

        if quote.fee_da > 0 {
            sqlx::query(
                "UPDATE daycare_bookings
                 SET actual_pickup = $1, late_fee_da = $2, late_fee_hours = $3,
                     late_fee_status = 'PENDING'
                 WHERE id = $4",
            )
            .bind(now)
            .bind(quote.fee_da)
            .bind(quote.billable_hours as f64)
            .bind(stay.id)
            .execute(pool)
            .await?;
        } else {
            sqlx::query("UPDATE daycare_bookings SET actual_pickup = $1 WHERE id = $2")
                .bind(now)
                .bind(stay.id)
                .execute(pool)
                .await?;
        }

        TrustService::verify_user_if_needed(pool, stay.user_id).await?;
        fetch_stay(pool, stay.id).await
    }

    /// Provider decides whether to charge the quoted late fee. Accepting
    /// folds it into the stay total; waiving zeroes it.
    pub async fn decide_late_fee(
        pool: &PgPool,
        pro_user_id: Uuid,
        stay_id: Uuid,
        accept: bool,
        note: Option<&str>,
    ) -> ApiResult<DaycareBooking> {
        let stay = Self::owned_by_pro(pool, pro_user_id, stay_id).await?;
        if stay.late_fee_status != Some(LateFeeStatus::Pending) {
            return Err(ApiError::Conflict("Aucun frais de retard en attente sur ce séjour.".into()));
        }
        let fee = stay.late_fee_da.unwrap_or(0);

        if accept {
            sqlx::query(
                "UPDATE daycare_bookings
                 SET late_fee_status = 'ACCEPTED', late_fee_accepted_at = $1,
                     late_fee_note = $2, total_da = total_da + $3
                 WHERE id = $4",
            )
            .bind(Utc::now())
            .bind(note)
            .bind(fee)
            .bind(stay_id)
            .execute(pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE daycare_bookings
                 SET late_fee_status = 'REJECTED', late_fee_da = 0, late_fee_hours = 0,
                     late_fee_note = $1
                 WHERE id = $2",
            )
            .bind(note)
            .bind(stay_id)
            .execute(pool)
            .await?;
        }
        fetch_stay(pool, stay_id).await
    }

    pub async fn list_mine(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<DaycareBooking>> {
        let rows = sqlx::query_as::<_, DaycareBooking>(
            "SELECT * FROM daycare_bookings WHERE user_id = $1 ORDER BY start_date DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn provider_calendar(
        pool: &PgPool,
        pro_user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ApiResult<Vec<DaycareBooking>> {
        let provider_id =
            crate::services::bookings::provider_id_for_user(pool, pro_user_id).await?;
        let rows = sqlx::query_as::<_, DaycareBooking>(
            "SELECT * FROM daycare_bookings
             WHERE provider_id = $1
               AND start_date < $2 AND end_date > $3
               AND status <> 'CANCELLED'
             ORDER BY start_date",
        )
        .bind(provider_id)
        .bind(to)
        .bind(from)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn pending_validations(
        pool: &PgPool,
        pro_user_id: Uuid,
    ) -> ApiResult<Vec<DaycareBooking>> {
        let provider_id =
            crate::services::bookings::provider_id_for_user(pool, pro_user_id).await?;
        let rows = sqlx::query_as::<_, DaycareBooking>(
            "SELECT * FROM daycare_bookings
             WHERE provider_id = $1
               AND status IN ('PENDING_DROP_VALIDATION', 'PENDING_PICKUP_VALIDATION')
             ORDER BY start_date",
        )
        .bind(provider_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
