use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    models::booking::{Booking, BookingStatus, ConfirmationMethod},
    services::{
        bookings::{fetch_booking, provider_id_for_user, BookingService},
        medical::MedicalService,
        otp_limit,
        trust::TrustService,
    },
};

/// Maximum distance between the client and the clinic for a check-in to
/// count as on-site.
pub const CHECKIN_MAX_DISTANCE_KM: f64 = 0.5;

/// A reference code is only redeemable around its appointment.
pub const REFERENCE_WINDOW_HOURS: i64 = 12;

pub const OTP_TTL_MINUTES: i64 = 10;
const OTP_PHASE_VISIT: &str = "visit";

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, in kilometres.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn generate_otp() -> String {
    let n: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    n.to_string()
}

pub struct ConfirmationService;

impl ConfirmationService {
    async fn owned_by_pro(pool: &PgPool, pro_user_id: Uuid, booking_id: Uuid) -> ApiResult<Booking> {
        let provider_id = provider_id_for_user(pool, pro_user_id).await?;
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.provider_id != provider_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        Ok(booking)
    }

    /// Provider-side attestation. Strong evidence of presence (scanned QR,
    /// typed reference code, validated OTP) completes the visit outright;
    /// SIMPLE/AUTO taps accept first and complete on the second tap.
    async fn advance_by_pro(
        pool: &PgPool,
        config: &Config,
        booking: &Booking,
        method: ConfirmationMethod,
    ) -> ApiResult<Booking> {
        let strong = matches!(
            method,
            ConfirmationMethod::QrScan | ConfirmationMethod::ReferenceCode | ConfirmationMethod::Otp
        );
        let to = match booking.status {
            BookingStatus::Pending if strong => BookingStatus::Completed,
            BookingStatus::Pending => BookingStatus::Confirmed,
            BookingStatus::Confirmed | BookingStatus::AwaitingConfirmation => {
                BookingStatus::Completed
            }
            other => {
                return Err(ApiError::Conflict(format!(
                    "Une réservation {other:?} ne peut pas être confirmée ainsi."
                )))
            }
        };

        let mut updated =
            BookingService::apply_transition(pool, config, booking, to, Some(method)).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE bookings SET confirmation_method = $1, pro_confirmed_at = $2 WHERE id = $3",
        )
        .bind(method)
        .bind(now)
        .bind(booking.id)
        .execute(pool)
        .await?;
        updated.confirmation_method = Some(method);
        updated.pro_confirmed_at = Some(now);
        Ok(updated)
    }

    /// QR / SIMPLE / AUTO confirmation by the provider.
    pub async fn pro_confirm(
        pool: &PgPool,
        config: &Config,
        pro_user_id: Uuid,
        booking_id: Uuid,
        method: Option<ConfirmationMethod>,
    ) -> ApiResult<Booking> {
        let booking = Self::owned_by_pro(pool, pro_user_id, booking_id).await?;
        let method = method.unwrap_or(ConfirmationMethod::Simple);
        if !matches!(
            method,
            ConfirmationMethod::QrScan | ConfirmationMethod::Simple | ConfirmationMethod::Auto
        ) {
            return Err(ApiError::invalid("Utilisez l'endpoint dédié pour cette méthode"));
        }
        Self::advance_by_pro(pool, config, &booking, method).await
    }

    /// The client reads their reference code at the desk; redeeming it also
    /// opens a 24h window onto the pets' medical history.
    pub async fn confirm_by_reference_code(
        pool: &PgPool,
        config: &Config,
        pro_user_id: Uuid,
        code: &str,
    ) -> ApiResult<Value> {
        let provider_id = provider_id_for_user(pool, pro_user_id).await?;
        let code = code.trim().to_uppercase();

        let booking = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE reference_code = $1 AND provider_id = $2",
        )
        .bind(&code)
        .bind(provider_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("Réservation"))?;

        let now = Utc::now();
        if (now - booking.scheduled_at).num_hours().abs() > REFERENCE_WINDOW_HOURS {
            return Err(ApiError::Conflict(
                "Ce code de référence est hors de sa fenêtre de validité.".into(),
            ));
        }

        let updated =
            Self::advance_by_pro(pool, config, &booking, ConfirmationMethod::ReferenceCode).await?;
        let token = MedicalService::mint_pet_access_token(pool, booking.id, provider_id).await?;
        Ok(json!({ "booking": updated, "access": token }))
    }

    /// Client attestation during the grace period. Hands the booking to the
    /// provider for the final word.
    pub async fn client_confirm(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        booking_id: Uuid,
    ) -> ApiResult<Booking> {
        Self::client_attest(pool, config, user_id, booking_id, ConfirmationMethod::Manual).await
    }

    async fn client_attest(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        booking_id: Uuid,
        method: ConfirmationMethod,
    ) -> ApiResult<Booking> {
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        if booking.status != BookingStatus::AwaitingConfirmation {
            return Err(ApiError::Conflict(
                "Cette réservation n'attend pas votre confirmation.".into(),
            ));
        }

        let mut updated = BookingService::apply_transition(
            pool,
            config,
            &booking,
            BookingStatus::PendingProValidation,
            None,
        )
        .await?;
        let now = Utc::now();
        // The provider has until the end of the grace window to answer.
        sqlx::query(
            "UPDATE bookings
             SET client_confirmed_at = $1, confirmation_method = $2,
                 pro_response_deadline = grace_period_ends_at
             WHERE id = $3",
        )
        .bind(now)
        .bind(method)
        .bind(booking_id)
        .execute(pool)
        .await?;
        updated.client_confirmed_at = Some(now);
        updated.confirmation_method = Some(method);
        Ok(updated)
    }

    /// Provider's verdict on a client attestation. Rejection opens a
    /// dispute, flags it for an admin and penalizes the client.
    pub async fn pro_validate(
        pool: &PgPool,
        config: &Config,
        pro_user_id: Uuid,
        booking_id: Uuid,
        approved: bool,
        note: Option<&str>,
    ) -> ApiResult<Booking> {
        let booking = Self::owned_by_pro(pool, pro_user_id, booking_id).await?;
        if booking.status != BookingStatus::PendingProValidation {
            return Err(ApiError::Conflict(
                "Cette réservation n'attend pas votre validation.".into(),
            ));
        }

        if approved {
            // The client already attested; their stamped method carries over.
            let attestation = booking.confirmation_method.or(Some(ConfirmationMethod::Manual));
            return BookingService::apply_transition(
                pool,
                config,
                &booking,
                BookingStatus::Completed,
                attestation,
            )
            .await;
        }

        let note = note
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("Le prestataire a contesté l'attestation du client");
        let mut updated =
            BookingService::apply_transition(pool, config, &booking, BookingStatus::Disputed, None)
                .await?;
        sqlx::query("UPDATE bookings SET dispute_note = $1 WHERE id = $2")
            .bind(note)
            .bind(booking_id)
            .execute(pool)
            .await?;
        updated.dispute_note = Some(note.to_string());
        sqlx::query(
            "INSERT INTO admin_flags (id, user_id, booking_id, kind, note, created_at)
             VALUES ($1, $2, $3, 'DISPUTED_VISIT', $4, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(booking.user_id)
        .bind(booking_id)
        .bind(note)
        .execute(pool)
        .await?;
        // The provider's word wins pending review: the attestation counts
        // as a no-show for the client.
        TrustService::apply_no_show_penalty(pool, booking.user_id).await?;
        Ok(updated)
    }

    /// On-site check-in. Anything beyond 500 m of the clinic is rejected
    /// outright; during grace the check-in doubles as client attestation.
    pub async fn client_checkin(
        pool: &PgPool,
        config: &Config,
        user_id: Uuid,
        booking_id: Uuid,
        lat: f64,
        lng: f64,
    ) -> ApiResult<Booking> {
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }

        let clinic: Option<(Option<f64>, Option<f64>)> =
            sqlx::query_as("SELECT lat, lng FROM provider_profiles WHERE id = $1")
                .bind(booking.provider_id)
                .fetch_optional(pool)
                .await?;
        let (Some(clinic_lat), Some(clinic_lng)) = clinic.unwrap_or((None, None)) else {
            return Err(ApiError::Conflict(
                "Ce prestataire n'a pas de localisation enregistrée.".into(),
            ));
        };

        let distance = haversine_km(lat, lng, clinic_lat, clinic_lng);
        if distance > CHECKIN_MAX_DISTANCE_KM {
            return Err(ApiError::invalid(format!(
                "Vous êtes à {distance:.2} km de la clinique, le check-in fonctionne à moins de 500 m."
            )));
        }

        sqlx::query(
            "UPDATE bookings SET checkin_at = $1, checkin_lat = $2, checkin_lng = $3 WHERE id = $4",
        )
        .bind(Utc::now())
        .bind(lat)
        .bind(lng)
        .bind(booking_id)
        .execute(pool)
        .await?;

        if booking.status == BookingStatus::AwaitingConfirmation {
            return Self::client_attest(pool, config, user_id, booking_id, ConfirmationMethod::Proximity)
                .await;
        }
        fetch_booking(pool, booking_id).await
    }

    /// Client requests a one-time code to read out at the clinic.
    pub async fn request_visit_otp(
        pool: &PgPool,
        user_id: Uuid,
        booking_id: Uuid,
    ) -> ApiResult<Value> {
        let booking = fetch_booking(pool, booking_id).await?;
        if booking.user_id != user_id {
            return Err(ApiError::forbidden("Cette réservation ne vous appartient pas."));
        }
        if booking.status.is_terminal() {
            return Err(ApiError::Conflict("Cette réservation est déjà clôturée.".into()));
        }

        let code = generate_otp();
        let expires_at = Utc::now() + Duration::minutes(OTP_TTL_MINUTES);
        sqlx::query("UPDATE bookings SET otp_code = $1, otp_expires_at = $2 WHERE id = $3")
            .bind(&code)
            .bind(expires_at)
            .bind(booking_id)
            .execute(pool)
            .await?;

        Ok(json!({ "otp": code, "expires_at": expires_at }))
    }

    /// Provider validates the code the client read out. Single use; three
    /// wrong codes lock the booking out for a while.
    pub async fn validate_visit_otp(
        pool: &PgPool,
        config: &Config,
        redis: &mut redis::aio::MultiplexedConnection,
        pro_user_id: Uuid,
        booking_id: Uuid,
        code: &str,
    ) -> ApiResult<Booking> {
        let booking = Self::owned_by_pro(pool, pro_user_id, booking_id).await?;
        otp_limit::check_not_locked(redis, booking_id, OTP_PHASE_VISIT).await?;

        let valid = matches!(
            (&booking.otp_code, booking.otp_expires_at),
            (Some(stored), Some(expires)) if stored == code.trim() && expires > Utc::now()
        );
        if !valid {
            otp_limit::record_failure(redis, booking_id, OTP_PHASE_VISIT).await?;
            return Err(ApiError::invalid("Code invalide ou expiré"));
        }

        otp_limit::clear(redis, booking_id, OTP_PHASE_VISIT).await?;
        sqlx::query("UPDATE bookings SET otp_code = NULL, otp_expires_at = NULL WHERE id = $1")
            .bind(booking_id)
            .execute(pool)
            .await?;

        Self::advance_by_pro(pool, config, &booking, ConfirmationMethod::Otp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        assert!(haversine_km(36.7538, 3.0588, 36.7538, 3.0588) < 1e-9);
    }

    #[test]
    fn haversine_known_distance() {
        // Algiers to Oran, roughly 355 km.
        let d = haversine_km(36.7538, 3.0588, 35.6971, -0.6308);
        assert!((330.0..380.0).contains(&d), "got {d}");
    }

    #[test]
    fn checkin_threshold_is_five_hundred_meters() {
        let clinic = (36.7538, 3.0588);
        // ~300 m north.
        let near = (36.7565, 3.0588);
        // ~1.1 km north.
        let far = (36.7638, 3.0588);
        assert!(haversine_km(near.0, near.1, clinic.0, clinic.1) <= CHECKIN_MAX_DISTANCE_KM);
        assert!(haversine_km(far.0, far.1, clinic.0, clinic.1) > CHECKIN_MAX_DISTANCE_KM);
    }

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..100 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(!code.starts_with('0'));
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
