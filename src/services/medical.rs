use chrono::{Duration, Utc};
use rand::RngCore;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

const PET_ACCESS_TOKEN_HOURS: i64 = 24;

pub struct MedicalService;

impl MedicalService {
    /// On completion of a vet visit, open a medical record for each pet on
    /// the booking so the practitioner can fill it in afterwards.
    pub async fn create_visit_records(
        pool: &PgPool,
        booking_id: Uuid,
        provider_id: Uuid,
        pet_ids: &[Uuid],
        summary: &str,
    ) -> ApiResult<()> {
        for pet_id in pet_ids {
            sqlx::query(
                "INSERT INTO medical_records
                     (id, pet_id, booking_id, provider_id, summary, created_at)
                 VALUES ($1, $2, $3, $4, $5, NOW())
                 ON CONFLICT (booking_id, pet_id) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(pet_id)
            .bind(booking_id)
            .bind(provider_id)
            .bind(summary)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Daycare drop-off opens one record for the stay's pet.
    pub async fn create_daycare_record(
        pool: &PgPool,
        daycare_booking_id: Uuid,
        provider_id: Uuid,
        pet_id: Uuid,
        summary: &str,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO medical_records
                 (id, pet_id, daycare_booking_id, provider_id, summary, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (daycare_booking_id, pet_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(pet_id)
        .bind(daycare_booking_id)
        .bind(provider_id)
        .bind(summary)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Short-lived token letting the provider read the pets' history for
    /// the duration of the visit.
    pub async fn mint_pet_access_token(
        pool: &PgPool,
        booking_id: Uuid,
        provider_id: Uuid,
    ) -> ApiResult<Value> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let expires_at = Utc::now() + Duration::hours(PET_ACCESS_TOKEN_HOURS);

        sqlx::query(
            "INSERT INTO pet_access_tokens (id, token, booking_id, provider_id, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(&token)
        .bind(booking_id)
        .bind(provider_id)
        .bind(expires_at)
        .execute(pool)
        .await?;

        Ok(json!({ "pet_access_token": token, "expires_at": expires_at }))
    }

    /// Resolves a token to the pets it covers, rejecting expired ones.
    pub async fn pets_for_token(pool: &PgPool, token: &str) -> ApiResult<Value> {
        #[derive(sqlx::FromRow)]
        struct TokenRow {
            booking_id: Uuid,
            expires_at: chrono::DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT booking_id, expires_at FROM pet_access_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("Jeton d'accès"))?;

        if row.expires_at <= Utc::now() {
            return Err(ApiError::forbidden("Ce jeton d'accès a expiré."));
        }

        let pets = sqlx::query_as::<_, crate::models::provider::Pet>(
            "SELECT p.* FROM pets p
             JOIN bookings b ON p.id = ANY(b.pet_ids)
             WHERE b.id = $1",
        )
        .bind(row.booking_id)
        .fetch_all(pool)
        .await?;

        Ok(json!({ "booking_id": row.booking_id, "pets": pets }))
    }
}
