use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    models::{
        auth::AuthenticatedUser,
        booking::{
            CheckinRequest, CreateBookingRequest, OtpValidateRequest, ProConfirmRequest,
            ReferenceCodeRequest, RescheduleRequest, UpdateStatusRequest, ValidateRequest,
        },
        user::UserRole,
    },
    routes::require_role,
    services::{
        bookings::BookingService, confirmation::ConfirmationService, medical::MedicalService,
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgendaQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateBookingRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let booking = BookingService::create(
        &state.db,
        &state.config,
        user.user_id,
        body.service_id,
        body.scheduled_at,
        &body.pet_ids,
    )
    .await?;

    if let Ok(Some(pro_user)) = sqlx::query_scalar::<_, Uuid>(
        "SELECT user_id FROM provider_profiles WHERE id = $1",
    )
    .bind(booking.provider_id)
    .fetch_optional(&state.db)
    .await
    {
        state
            .notifications
            .notify_user(
                &state.db,
                pro_user,
                "Nouvelle demande de réservation",
                &format!("Un client a demandé le {}", booking.scheduled_at.format("%d/%m %H:%M")),
                Some(json!({ "booking_id": booking.id })),
            )
            .await;
    }

    Ok(Json(json!({ "booking": booking })))
}

pub async fn list_mine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    let rows = BookingService::list_mine(&state.db, user.user_id).await?;
    Ok(Json(json!({ "bookings": rows })))
}

pub async fn get_one(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let booking = BookingService::get_mine(&state.db, user.user_id, id).await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn reschedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<RescheduleRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let booking =
        BookingService::reschedule(&state.db, &state.config, user.user_id, id, body.scheduled_at)
            .await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn cancel(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let booking =
        BookingService::cancel(&state.db, user.user_id, id, body.reason.as_deref()).await?;
    Ok(Json(json!({ "booking": booking })))
}

/// Provider accepts, completes or cancels.
pub async fn set_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let booking =
        BookingService::provider_set_status(&state.db, &state.config, user.user_id, id, body.status)
            .await?;
    state
        .notifications
        .notify_user(
            &state.db,
            booking.user_id,
            "Mise à jour de la réservation",
            &format!("Votre réservation est maintenant {:?}", booking.status),
            Some(json!({ "booking_id": booking.id })),
        )
        .await;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn pro_confirm(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<ProConfirmRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let booking =
        ConfirmationService::pro_confirm(&state.db, &state.config, user.user_id, id, body.method)
            .await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn confirm_by_code(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<ReferenceCodeRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let payload = ConfirmationService::confirm_by_reference_code(
        &state.db,
        &state.config,
        user.user_id,
        &body.reference_code,
    )
    .await?;
    Ok(Json(payload))
}

pub async fn client_confirm(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let booking =
        ConfirmationService::client_confirm(&state.db, &state.config, user.user_id, id).await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn pro_validate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<ValidateRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let booking = ConfirmationService::pro_validate(
        &state.db,
        &state.config,
        user.user_id,
        id,
        body.approved,
        body.note.as_deref(),
    )
    .await?;
    state
        .notifications
        .notify_user(
            &state.db,
            booking.user_id,
            "Mise à jour de la réservation",
            &format!("Votre réservation est maintenant {:?}", booking.status),
            Some(json!({ "booking_id": booking.id })),
        )
        .await;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn checkin(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CheckinRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let booking = ConfirmationService::client_checkin(
        &state.db,
        &state.config,
        user.user_id,
        id,
        body.lat,
        body.lng,
    )
    .await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn request_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let payload = ConfirmationService::request_visit_otp(&state.db, user.user_id, id).await?;
    Ok(Json(payload))
}

pub async fn validate_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<OtpValidateRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let mut redis = state.redis.clone();
    let booking = ConfirmationService::validate_visit_otp(
        &state.db,
        &state.config,
        &mut redis,
        user.user_id,
        id,
        &body.code,
    )
    .await?;
    Ok(Json(json!({ "booking": booking })))
}

pub async fn agenda(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(q): Query<AgendaQuery>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = BookingService::provider_agenda(&state.db, user.user_id, q.from, q.to).await?;
    Ok(Json(json!({ "bookings": rows })))
}

pub async fn pending_validations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = BookingService::pending_validations(&state.db, user.user_id).await?;
    Ok(Json(json!({ "bookings": rows })))
}

/// Administrative cancellation, the only way out of a dispute.
pub async fn admin_cancel(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Admin)?;
    let booking = BookingService::admin_cancel(&state.db, &state.config, id).await?;
    Ok(Json(json!({ "booking": booking })))
}

/// Pets behind a redeemed reference code, for the visit window.
pub async fn pets_by_access_token(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(token): Path<String>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let payload = MedicalService::pets_for_token(&state.db, &token).await?;
    Ok(Json(payload))
}
