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
        daycare::{
            CreateDaycareBookingRequest, DaycareOtpRequest, DaycarePhase, LateFeeDecisionRequest,
            PhaseConfirmRequest, PhaseValidateRequest, UpdateDaycareStatusRequest,
        },
        user::UserRole,
    },
    routes::require_role,
    services::daycare::DaycareService,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateDaycareBookingRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let stay = DaycareService::create(
        &state.db,
        &state.config,
        user.user_id,
        body.provider_id,
        body.pet_id,
        body.start_date,
        body.end_date,
        body.price_da,
        body.notes.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn list_mine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    let rows = DaycareService::list_mine(&state.db, user.user_id).await?;
    Ok(Json(json!({ "bookings": rows })))
}

pub async fn cancel(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let stay = DaycareService::cancel(&state.db, user.user_id, id, body.reason.as_deref()).await?;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn set_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDaycareStatusRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let stay =
        DaycareService::provider_set_status(&state.db, user.user_id, id, body.status).await?;
    state
        .notifications
        .notify_user(
            &state.db,
            stay.user_id,
            "Mise à jour garderie",
            &format!("Votre séjour est maintenant {:?}", stay.status),
            Some(json!({ "daycare_booking_id": stay.id })),
        )
        .await;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn phase_confirm(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, phase)): Path<(Uuid, DaycarePhase)>,
    Json(body): Json<PhaseConfirmRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let stay = DaycareService::client_phase_confirm(
        &state.db,
        user.user_id,
        id,
        phase,
        body.lat,
        body.lng,
    )
    .await?;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn phase_validate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, phase)): Path<(Uuid, DaycarePhase)>,
    Json(body): Json<PhaseValidateRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let stay = DaycareService::pro_phase_validate(
        &state.db,
        &state.config,
        user.user_id,
        id,
        phase,
        body.approved,
    )
    .await?;
    state
        .notifications
        .notify_user(
            &state.db,
            stay.user_id,
            "Mise à jour garderie",
            &format!("Votre séjour est maintenant {:?}", stay.status),
            Some(json!({ "daycare_booking_id": stay.id })),
        )
        .await;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn request_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, phase)): Path<(Uuid, DaycarePhase)>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Client)?;
    let payload = DaycareService::request_phase_otp(&state.db, user.user_id, id, phase).await?;
    Ok(Json(payload))
}

pub async fn validate_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<DaycareOtpRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let mut redis = state.redis.clone();
    let stay = DaycareService::validate_phase_otp(
        &state.db,
        &state.config,
        &mut redis,
        user.user_id,
        id,
        body.phase,
        &body.code,
    )
    .await?;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn decide_late_fee(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<LateFeeDecisionRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let stay = DaycareService::decide_late_fee(
        &state.db,
        user.user_id,
        id,
        body.accept,
        body.note.as_deref(),
    )
    .await?;
    state
        .notifications
        .notify_user(
            &state.db,
            stay.user_id,
            "Frais de retard",
            &match stay.late_fee_status {
                Some(crate::models::daycare::LateFeeStatus::Accepted) => format!(
                    "Des frais de retard de {} DA ont été ajoutés à votre séjour.",
                    stay.late_fee_da.unwrap_or(0)
                ),
                _ => "Vos frais de retard ont été annulés.".to_string(),
            },
            Some(json!({ "daycare_booking_id": stay.id })),
        )
        .await;
    Ok(Json(json!({ "booking": stay })))
}

pub async fn calendar(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(q): Query<CalendarQuery>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = DaycareService::provider_calendar(&state.db, user.user_id, q.from, q.to).await?;
    Ok(Json(json!({ "bookings": rows })))
}

pub async fn pending_validations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = DaycareService::pending_validations(&state.db, user.user_id).await?;
    Ok(Json(json!({ "bookings": rows })))
}
