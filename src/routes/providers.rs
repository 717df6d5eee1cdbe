use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    models::{
        auth::AuthenticatedUser,
        availability::{AddTimeOffRequest, SetWeeklyRequest, SlotsQuery},
        user::UserRole,
    },
    routes::require_role,
    services::{availability::AvailabilityService, earnings::EarningsService},
    AppState,
};

pub async fn get_weekly(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = AvailabilityService::list_weekly(&state.db, user.user_id).await?;
    Ok(Json(json!({ "entries": rows })))
}

pub async fn set_weekly(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<SetWeeklyRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let count = AvailabilityService::set_weekly(
        &state.db,
        user.user_id,
        &body.entries,
        body.timezone.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "saved": count })))
}

pub async fn list_time_offs(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let rows = AvailabilityService::list_time_offs(&state.db, user.user_id).await?;
    Ok(Json(json!({ "time_offs": rows })))
}

pub async fn add_time_off(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<AddTimeOffRequest>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let row = AvailabilityService::add_time_off(
        &state.db,
        user.user_id,
        body.starts_at,
        body.ends_at,
        body.reason.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "time_off": row })))
}

pub async fn delete_time_off(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    AvailabilityService::delete_time_off(&state.db, user.user_id, id).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// Public: free slots for a provider's booking page.
pub async fn public_slots(
    State(state): State<AppState>,
    Path(provider_id): Path<Uuid>,
    Query(q): Query<SlotsQuery>,
) -> ApiResult<Json<Value>> {
    let slots = AvailabilityService::public_slots(
        &state.db,
        provider_id,
        q.from,
        q.to,
        q.step_min.unwrap_or(30),
        q.duration_min,
        &state.config.default_timezone,
    )
    .await?;
    Ok(Json(json!({ "slots": slots })))
}

pub async fn my_earnings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Pro)?;
    let provider_id =
        crate::services::bookings::provider_id_for_user(&state.db, user.user_id).await?;
    let payload = EarningsService::my_earnings(&state.db, provider_id).await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct MonthQuery {
    pub year: i32,
    pub month: u32,
}

pub async fn collect_month(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(q): Query<MonthQuery>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Admin)?;
    let count = EarningsService::collect_month(&state.db, q.year, q.month).await?;
    Ok(Json(json!({ "collected": count })))
}

pub async fn uncollect_month(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(q): Query<MonthQuery>,
) -> ApiResult<Json<Value>> {
    require_role(&user, UserRole::Admin)?;
    let count = EarningsService::uncollect_month(&state.db, q.year, q.month).await?;
    Ok(Json(json!({ "reverted": count })))
}
