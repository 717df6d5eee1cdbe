use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{error::ApiResult, AppState};

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({ "status": "ok" })))
}
