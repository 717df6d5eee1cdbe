use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{delete, get, post, put},
    Extension, Router,
};
use redis::Client as RedisClient;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vetgo_api::{
    config::Config,
    db,
    middleware::auth::JwtSecret,
    routes,
    services::{notifications::NotificationService, sweep},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = RedisClient::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    let notifications = Arc::new(NotificationService::new(config.fcm_api_key.clone()));

    let state = AppState {
        db: pool.clone(),
        redis: redis_conn,
        config: config.clone(),
        notifications,
    };

    sweep::start(pool);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(routes::health::health))
        // provider schedule
        .route("/pro/availability", get(routes::providers::get_weekly))
        .route("/pro/availability", put(routes::providers::set_weekly))
        .route("/pro/time-offs", get(routes::providers::list_time_offs))
        .route("/pro/time-offs", post(routes::providers::add_time_off))
        .route("/pro/time-offs/{id}", delete(routes::providers::delete_time_off))
        .route("/providers/{id}/slots", get(routes::providers::public_slots))
        // earnings
        .route("/pro/earnings", get(routes::providers::my_earnings))
        .route("/admin/earnings/collect", post(routes::providers::collect_month))
        .route("/admin/earnings/uncollect", post(routes::providers::uncollect_month))
        .route("/admin/bookings/{id}/cancel", post(routes::bookings::admin_cancel))
        // vet bookings
        .route("/bookings", post(routes::bookings::create))
        .route("/bookings", get(routes::bookings::list_mine))
        .route("/bookings/{id}", get(routes::bookings::get_one))
        .route("/bookings/{id}/reschedule", put(routes::bookings::reschedule))
        .route("/bookings/{id}/cancel", post(routes::bookings::cancel))
        .route("/bookings/{id}/status", put(routes::bookings::set_status))
        .route("/bookings/{id}/confirm", post(routes::bookings::pro_confirm))
        .route("/bookings/confirm-by-code", post(routes::bookings::confirm_by_code))
        .route("/bookings/{id}/client-confirm", post(routes::bookings::client_confirm))
        .route("/bookings/{id}/validate", post(routes::bookings::pro_validate))
        .route("/bookings/{id}/checkin", post(routes::bookings::checkin))
        .route("/bookings/{id}/otp", post(routes::bookings::request_otp))
        .route("/bookings/{id}/otp/validate", post(routes::bookings::validate_otp))
        .route("/pro/agenda", get(routes::bookings::agenda))
        .route("/pro/validations", get(routes::bookings::pending_validations))
        .route("/pets/access/{token}", get(routes::bookings::pets_by_access_token))
        // daycare stays
        .route("/daycare", post(routes::daycare::create))
        .route("/daycare", get(routes::daycare::list_mine))
        .route("/daycare/{id}/cancel", post(routes::daycare::cancel))
        .route("/daycare/{id}/status", put(routes::daycare::set_status))
        .route("/daycare/{id}/confirm/{phase}", post(routes::daycare::phase_confirm))
        .route("/daycare/{id}/validate/{phase}", post(routes::daycare::phase_validate))
        .route("/daycare/{id}/otp/{phase}", post(routes::daycare::request_otp))
        .route("/daycare/{id}/otp-validate", post(routes::daycare::validate_otp))
        .route("/daycare/{id}/late-fee", post(routes::daycare::decide_late_fee))
        .route("/pro/daycare/calendar", get(routes::daycare::calendar))
        .route("/pro/daycare/validations", get(routes::daycare::pending_validations))
        .layer(Extension(JwtSecret(config.jwt_secret.clone())))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
