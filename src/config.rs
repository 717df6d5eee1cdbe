use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub fcm_api_key: Option<String>,
    /// Platform commission withheld per completed vet booking (DA),
    /// used when the provider has no per-provider override.
    pub commission_da: i64,
    /// Daycare late-fee fallback rates (DA), used when the provider has
    /// not configured its own.
    pub late_fee_hourly_rate_da: i64,
    pub late_fee_daily_rate_da: i64,
    /// IANA timezone assumed for providers that never set one.
    pub default_timezone: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            jwt_secret: required("JWT_SECRET")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            fcm_api_key: env::var("FCM_API_KEY").ok().filter(|s| !s.is_empty()),
            commission_da: env::var("APP_COMMISSION_DA")
                .unwrap_or_else(|_| "100".into())
                .parse()?,
            late_fee_hourly_rate_da: env::var("LATE_FEE_HOURLY_RATE_DA")
                .unwrap_or_else(|_| "200".into())
                .parse()?,
            late_fee_daily_rate_da: env::var("LATE_FEE_DAILY_RATE_DA")
                .unwrap_or_else(|_| "1500".into())
                .parse()?,
            default_timezone: env::var("DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| "Africa/Algiers".into()),
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
