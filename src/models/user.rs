use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Client,
    Pro,
    Admin,
}

/// Three-state trust classification gating booking privileges.
/// Admin ban/suspension are orthogonal flags on the user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustStatus {
    New,
    Verified,
    Restricted,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub role: UserRole,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub trust_status: TrustStatus,
    pub no_show_count: i32,
    pub restricted_until: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub is_banned: bool,
    pub suspended_until: Option<DateTime<Utc>>,
    /// The one booking a NEW user has already rescheduled, if any.
    pub last_modified_booking: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let name = name.trim().to_string();
        if name.is_empty() {
            "Client".to_string()
        } else {
            name
        }
    }
}
