use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::booking::ConfirmationMethod;

/// Daycare-stay lifecycle: two attestation phases (drop-off, pickup)
/// instead of the single vet appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaycareStatus {
    Pending,
    Confirmed,
    PendingDropValidation,
    InProgress,
    PendingPickupValidation,
    Completed,
    Cancelled,
    Disputed,
}

impl DaycareStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Disputed)
    }

    pub fn can_transition(self, to: Self) -> bool {
        use DaycareStatus::*;
        match (self, to) {
            (Pending, Confirmed) | (Pending, Cancelled) => true,
            (Confirmed, PendingDropValidation)
            | (Confirmed, InProgress)
            | (Confirmed, Cancelled) => true,
            (PendingDropValidation, InProgress)
            | (PendingDropValidation, Disputed)
            | (PendingDropValidation, Cancelled) => true,
            (InProgress, PendingPickupValidation)
            | (InProgress, Completed)
            | (InProgress, Cancelled) => true,
            (PendingPickupValidation, Completed)
            | (PendingPickupValidation, Disputed)
            | (PendingPickupValidation, Cancelled) => true,
            (Disputed, Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Confirmed
                | Self::PendingDropValidation
                | Self::InProgress
                | Self::PendingPickupValidation
        )
    }
}

/// Which attestation of the stay an OTP or validation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaycarePhase {
    Drop,
    Pickup,
}

impl DaycarePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Pickup => "pickup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LateFeeStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DaycareBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: Uuid,
    pub pet_id: Uuid,
    /// Half-open stay interval; start_date < end_date enforced at creation.
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: DaycareStatus,
    pub price_da: i64,
    pub commission_da: i64,
    pub total_da: i64,
    pub notes: Option<String>,

    pub client_drop_confirmed_at: Option<DateTime<Utc>>,
    pub drop_confirmation_method: Option<ConfirmationMethod>,
    pub drop_checkin_lat: Option<f64>,
    pub drop_checkin_lng: Option<f64>,
    pub drop_otp_code: Option<String>,
    pub drop_otp_expires_at: Option<DateTime<Utc>>,
    pub actual_drop_off: Option<DateTime<Utc>>,

    pub client_pickup_confirmed_at: Option<DateTime<Utc>>,
    pub pickup_confirmation_method: Option<ConfirmationMethod>,
    pub pickup_checkin_lat: Option<f64>,
    pub pickup_checkin_lng: Option<f64>,
    pub pickup_otp_code: Option<String>,
    pub pickup_otp_expires_at: Option<DateTime<Utc>>,
    pub actual_pickup: Option<DateTime<Utc>>,

    pub client_nearby_at: Option<DateTime<Utc>>,

    pub late_fee_da: Option<i64>,
    pub late_fee_hours: Option<f64>,
    pub late_fee_status: Option<LateFeeStatus>,
    pub late_fee_note: Option<String>,
    pub late_fee_accepted_at: Option<DateTime<Utc>>,

    pub dispute_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// -------- request bodies --------

#[derive(Debug, Deserialize)]
pub struct CreateDaycareBookingRequest {
    pub provider_id: Uuid,
    pub pet_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub price_da: i64,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PhaseConfirmRequest {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PhaseValidateRequest {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct DaycareOtpRequest {
    pub code: String,
    pub phase: DaycarePhase,
}

#[derive(Debug, Deserialize)]
pub struct LateFeeDecisionRequest {
    pub accept: bool,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDaycareStatusRequest {
    pub status: DaycareStatus,
}

#[cfg(test)]
mod tests {
    use super::DaycareStatus::*;

    #[test]
    fn stay_follows_two_phase_path() {
        assert!(Pending.can_transition(Confirmed));
        assert!(Confirmed.can_transition(PendingDropValidation));
        assert!(PendingDropValidation.can_transition(InProgress));
        assert!(InProgress.can_transition(PendingPickupValidation));
        assert!(PendingPickupValidation.can_transition(Completed));
    }

    #[test]
    fn otp_paths_skip_pending_validation() {
        assert!(Confirmed.can_transition(InProgress));
        assert!(InProgress.can_transition(Completed));
    }

    #[test]
    fn no_regressions_or_phase_skips() {
        assert!(!InProgress.can_transition(Confirmed));
        assert!(!Confirmed.can_transition(Completed));
        assert!(!Confirmed.can_transition(PendingPickupValidation));
        assert!(!Completed.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Pending));
    }

    #[test]
    fn rejected_validation_disputes() {
        assert!(PendingDropValidation.can_transition(Disputed));
        assert!(PendingPickupValidation.can_transition(Disputed));
        assert!(Disputed.can_transition(Cancelled));
    }
}
