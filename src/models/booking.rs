use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Vet-booking lifecycle. Transitions are validated centrally through
/// [`BookingStatus::can_transition`]; nothing else may flip a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    AwaitingConfirmation,
    PendingProValidation,
    Completed,
    Cancelled,
    Disputed,
    Expired,
}

impl BookingStatus {
    /// Terminal states accept no further transitions, with one exception:
    /// a DISPUTED booking may still be administratively cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Disputed | Self::Expired
        )
    }

    pub fn can_transition(self, to: Self) -> bool {
        use BookingStatus::*;
        match (self, to) {
            (Pending, Confirmed)
            | (Pending, Completed)
            | (Pending, Cancelled)
            | (Pending, AwaitingConfirmation)
            | (Pending, PendingProValidation) => true,
            (Confirmed, Completed)
            | (Confirmed, Cancelled)
            | (Confirmed, AwaitingConfirmation)
            | (Confirmed, PendingProValidation) => true,
            (AwaitingConfirmation, PendingProValidation)
            | (AwaitingConfirmation, Completed)
            | (AwaitingConfirmation, Cancelled)
            | (AwaitingConfirmation, Expired) => true,
            (PendingProValidation, Completed)
            | (PendingProValidation, Disputed)
            | (PendingProValidation, Cancelled)
            | (PendingProValidation, Expired) => true,
            (Disputed, Cancelled) => true,
            _ => false,
        }
    }

    /// Statuses that hold a slot against other bookings.
    pub fn blocks_slot(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Statuses counting as "active" for the NEW-user admission rule.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Confirmed | Self::AwaitingConfirmation | Self::PendingProValidation
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationMethod {
    QrScan,
    ReferenceCode,
    Simple,
    Auto,
    Otp,
    Proximity,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub status: BookingStatus,
    /// Short human-readable code (ex: VGC-A2B3C4), unique per booking.
    pub reference_code: String,
    pub confirmation_method: Option<ConfirmationMethod>,
    pub client_confirmed_at: Option<DateTime<Utc>>,
    pub pro_confirmed_at: Option<DateTime<Utc>>,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    pub pro_response_deadline: Option<DateTime<Utc>>,
    pub checkin_at: Option<DateTime<Utc>>,
    pub checkin_lat: Option<f64>,
    pub checkin_lng: Option<f64>,
    pub otp_code: Option<String>,
    pub otp_expires_at: Option<DateTime<Utc>>,
    /// Commission snapshot written at completion.
    pub commission_da: Option<i64>,
    pub dispute_note: Option<String>,
    pub cancellation_reason: Option<String>,
    pub pet_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

// -------- request bodies --------

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub service_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub pet_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
pub struct ProConfirmRequest {
    pub method: Option<ConfirmationMethod>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub approved: bool,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckinRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReferenceCodeRequest {
    pub reference_code: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpValidateRequest {
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn terminal_states_accept_nothing_but_admin_cancel() {
        for from in [Completed, Cancelled, Expired] {
            for to in [
                Pending,
                Confirmed,
                AwaitingConfirmation,
                PendingProValidation,
                Completed,
                Cancelled,
                Disputed,
                Expired,
            ] {
                assert!(!from.can_transition(to), "{from:?} -> {to:?} must be illegal");
            }
        }
        assert!(Disputed.can_transition(Cancelled));
        assert!(!Disputed.can_transition(Completed));
    }

    #[test]
    fn grace_period_is_monotonic() {
        // Once awaiting confirmation, a booking can never regress.
        assert!(!AwaitingConfirmation.can_transition(Pending));
        assert!(!AwaitingConfirmation.can_transition(Confirmed));
        assert!(!PendingProValidation.can_transition(Confirmed));
    }

    #[test]
    fn happy_paths_are_legal() {
        assert!(Pending.can_transition(Confirmed));
        assert!(Confirmed.can_transition(Completed));
        assert!(Confirmed.can_transition(AwaitingConfirmation));
        assert!(AwaitingConfirmation.can_transition(PendingProValidation));
        assert!(PendingProValidation.can_transition(Completed));
        assert!(PendingProValidation.can_transition(Disputed));
        assert!(AwaitingConfirmation.can_transition(Expired));
    }

    #[test]
    fn client_attestation_methods_have_a_wire_form() {
        assert_eq!(
            serde_json::to_string(&ConfirmationMethod::Proximity).unwrap(),
            "\"PROXIMITY\""
        );
        assert_eq!(
            serde_json::to_string(&ConfirmationMethod::Manual).unwrap(),
            "\"MANUAL\""
        );
    }

    #[test]
    fn only_pending_and_confirmed_block_slots() {
        assert!(Pending.blocks_slot());
        assert!(Confirmed.blocks_slot());
        for s in [
            AwaitingConfirmation,
            PendingProValidation,
            Completed,
            Cancelled,
            Disputed,
            Expired,
        ] {
            assert!(!s.blocks_slot());
        }
    }
}
