use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

const MAX_FAILURES: u64 = 3;
const FAILURE_WINDOW_SECS: u64 = 900;
const LOCKOUT_SECS: u64 = 900;

fn failure_key(booking_id: Uuid, phase: &str) -> String {
    format!("otp:fail:{booking_id}:{phase}")
}

fn lockout_key(booking_id: Uuid, phase: &str) -> String {
    format!("otp:lock:{booking_id}:{phase}")
}

/// The third consecutive failure arms the lockout.
fn lockout_armed(failure_count: u64) -> bool {
    failure_count >= MAX_FAILURES
}

/// Any live TTL on the lockout key blocks the attempt. The check runs
/// before the code comparison, so a locked booking rejects even a
/// correct code until the TTL lapses.
fn lockout_active(ttl_secs: i64) -> bool {
    ttl_secs > 0
}

fn lockout_minutes_left(ttl_secs: i64) -> i64 {
    (ttl_secs + 59) / 60
}

/// Rejects the attempt while a lockout is active for this booking/phase.
pub async fn check_not_locked(
    redis: &mut redis::aio::MultiplexedConnection,
    booking_id: Uuid,
    phase: &str,
) -> ApiResult<()> {
    let ttl: i64 = redis::cmd("TTL")
        .arg(lockout_key(booking_id, phase))
        .query_async(redis)
        .await
        .unwrap_or(-2);

    if lockout_active(ttl) {
        let minutes = lockout_minutes_left(ttl);
        return Err(ApiError::RateLimited(format!(
            "Trop de codes incorrects. Réessayez dans {minutes} minute(s)."
        )));
    }
    Ok(())
}

/// Counts a failed attempt. The third failure inside the window arms a
/// lockout; counter and lockout both expire on their own.
pub async fn record_failure(
    redis: &mut redis::aio::MultiplexedConnection,
    booking_id: Uuid,
    phase: &str,
) -> ApiResult<()> {
    let key = failure_key(booking_id, phase);
    let count: u64 = redis::cmd("INCR")
        .arg(&key)
        .query_async(redis)
        .await
        .unwrap_or(0);

    if count == 1 {
        // TTL only on first increment so retries do not extend the window
        let _: Result<(), _> = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(FAILURE_WINDOW_SECS)
            .query_async(redis)
            .await;
    }

    if lockout_armed(count) {
        let _: Result<(), _> = redis::cmd("SETEX")
            .arg(lockout_key(booking_id, phase))
            .arg(LOCKOUT_SECS)
            .arg(1)
            .query_async(redis)
            .await;
        tracing::warn!("otp lockout armed for booking {booking_id} phase {phase}");
    }

    Ok(())
}

/// Successful validation wipes the counter and any pending lockout.
pub async fn clear(
    redis: &mut redis::aio::MultiplexedConnection,
    booking_id: Uuid,
    phase: &str,
) -> ApiResult<()> {
    let _: Result<(), _> = redis::cmd("DEL")
        .arg(failure_key(booking_id, phase))
        .arg(lockout_key(booking_id, phase))
        .query_async(redis)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_failure_arms_the_lockout() {
        assert!(!lockout_armed(1));
        assert!(!lockout_armed(2));
        assert!(lockout_armed(3));
        assert!(lockout_armed(4));
    }

    #[test]
    fn live_lockout_rejects_even_a_correct_code() {
        // check_not_locked runs before any code comparison, so a fourth
        // attempt with the right code still bounces while the TTL lives.
        assert!(lockout_active(LOCKOUT_SECS as i64));
        assert!(lockout_active(1));
        // Expired or missing key (TTL -1/-2) lets attempts through again.
        assert!(!lockout_active(0));
        assert!(!lockout_active(-1));
        assert!(!lockout_active(-2));
    }

    #[test]
    fn lockout_message_rounds_minutes_up() {
        assert_eq!(lockout_minutes_left(900), 15);
        assert_eq!(lockout_minutes_left(61), 2);
        assert_eq!(lockout_minutes_left(1), 1);
    }
}
