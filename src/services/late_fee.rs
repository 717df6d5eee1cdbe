use chrono::{DateTime, Utc};

/// Minutes past the scheduled pickup time before any fee accrues. The
/// grace window is also deducted from the billable time.
pub const LATE_PICKUP_GRACE_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateFeeQuote {
    pub fee_da: i64,
    pub billable_hours: i64,
    pub late_days: i64,
    pub remaining_hours: i64,
}

impl LateFeeQuote {
    const ZERO: LateFeeQuote = LateFeeQuote {
        fee_da: 0,
        billable_hours: 0,
        late_days: 0,
        remaining_hours: 0,
    };
}

/// Late-pickup fee for a daycare stay. Lateness inside the grace window is
/// free; beyond it every started hour past the grace bills, with full 24h
/// blocks billed at the daily rate instead of 24 hourly units.
pub fn calculate_late_fee(
    scheduled_end: DateTime<Utc>,
    actual_pickup: DateTime<Utc>,
    hourly_rate_da: i64,
    daily_rate_da: i64,
) -> LateFeeQuote {
    let late_minutes = (actual_pickup - scheduled_end).num_minutes();
    if late_minutes <= LATE_PICKUP_GRACE_MINUTES {
        return LateFeeQuote::ZERO;
    }

    // Full 24h blocks are split off on the raw minutes; only the
    // fractional remainder rounds up to started hours.
    let billable_minutes = late_minutes - LATE_PICKUP_GRACE_MINUTES;
    let late_days = billable_minutes / (24 * 60);
    let remaining_hours = (billable_minutes % (24 * 60) + 59) / 60;
    let billable_hours = late_days * 24 + remaining_hours;
    let fee_da = late_days * daily_rate_da + remaining_hours * hourly_rate_da;

    LateFeeQuote {
        fee_da,
        billable_hours,
        late_days,
        remaining_hours,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const HOURLY: i64 = 200;
    const DAILY: i64 = 1500;

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap()
    }

    fn quote(minutes_late: i64) -> LateFeeQuote {
        calculate_late_fee(end(), end() + Duration::minutes(minutes_late), HOURLY, DAILY)
    }

    #[test]
    fn on_time_and_grace_are_free() {
        for minutes in [0, 5, 15] {
            assert_eq!(quote(minutes).fee_da, 0, "{minutes} min late should be free");
        }
        let early = calculate_late_fee(end(), end() - Duration::minutes(30), HOURLY, DAILY);
        assert_eq!(early.fee_da, 0);
    }

    #[test]
    fn one_minute_past_grace_bills_a_full_hour() {
        let q = quote(16);
        assert_eq!(q.billable_hours, 1);
        assert_eq!(q.fee_da, HOURLY);
    }

    #[test]
    fn started_hours_round_up_after_grace() {
        // 75 min late = 60 billable minutes, exactly one hour.
        assert_eq!(quote(75).billable_hours, 1);
        assert_eq!(quote(75).fee_da, HOURLY);
        // One minute more starts the second hour.
        assert_eq!(quote(76).billable_hours, 2);
        assert_eq!(quote(76).fee_da, 2 * HOURLY);
    }

    #[test]
    fn partial_day_bills_hourly_until_a_full_block() {
        // 23h45 late = 23h30 billable: no full day yet, 24 started hours.
        let q = quote(23 * 60 + 45);
        assert_eq!(q.late_days, 0);
        assert_eq!(q.remaining_hours, 24);
        assert_eq!(q.fee_da, 24 * HOURLY);
    }

    #[test]
    fn full_days_bill_at_the_daily_rate() {
        let q = quote(24 * 60 + 15);
        assert_eq!(q.late_days, 1);
        assert_eq!(q.remaining_hours, 0);
        assert_eq!(q.fee_da, DAILY);

        let q = quote(26 * 60 + 15 + 10);
        assert_eq!(q.billable_hours, 27);
        assert_eq!(q.late_days, 1);
        assert_eq!(q.remaining_hours, 3);
        assert_eq!(q.fee_da, DAILY + 3 * HOURLY);
    }

    #[test]
    fn custom_rates_apply() {
        let q = calculate_late_fee(
            end(),
            end() + Duration::hours(25) + Duration::minutes(15),
            300,
            2000,
        );
        assert_eq!(q.fee_da, 2000 + 300);
    }
}
