use chrono::{DateTime, TimeZone, Utc, Weekday};
use pipeline_orchestrator::models::schedule::Recurrence;
use pipeline_orchestrator::scheduler::recurrence::{next_after, parse_cron};
use pipeline_orchestrator::AppError;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid time")
}

#[test]
fn daily_rolls_to_tomorrow_once_passed() {
    let rule = Recurrence::Daily { hour: 2, minute: 0 };
    assert_eq!(
        next_after(&rule, utc(2024, 1, 1, 3, 0)).expect("next"),
        utc(2024, 1, 2, 2, 0)
    );
    assert_eq!(
        next_after(&rule, utc(2024, 1, 1, 1, 59)).expect("next"),
        utc(2024, 1, 1, 2, 0)
    );
}

#[test]
fn next_is_strictly_after_now() {
    let rule = Recurrence::Daily { hour: 2, minute: 0 };
    let now = utc(2024, 1, 1, 2, 0);
    assert_eq!(next_after(&rule, now).expect("next"), utc(2024, 1, 2, 2, 0));
}

#[test]
fn monthly_handles_leap_february() {
    let rule = Recurrence::Monthly {
        day: 29,
        hour: 12,
        minute: 0,
    };
    assert_eq!(
        next_after(&rule, utc(2024, 1, 30, 0, 0)).expect("next"),
        utc(2024, 2, 29, 12, 0)
    );
    assert_eq!(
        next_after(&rule, utc(2023, 1, 30, 0, 0)).expect("next"),
        utc(2023, 3, 29, 12, 0)
    );
}

#[test]
fn weekly_same_day_after_time_rolls_a_week() {
    // 2024-01-01 is a Monday.
    let rule = Recurrence::Weekly {
        weekday: Weekday::Mon,
        hour: 2,
        minute: 0,
    };
    assert_eq!(
        next_after(&rule, utc(2024, 1, 1, 3, 0)).expect("next"),
        utc(2024, 1, 8, 2, 0)
    );
    assert_eq!(
        next_after(&rule, utc(2024, 1, 1, 1, 0)).expect("next"),
        utc(2024, 1, 1, 2, 0)
    );
}

#[test]
fn monthly_skips_short_months() {
    let rule = Recurrence::Monthly {
        day: 31,
        hour: 0,
        minute: 0,
    };
    assert_eq!(
        next_after(&rule, utc(2024, 1, 31, 1, 0)).expect("next"),
        utc(2024, 3, 31, 0, 0)
    );
}

#[test]
fn quarterly_uses_quarter_starts() {
    let rule = Recurrence::Quarterly {
        day: 1,
        hour: 6,
        minute: 30,
    };
    assert_eq!(
        next_after(&rule, utc(2024, 2, 15, 0, 0)).expect("next"),
        utc(2024, 4, 1, 6, 30)
    );
    assert_eq!(
        next_after(&rule, utc(2024, 11, 1, 0, 0)).expect("next"),
        utc(2025, 1, 1, 6, 30)
    );
}

#[test]
fn cron_uses_five_fields() {
    let rule = Recurrence::Cron {
        expression: "30 6 * * *".into(),
    };
    assert_eq!(
        next_after(&rule, utc(2024, 5, 1, 7, 0)).expect("next"),
        utc(2024, 5, 2, 6, 30)
    );
}

#[test]
fn malformed_cron_is_a_config_error() {
    for expression in ["* * * *", "0 0 * * * *", "61 * * * *", "every day"] {
        assert!(
            matches!(parse_cron(expression), Err(AppError::Config(_))),
            "{expression}"
        );
    }
}
