use pipeline_orchestrator::config::CircuitBreakerConfig;
use pipeline_orchestrator::resilience::{Admission, BreakerStatus, CircuitBreakers};
use pipeline_orchestrator::AppError;

fn breakers(failure_threshold: u32, open_seconds: u64) -> CircuitBreakers {
    CircuitBreakers::new(&CircuitBreakerConfig {
        failure_threshold,
        open_seconds,
    })
}

fn transient() -> AppError {
    AppError::Transient("503".into())
}

#[test]
fn unknown_dependency_is_closed() {
    let breakers = breakers(3, 60);
    assert_eq!(breakers.status("scraper"), BreakerStatus::Closed);
    assert_eq!(breakers.failure_count("scraper"), 0);
    assert_eq!(
        breakers.acquire("scraper").expect("closed breaker admits"),
        Admission::Normal
    );
}

#[test]
fn opens_after_threshold_consecutive_failures() {
    let breakers = breakers(3, 60);
    for _ in 0..2 {
        breakers.record("scraper", Err(&transient()));
    }
    assert_eq!(breakers.status("scraper"), BreakerStatus::Closed);
    assert_eq!(breakers.failure_count("scraper"), 2);

    breakers.record("scraper", Err(&transient()));
    assert_eq!(breakers.status("scraper"), BreakerStatus::Open);
    assert!(matches!(
        breakers.acquire("scraper"),
        Err(AppError::CircuitOpen(_))
    ));
}

#[test]
fn breakers_are_independent_per_dependency() {
    let breakers = breakers(1, 60);
    breakers.record("scraper", Err(&transient()));
    assert_eq!(breakers.status("scraper"), BreakerStatus::Open);
    breakers.acquire("analyzer").expect("other dependency unaffected");
}

#[test]
fn rate_limit_opens_immediately() {
    let breakers = breakers(5, 60);
    breakers
        .record("collector", Err(&AppError::RateLimited("429".into())));
    assert_eq!(breakers.status("collector"), BreakerStatus::Open);
}

#[test]
fn success_and_permanent_errors_reset_the_count() {
    let breakers = breakers(3, 60);
    breakers.record("scraper", Err(&transient()));
    breakers.record("scraper", Err(&transient()));
    breakers
        .record("scraper", Err(&AppError::Permanent("404".into())));
    assert_eq!(breakers.failure_count("scraper"), 0);

    breakers.record("scraper", Err(&transient()));
    breakers.record("scraper", Ok(()));
    assert_eq!(breakers.failure_count("scraper"), 0);
}

#[test]
fn half_open_admits_one_trial() {
    let breakers = breakers(1, 0);
    breakers.record("scraper", Err(&transient()));
    assert_eq!(breakers.status("scraper"), BreakerStatus::HalfOpen);

    assert_eq!(
        breakers.acquire("scraper").expect("trial admitted"),
        Admission::Trial
    );
    assert!(matches!(
        breakers.acquire("scraper"),
        Err(AppError::CircuitOpen(_))
    ));

    breakers.record("scraper", Ok(()));
    assert_eq!(breakers.status("scraper"), BreakerStatus::Closed);
}

#[test]
fn reset_closes_an_open_breaker() {
    let breakers = breakers(2, 60);
    breakers.record("scraper", Err(&transient()));
    breakers.record("scraper", Err(&transient()));
    assert_eq!(breakers.status("scraper"), BreakerStatus::Open);

    breakers.reset("scraper");
    assert_eq!(breakers.status("scraper"), BreakerStatus::Closed);
    breakers.acquire("scraper").expect("admitted after reset");
}

#[test]
fn failed_trial_reopens() {
    let breakers = breakers(1, 0);
    breakers.record("scraper", Err(&transient()));
    breakers.acquire("scraper").expect("trial admitted");
    breakers.record("scraper", Err(&transient()));
    assert_eq!(breakers.failure_count("scraper"), 1);
    assert_ne!(breakers.status("scraper"), BreakerStatus::Closed);
}

#[test]
fn released_trial_admits_the_next_call() {
    let breakers = breakers(1, 0);
    breakers.record("scraper", Err(&transient()));
    breakers.acquire("scraper").expect("trial admitted");
    breakers.release_trial("scraper");
    assert_eq!(
        breakers.acquire("scraper").expect("slot released"),
        Admission::Trial
    );
}

#[test]
fn releasing_without_a_trial_changes_nothing() {
    let breakers = breakers(2, 60);
    breakers.record("scraper", Err(&transient()));
    breakers.release_trial("scraper");
    assert_eq!(breakers.failure_count("scraper"), 1);
    assert_eq!(breakers.status("scraper"), BreakerStatus::Closed);
}
