use gpugate::retry::{next_retry_time_ms, RetryPolicy};

fn policy(attempts: u32, initial: i64, max: Option<i64>, factor: f64) -> RetryPolicy {
    RetryPolicy {
        attempts,
        initial_interval_ms: initial,
        max_interval_ms: max,
        backoff_factor: factor,
    }
}

#[test]
fn single_attempt_policy_never_retries() {
    let policy = policy(1, 1_000, None, 2.0);
    assert!(policy.is_last_attempt(1));
    assert_eq!(next_retry_time_ms(1_000_000, 1, &policy), None);
}

#[test]
fn next_retry_basic_exponential() {
    let policy = policy(5, 1_000, None, 2.0);
    // first failure -> +1000ms
    assert_eq!(next_retry_time_ms(1_000_000, 1, &policy), Some(1_001_000));
    // second failure -> +2000ms
    assert_eq!(next_retry_time_ms(1_000_000, 2, &policy), Some(1_002_000));
    // third failure -> +4000ms
    assert_eq!(next_retry_time_ms(1_000_000, 3, &policy), Some(1_004_000));
    // fifth attempt was the last
    assert_eq!(next_retry_time_ms(1_000_000, 5, &policy), None);
}

#[test]
fn next_retry_caps_at_max_interval() {
    let policy = policy(10, 1_000, Some(2_000), 10.0);
    // second failure would wait 10_000ms but is capped at 2_000ms
    assert_eq!(next_retry_time_ms(100, 2, &policy), Some(2_100));
}

#[test]
fn constant_backoff_with_factor_one() {
    let policy = policy(4, 250, None, 1.0);
    for attempt in 1..4 {
        assert_eq!(next_retry_time_ms(0, attempt, &policy), Some(250));
    }
}

#[test]
fn default_policy_allows_three_attempts() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.attempts, 3);
    assert!(!policy.is_last_attempt(2));
    assert!(policy.is_last_attempt(3));
}
