// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const NOW: f64 = 1_700_000_000.0;

fn state(id: &str, status: AccountStatus, used_percent: f64) -> AccountState {
    let mut state = AccountState::new(id, status);
    state.used_percent = Some(used_percent);
    state
}

fn balancer() -> Balancer {
    Balancer::new(BackoffSchedule::default())
}

async fn selected(balancer: &Balancer, now: f64) -> Option<String> {
    balancer.select_account(now).await.account_id
}

// -- Selection -----------------------------------------------------------------

#[tokio::test]
async fn select_picks_lowest_used_percent() {
    let b = balancer();
    b.seed(state("a", AccountStatus::Active, 50.0)).await;
    b.seed(state("b", AccountStatus::Active, 10.0)).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("b"));
}

#[tokio::test]
async fn select_skips_rate_limited_until_reset() {
    let b = balancer();
    let mut a = state("a", AccountStatus::RateLimited, 5.0);
    a.reset_at = Some(NOW + 60.0);
    b.seed(a).await;
    b.seed(state("b", AccountStatus::Active, 10.0)).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("b"));
}

#[tokio::test]
async fn rate_limited_returns_to_active_after_reset() {
    let b = balancer();
    let mut a = state("a", AccountStatus::RateLimited, 100.0);
    a.reset_at = Some(NOW - 1.0);
    b.seed(a).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("a"));

    let snapshot = b.snapshot().await;
    assert_eq!(snapshot[0].status, AccountStatus::Active);
    assert_eq!(snapshot[0].used_percent, None);
    assert_eq!(snapshot[0].reset_at, None);
}

#[tokio::test]
async fn select_skips_cooldown_until_expired() {
    let b = balancer();
    let mut a = state("a", AccountStatus::Active, 5.0);
    a.cooldown_until = Some(NOW + 60.0);
    b.seed(a).await;
    b.seed(state("b", AccountStatus::Active, 10.0)).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("b"));
}

#[tokio::test]
async fn cooldown_expiry_resets_error_bookkeeping() {
    let b = balancer();
    let mut a = state("a", AccountStatus::Active, 5.0);
    a.cooldown_until = Some(NOW - 1.0);
    a.last_error_at = Some(NOW - 10.0);
    a.error_count = 4;
    b.seed(a).await;

    assert_eq!(selected(&b, NOW).await.as_deref(), Some("a"));
    let snapshot = b.snapshot().await;
    assert_eq!(snapshot[0].cooldown_until, None);
    assert_eq!(snapshot[0].last_error_at, None);
    assert_eq!(snapshot[0].error_count, 0);
}

#[tokio::test]
async fn select_reports_nearest_wait_hint() {
    let b = balancer();
    let mut a = state("a", AccountStatus::Active, 5.0);
    a.cooldown_until = Some(NOW + 30.0);
    let mut c = state("c", AccountStatus::Active, 10.0);
    c.cooldown_until = Some(NOW + 60.0);
    b.seed(a).await;
    b.seed(c).await;

    let selection = b.select_account(NOW).await;
    assert_eq!(selection.account_id, None);
    let message = selection.error_message.unwrap_or_default();
    assert!(message.contains("Try again in"), "unexpected message: {message}");
    assert_eq!(selection.retry_after_seconds, Some(30.0));
}

#[tokio::test]
async fn select_ignores_paused_and_deactivated() {
    let b = balancer();
    b.seed(state("a", AccountStatus::Paused, 1.0)).await;
    b.seed(state("b", AccountStatus::Deactivated, 2.0)).await;
    let selection = b.select_account(NOW).await;
    assert_eq!(selection.account_id, None);
    assert_eq!(selection.error_message.as_deref(), Some("No accounts available"));
}

#[tokio::test]
async fn tiebreak_is_error_count_then_id() {
    let b = balancer();
    let mut a = state("a", AccountStatus::Active, 20.0);
    a.error_count = 3;
    let mut c = state("c", AccountStatus::Active, 20.0);
    c.error_count = 1;
    b.seed(a).await;
    b.seed(c).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("c"));

    let b = balancer();
    b.seed(state("b", AccountStatus::Active, 20.0)).await;
    b.seed(state("a", AccountStatus::Active, 20.0)).await;
    assert_eq!(selected(&b, NOW).await.as_deref(), Some("a"));
}

// -- Error transitions ---------------------------------------------------------

#[test]
fn rate_limit_uses_retry_hint_from_message() {
    let mut st = state("a", AccountStatus::Active, 5.0);
    let hint =
        UpstreamErrorHint { message: Some("Try again in 1.5s".to_owned()), ..Default::default() };
    handle_rate_limit(&mut st, &hint, &BackoffSchedule::default(), NOW);
    assert_eq!(st.status, AccountStatus::Active);
    assert_eq!(st.cooldown_until, Some(NOW + 1.5));
    assert_eq!(st.error_count, 1);
    assert_eq!(st.last_error_at, Some(NOW));
}

#[test]
fn rate_limit_falls_back_to_backoff() {
    let mut st = state("a", AccountStatus::Active, 5.0);
    let hint = UpstreamErrorHint {
        message: Some("Rate limit exceeded.".to_owned()),
        ..Default::default()
    };
    let backoff = BackoffSchedule { base_seconds: 0.2, ceiling_seconds: 300.0 };
    handle_rate_limit(&mut st, &hint, &backoff, NOW);
    assert_eq!(st.status, AccountStatus::Active);
    assert_eq!(st.cooldown_until, Some(NOW + 0.2));
}

#[test]
fn backoff_doubles_and_caps() {
    let backoff = BackoffSchedule { base_seconds: 0.2, ceiling_seconds: 300.0 };
    assert_eq!(backoff.seconds(0), 0.2);
    assert_eq!(backoff.seconds(1), 0.4);
    assert_eq!(backoff.seconds(3), 1.6);
    assert_eq!(backoff.seconds(30), 300.0);
}

#[test]
fn quota_exceeded_saturates_state() {
    let mut st = state("a", AccountStatus::Active, 5.0);
    let hint = UpstreamErrorHint { resets_at: Some(NOW + 3600.0), ..Default::default() };
    handle_quota_exceeded(&mut st, &hint);
    assert_eq!(st.status, AccountStatus::QuotaExceeded);
    assert_eq!(st.used_percent, Some(100.0));
    assert_eq!(st.reset_at, Some(NOW + 3600.0));

    // Repeating the same event changes nothing.
    handle_quota_exceeded(&mut st, &hint);
    assert_eq!(st.status, AccountStatus::QuotaExceeded);
    assert_eq!(st.used_percent, Some(100.0));
    assert_eq!(st.reset_at, Some(NOW + 3600.0));
}

#[test]
fn quota_exceeded_without_reset_keeps_existing() {
    let mut st = state("a", AccountStatus::Active, 5.0);
    handle_quota_exceeded(&mut st, &UpstreamErrorHint::default());
    assert_eq!(st.status, AccountStatus::QuotaExceeded);
    assert_eq!(st.used_percent, Some(100.0));
    assert_eq!(st.reset_at, None);
}

#[test]
fn permanent_failure_records_reason() {
    let mut st = state("a", AccountStatus::Active, 5.0);
    handle_permanent_failure(&mut st, "refresh_token_expired");
    assert_eq!(st.status, AccountStatus::Deactivated);
    assert!(st.deactivation_reason.is_some());

    let mut st = state("a", AccountStatus::Active, 5.0);
    handle_permanent_failure(&mut st, "some_novel_code");
    assert_eq!(st.deactivation_reason.as_deref(), Some("some_novel_code"));
}

#[tokio::test]
async fn record_success_clears_error_bookkeeping() {
    let b = balancer();
    let mut a = state("a", AccountStatus::Active, 5.0);
    a.error_count = 2;
    a.last_error_at = Some(NOW - 5.0);
    b.seed(a).await;

    b.record_success("a").await;
    let snapshot = b.snapshot().await;
    assert_eq!(snapshot[0].error_count, 0);
    assert_eq!(snapshot[0].last_error_at, None);
}

// -- Usage-driven transitions --------------------------------------------------

#[test]
fn usage_quota_fallback_reset_from_window_minutes() {
    let (status, used, reset) = apply_usage_quota(
        AccountStatus::Active,
        Some(100.0),
        None,
        Some(1),
        None,
        None,
        None,
        NOW,
    );
    assert_eq!(status, AccountStatus::RateLimited);
    assert_eq!(used, Some(100.0));
    assert_eq!(reset, Some(NOW + 60.0));
}

#[test]
fn usage_quota_prefers_saturated_window_reset() {
    let (status, used, reset) = apply_usage_quota(
        AccountStatus::Active,
        Some(40.0),
        Some(NOW + 100.0),
        Some(5),
        None,
        Some(100.0),
        Some(NOW + 7200.0),
        NOW,
    );
    assert_eq!(status, AccountStatus::RateLimited);
    assert_eq!(used, Some(100.0));
    assert_eq!(reset, Some(NOW + 7200.0));
}

#[test]
fn usage_quota_uses_runtime_reset_when_windows_lack_one() {
    let (_, _, reset) = apply_usage_quota(
        AccountStatus::RateLimited,
        Some(100.0),
        None,
        None,
        Some(NOW + 30.0),
        None,
        None,
        NOW,
    );
    assert_eq!(reset, Some(NOW + 30.0));
}

#[test]
fn usage_quota_unsaturated_is_active() {
    let (status, used, reset) = apply_usage_quota(
        AccountStatus::RateLimited,
        Some(42.0),
        Some(NOW + 100.0),
        Some(5),
        Some(NOW + 50.0),
        Some(10.0),
        None,
        NOW,
    );
    assert_eq!(status, AccountStatus::Active);
    assert_eq!(used, Some(42.0));
    assert_eq!(reset, None);
}

#[test]
fn usage_quota_never_resurrects_paused_or_deactivated() {
    let (status, _, _) = apply_usage_quota(
        AccountStatus::Paused,
        Some(10.0),
        None,
        None,
        None,
        None,
        None,
        NOW,
    );
    assert_eq!(status, AccountStatus::Paused);

    let (status, _, _) = apply_usage_quota(
        AccountStatus::Deactivated,
        Some(10.0),
        None,
        None,
        None,
        None,
        None,
        NOW,
    );
    assert_eq!(status, AccountStatus::Deactivated);
}

// -- Parsing and formatting ----------------------------------------------------

#[test]
fn retry_hint_parses_units() {
    assert_eq!(parse_retry_after_hint("Try again in 5s"), Some(5.0));
    assert_eq!(parse_retry_after_hint("Try again in 1.5s"), Some(1.5));
    assert_eq!(parse_retry_after_hint("try again in 2m"), Some(120.0));
    assert_eq!(parse_retry_after_hint("Try again in 1h"), Some(3600.0));
    assert_eq!(parse_retry_after_hint("Try again in 3"), Some(3.0));
    assert_eq!(parse_retry_after_hint("Rate limit exceeded."), None);
}

#[test]
fn wait_hint_formatting() {
    assert_eq!(format_wait_hint(1.5), "Try again in 1.5s");
    assert_eq!(format_wait_hint(0.0), "Try again in 0.0s");
    assert_eq!(format_wait_hint(59.94), "Try again in 59.9s");
    assert_eq!(format_wait_hint(90.0), "Try again in 2m");
    assert_eq!(format_wait_hint(600.0), "Try again in 10m");
}

#[test]
fn permanent_codes_have_reasons() {
    assert!(permanent_failure_reason("invalid_grant").is_some());
    assert!(permanent_failure_reason("refresh_token_expired").is_some());
    assert!(permanent_failure_reason("timeout").is_none());
}
