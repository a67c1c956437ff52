/// Metrics for the identity service
///
/// Prometheus counters for:
/// - HTTP requests
/// - login outcomes, rate-limit rejections and lockouts
/// - refresh session churn
/// - trial transitions and background jobs

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // ========== Authentication Metrics ==========

    /// Login attempts by outcome
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "login_attempts_total",
        "Total number of login attempts",
        &["outcome"]
    )
    .unwrap();

    /// Attempts rejected by a rate limit, by scope
    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limit_rejections_total",
        "Total number of requests rejected by rate limiting",
        &["scope"]
    )
    .unwrap();

    /// Accounts locked after repeated failures
    pub static ref ACCOUNT_LOCKOUTS_TOTAL: IntCounter = register_int_counter!(
        "account_lockouts_total",
        "Total number of account lockouts"
    )
    .unwrap();

    /// Accounts created by role
    pub static ref ACCOUNT_CREATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "account_creations_total",
        "Total number of accounts created",
        &["role"]
    )
    .unwrap();

    // ========== Session Metrics ==========

    /// Refresh session events (issued, rotated, revoked, purged)
    pub static ref SESSION_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "session_events_total",
        "Total number of refresh session events",
        &["event"]
    )
    .unwrap();

    // ========== Trial Metrics ==========

    /// Trial transitions by kind
    pub static ref TRIAL_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "trial_transitions_total",
        "Total number of trial lifecycle transitions",
        &["transition"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a login attempt outcome
pub fn record_login(outcome: &str) {
    LOGIN_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a rate-limit rejection
pub fn record_rate_limited(scope: &str) {
    RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&[scope]).inc();
}

/// Record an account lock
pub fn record_lockout() {
    ACCOUNT_LOCKOUTS_TOTAL.inc();
}

/// Record an account creation
pub fn record_account_creation(role: &str) {
    ACCOUNT_CREATIONS_TOTAL.with_label_values(&[role]).inc();
}

/// Record a refresh session event
pub fn record_session(event: &str) {
    SESSION_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

/// Record sessions removed by the expiry sweep
pub fn record_sessions_purged(count: u64) {
    SESSION_EVENTS_TOTAL.with_label_values(&["purged"]).inc_by(count);
}

/// Record a trial transition
pub fn record_trial_transition(transition: &str) {
    TRIAL_TRANSITIONS_TOTAL.with_label_values(&[transition]).inc();
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http_request() {
        record_http_request("POST", "/auth/login", 200, 0.05);
        let metrics = render_metrics();
        assert!(metrics.contains("http_requests_total"));
        assert!(metrics.contains("http_request_duration_seconds"));
    }

    #[test]
    fn test_record_auth_counters() {
        record_login("success");
        record_rate_limited("login:ip");
        record_lockout();
        let metrics = render_metrics();
        assert!(metrics.contains("login_attempts_total"));
        assert!(metrics.contains("rate_limit_rejections_total"));
        assert!(metrics.contains("account_lockouts_total"));
    }

    #[test]
    fn test_record_session_and_trial() {
        record_session("issued");
        record_sessions_purged(3);
        record_trial_transition("expired");
        let metrics = render_metrics();
        assert!(metrics.contains("session_events_total"));
        assert!(metrics.contains("trial_transitions_total"));
    }

    #[test]
    fn test_record_background_job() {
        record_background_job("trial_expiry", "success", 0.2);
        let metrics = render_metrics();
        assert!(metrics.contains("background_jobs_total"));
        assert!(metrics.contains("background_job_duration_seconds"));
    }
}
