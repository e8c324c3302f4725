/// Receives liveness reports from the pool.
///
/// The pool reports under the source name [`HEALTH_SOURCE`] when it starts
/// and whenever the first dial fails.
pub trait HealthRecorder: Send + Sync {
    fn report_healthy(&self, source: &str);
    fn report_unhealthy(&self, source: &str, reason: &str);
}

pub const HEALTH_SOURCE: &str = "redis";

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealth;

impl HealthRecorder for NoopHealth {
    fn report_healthy(&self, _source: &str) {}

    fn report_unhealthy(&self, _source: &str, _reason: &str) {}
}
