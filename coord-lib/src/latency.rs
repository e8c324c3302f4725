use std::time::Duration;

/// Histogram of command round-trip times, in seconds, labelled by command
/// name. Recorded for failed commands as well.
pub const REQUEST_LATENCY: &str = "redis_request_latency";

pub(crate) fn describe() {
    metrics::describe_histogram!(
        REQUEST_LATENCY,
        metrics::Unit::Seconds,
        "round-trip time of commands sent to the store"
    );
}

pub(crate) fn record(command: &str, elapsed: Duration) {
    metrics::histogram!(REQUEST_LATENCY, "command" => command.to_ascii_lowercase())
        .record(elapsed.as_secs_f64());
}
