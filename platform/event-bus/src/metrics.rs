//! Metrics surface (§4.6): counters, gauges, timings, and histograms,
//! shipped to StatsD via `cadence`, matching the timing pattern the
//! `other_examples` lapin reference takes with its prometheus histograms
//! but swapped onto the teacher's UDP-sink/tag-free statsd style.
//!
//! A sink failure never propagates to the caller — metrics are
//! best-effort. Three consecutive send failures trip a circuit breaker
//! that fast-fails (skips the actual UDP send) for a cool-off window,
//! so a downed statsd daemon cannot add latency to every publish/consume.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cadence::{Counted, Gauged, Histogrammed, StatsdClient, Timed, UdpMetricSink};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

const FAILURE_THRESHOLD: u32 = 3;
const COOL_OFF: Duration = Duration::from_secs(60);

/// A single metric tag, e.g. `("event_name", "order.created")` (§4.6).
pub type Tags<'a> = &'a [(&'a str, &'a str)];

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});
static ALL_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6,}$").unwrap());

/// §4.6: "using user ids, invoice ids, UUIDs, or timestamps as tag values is
/// a programming error — the sink warns (or rejects) such tags." A UUID or
/// a long run of digits (epoch seconds/millis) is the shape a high-cardinality
/// identifier takes on; bounded enum-like tag values (`event_name`,
/// `error_type`, `retry`, `status`, `reason`) never match either pattern.
fn looks_high_cardinality(value: &str) -> bool {
    UUID_RE.is_match(value) || ALL_DIGITS_RE.is_match(value)
}

fn warn_on_high_cardinality_tags(metric: &str, tags: Tags) {
    for (key, value) in tags {
        if looks_high_cardinality(value) {
            warn!(metric, tag = %key, value = %value, "tag value looks high-cardinality (uuid/timestamp-shaped), dropping it");
        }
    }
}

/// Drop any tag whose value looks like a UUID or raw timestamp before it
/// reaches the wire (§4.6 cardinality bound).
fn sanitize_tags<'a>(metric: &str, tags: Tags<'a>) -> Vec<(&'a str, &'a str)> {
    warn_on_high_cardinality_tags(metric, tags);
    tags.iter()
        .copied()
        .filter(|(_, value)| !looks_high_cardinality(value))
        .collect()
}

/// Sink for the four metric shapes this library emits.
pub trait MetricsSink: Send + Sync {
    /// `sample_rate` in `[0, 1]`; error counters always pass `1.0`
    /// (DESIGN.md open question 4).
    fn counter(&self, name: &str, value: i64, tags: Tags, sample_rate: f64);
    fn gauge(&self, name: &str, value: u64, tags: Tags);
    fn timing(&self, name: &str, millis: u64, tags: Tags);
    fn histogram(&self, name: &str, value: f64, tags: Tags);
}

/// Drops every metric. Used when no `STATSD_HOST` is configured.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str, _value: i64, _tags: Tags, _sample_rate: f64) {}
    fn gauge(&self, _name: &str, _value: u64, _tags: Tags) {}
    fn timing(&self, _name: &str, _millis: u64, _tags: Tags) {}
    fn histogram(&self, _name: &str, _value: f64, _tags: Tags) {}
}

struct Breaker {
    consecutive_failures: AtomicU32,
    tripped_until: Mutex<Option<Instant>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tripped_until: Mutex::new(None),
        }
    }

    fn is_open(&self) -> bool {
        let guard = self.tripped_until.lock().expect("metrics breaker mutex poisoned");
        match *guard {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn record_outcome(&self, succeeded: bool) {
        if succeeded {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_THRESHOLD {
            let mut guard = self.tripped_until.lock().expect("metrics breaker mutex poisoned");
            *guard = Some(Instant::now() + COOL_OFF);
            warn!(
                consecutive_failures = failures,
                cool_off_secs = COOL_OFF.as_secs(),
                "metrics sink circuit breaker tripped"
            );
        }
    }
}

/// StatsD-backed sink over UDP, via `cadence`. Injects a `service`/`env`
/// default tag pair on every call (§4.6 "Default tags service/env are
/// injected by the sink").
pub struct StatsdSink {
    client: StatsdClient,
    breaker: Breaker,
    sent: AtomicU64,
    dropped: AtomicU64,
    default_tags: Vec<(String, String)>,
}

impl StatsdSink {
    pub fn new(
        host: &str,
        port: u16,
        prefix: &str,
        service: &str,
        env: &str,
    ) -> Result<Self, std::io::Error> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from((host, port), socket)?;
        let client = StatsdClient::from_sink(prefix, sink);

        Ok(Self {
            client,
            breaker: Breaker::new(),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            default_tags: vec![
                ("service".to_string(), service.to_string()),
                ("env".to_string(), env.to_string()),
            ],
        })
    }

    fn guarded<F: FnOnce(&StatsdClient) -> Result<(), cadence::MetricError>>(&self, f: F) {
        if self.breaker.is_open() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let result = f(&self.client);
        self.breaker.record_outcome(result.is_ok());
        match result {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "failed to send metric");
            }
        }
    }

    /// `sample_rate < 1.0` rolls the dice once per call rather than relying
    /// on `cadence`'s own (statsd-protocol-level) sampling, so the decision
    /// is visible to `self.sent`/`self.dropped` bookkeeping uniformly.
    fn should_sample(sample_rate: f64) -> bool {
        sample_rate >= 1.0 || rand::random::<f64>() < sample_rate
    }

    fn all_tags<'a>(&'a self, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut tags: Vec<(&str, &str)> = self
            .default_tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        tags.extend_from_slice(extra);
        tags
    }

    /// Count of metrics sent and dropped since construction, for
    /// diagnostics/self-monitoring.
    pub fn counters(&self) -> (u64, u64) {
        (self.sent.load(Ordering::Relaxed), self.dropped.load(Ordering::Relaxed))
    }
}

impl MetricsSink for StatsdSink {
    fn counter(&self, name: &str, value: i64, tags: Tags, sample_rate: f64) {
        if !Self::should_sample(sample_rate) {
            return;
        }
        let tags = sanitize_tags(name, tags);
        let tags = self.all_tags(&tags);
        self.guarded(|c| {
            let mut builder = c.count_with_tags(name, value);
            for (key, value) in &tags {
                builder = builder.with_tag(key, value);
            }
            builder.try_send().map(|_| ())
        });
    }

    fn gauge(&self, name: &str, value: u64, tags: Tags) {
        let tags = sanitize_tags(name, tags);
        let tags = self.all_tags(&tags);
        self.guarded(|c| {
            let mut builder = c.gauge_with_tags(name, value);
            for (key, value) in &tags {
                builder = builder.with_tag(key, value);
            }
            builder.try_send().map(|_| ())
        });
    }

    fn timing(&self, name: &str, millis: u64, tags: Tags) {
        let tags = sanitize_tags(name, tags);
        let tags = self.all_tags(&tags);
        self.guarded(|c| {
            let mut builder = c.time_with_tags(name, millis);
            for (key, value) in &tags {
                builder = builder.with_tag(key, value);
            }
            builder.try_send().map(|_| ())
        });
    }

    fn histogram(&self, name: &str, value: f64, tags: Tags) {
        let tags = sanitize_tags(name, tags);
        let tags = self.all_tags(&tags);
        self.guarded(|c| {
            let mut builder = c.histogram_with_tags(name, value);
            for (key, value) in &tags {
                builder = builder.with_tag(key, value);
            }
            builder.try_send().map(|_| ())
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedMetric {
    Counter(String, i64, Vec<(String, String)>),
    Gauge(String, u64, Vec<(String, String)>),
    Timing(String, u64, Vec<(String, String)>),
    Histogram(String, f64, Vec<(String, String)>),
}

fn owned_tags(tags: Tags) -> Vec<(String, String)> {
    tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Captures every call in order, for assertions in tests.
#[derive(Default)]
pub struct RecordingMetricsSink {
    recorded: Mutex<Vec<RecordedMetric>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().expect("recording sink mutex poisoned").clone()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn counter(&self, name: &str, value: i64, tags: Tags, _sample_rate: f64) {
        self.recorded
            .lock()
            .expect("recording sink mutex poisoned")
            .push(RecordedMetric::Counter(name.to_string(), value, owned_tags(tags)));
    }

    fn gauge(&self, name: &str, value: u64, tags: Tags) {
        self.recorded
            .lock()
            .expect("recording sink mutex poisoned")
            .push(RecordedMetric::Gauge(name.to_string(), value, owned_tags(tags)));
    }

    fn timing(&self, name: &str, millis: u64, tags: Tags) {
        self.recorded
            .lock()
            .expect("recording sink mutex poisoned")
            .push(RecordedMetric::Timing(name.to_string(), millis, owned_tags(tags)));
    }

    fn histogram(&self, name: &str, value: f64, tags: Tags) {
        self.recorded
            .lock()
            .expect("recording sink mutex poisoned")
            .push(RecordedMetric::Histogram(name.to_string(), value, owned_tags(tags)));
    }
}

/// Shared handle threaded through publisher/consumer/pool code.
pub type SharedMetrics = Arc<dyn MetricsSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_every_call_in_order() {
        let sink = RecordingMetricsSink::new();
        sink.counter("published", 1, &[("event_name", "order.created")], 1.0);
        sink.timing("publish.duration_ms", 12, &[("event_name", "order.created")]);
        sink.histogram("envelope.bytes", 128.0, &[]);

        assert_eq!(
            sink.recorded(),
            vec![
                RecordedMetric::Counter(
                    "published".to_string(),
                    1,
                    vec![("event_name".to_string(), "order.created".to_string())]
                ),
                RecordedMetric::Timing(
                    "publish.duration_ms".to_string(),
                    12,
                    vec![("event_name".to_string(), "order.created".to_string())]
                ),
                RecordedMetric::Histogram("envelope.bytes".to_string(), 128.0, vec![]),
            ]
        );
    }

    #[test]
    fn noop_sink_accepts_everything_silently() {
        let sink = NoopMetricsSink;
        sink.counter("x", 1, &[], 1.0);
        sink.gauge("y", 2, &[]);
        sink.timing("z", 3, &[]);
        sink.histogram("w", 4.0, &[]);
    }

    #[test]
    fn high_cardinality_tag_values_are_dropped() {
        let sink = RecordingMetricsSink::new();
        sink.counter(
            "event_started_count",
            1,
            &[
                ("event_name", "order.created"),
                ("user_id", "3fa85f64-5717-4562-b3fc-2c963f66afa6"),
                ("invoice_id", "1719000000123"),
            ],
            1.0,
        );
        // RecordingMetricsSink intentionally does not sanitize (it's a test
        // double observing exactly what call sites pass); the sanitization
        // lives in `sanitize_tags`, exercised directly here.
        let sanitized = sanitize_tags(
            "event_started_count",
            &[
                ("event_name", "order.created"),
                ("user_id", "3fa85f64-5717-4562-b3fc-2c963f66afa6"),
                ("invoice_id", "1719000000123"),
            ],
        );
        assert_eq!(sanitized, vec![("event_name", "order.created")]);
    }

    #[test]
    fn breaker_trips_after_threshold_failures() {
        let breaker = Breaker::new();
        assert!(!breaker.is_open());
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_outcome(false);
        }
        assert!(breaker.is_open());
    }

    #[test]
    fn breaker_resets_on_success() {
        let breaker = Breaker::new();
        breaker.record_outcome(false);
        breaker.record_outcome(false);
        breaker.record_outcome(true);
        breaker.record_outcome(false);
        breaker.record_outcome(false);
        assert!(!breaker.is_open());
    }
}
