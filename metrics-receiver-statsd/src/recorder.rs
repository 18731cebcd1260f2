use metrics::{Key, Label};
use tracing::trace;

use crate::{
    handler::Handler,
    metric::{Metric, MetricType},
};

static METADATA: metrics::Metadata<'static> =
    metrics::Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()));

/// A handler that forwards received metrics into the installed [`metrics`] recorder.
///
/// This bridges StatsD traffic into any `metrics`-compatible exporter: counters are incremented, gauges are set, and
/// timers are recorded as histogram samples. Tags become labels.
///
/// Counter values are truncated to an integer, as `metrics` counters are integral. Counters with a negative or
/// non-finite value cannot be represented and are dropped.
#[derive(Clone, Debug, Default)]
pub struct RecorderHandler {
    prefix: Option<String>,
}

impl RecorderHandler {
    /// Creates a new `RecorderHandler`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a prefix that is prepended, with a `.` separator, to every forwarded metric name.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into());
        self
    }

    fn key_for(&self, metric: Metric) -> Key {
        let name = match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, metric.bucket),
            None => metric.bucket,
        };
        let labels = metric.tags.into_iter().map(|(k, v)| Label::new(k, v)).collect::<Vec<_>>();

        Key::from_parts(name, labels)
    }
}

impl Handler for RecorderHandler {
    fn handle_metric(&self, metric: Metric) {
        let metric_type = metric.metric_type;
        let value = metric.value;

        if metric_type == MetricType::Counter && !(value.is_finite() && value >= 0.0) {
            trace!(bucket = %metric.bucket, value, "Dropping counter with unrepresentable value.");
            return;
        }

        let key = self.key_for(metric);
        metrics::with_recorder(|recorder| match metric_type {
            MetricType::Counter => recorder.register_counter(&key, &METADATA).increment(value as u64),
            MetricType::Gauge => recorder.register_gauge(&key, &METADATA).set(value),
            MetricType::Timer => recorder.register_histogram(&key, &METADATA).record(value),
        });
    }
}
