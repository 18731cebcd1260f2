use std::{collections::BTreeMap, fmt, str::FromStr};

/// Bucket name used for metrics synthesized from receive or parse failures.
pub const ERROR_BUCKET: &str = "error";

/// Tag key that carries the failure description on error metrics.
pub const ERROR_TAG: &str = "error";

/// Tags attached to a metric.
///
/// Keys are unique. When a line carries the same key more than once, the last occurrence wins.
pub type Tags = BTreeMap<String, String>;

/// Metric type.
///
/// The discriminants are ordered so that `MetricType::Counter <= t && t <= MetricType::Gauge` holds for every valid
/// type. The ordering carries no other meaning.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum MetricType {
    /// A monotonic increment (`c`).
    Counter = 0,

    /// A duration sample, in milliseconds (`ms`).
    Timer = 1,

    /// A point-in-time value (`g`).
    Gauge = 2,
}

impl MetricType {
    /// Returns the wire token for this metric type.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Timer => "ms",
            MetricType::Gauge => "g",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(MetricType::Counter),
            "ms" => Ok(MetricType::Timer),
            "g" => Ok(MetricType::Gauge),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric parsed from a StatsD line.
///
/// Metrics are handed to a [`Handler`][crate::Handler] by value, and the receiver keeps no reference to them
/// afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Metric type.
    pub metric_type: MetricType,

    /// Bucket name, without any inline tags.
    pub bucket: String,

    /// Metric value.
    pub value: f64,

    /// Tags, empty if the line carried none.
    pub tags: Tags,
}

impl Metric {
    /// Creates a new `Metric` without tags.
    pub fn new<B>(metric_type: MetricType, bucket: B, value: f64) -> Self
    where
        B: Into<String>,
    {
        Metric { metric_type, bucket: bucket.into(), value, tags: Tags::new() }
    }

    /// Adds a tag to this metric, replacing any existing value for the same key.
    #[must_use]
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Creates an error metric describing a receive or parse failure.
    ///
    /// Error metrics are counters in the `error` bucket with a value of 1, carrying the description in the `error`
    /// tag. They travel through the same handler as every other metric.
    pub fn error<D>(description: D) -> Self
    where
        D: Into<String>,
    {
        Metric::new(MetricType::Counter, ERROR_BUCKET, 1.0).with_tag(ERROR_TAG, description)
    }

    /// Returns `true` if this metric was synthesized from a failure.
    pub fn is_error(&self) -> bool {
        self.metric_type == MetricType::Counter
            && self.bucket == ERROR_BUCKET
            && self.tags.contains_key(ERROR_TAG)
    }
}

impl fmt::Display for Metric {
    /// Renders the metric in the StatsD line format, with tags in key order and no trailing newline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket)?;
        for (key, value) in &self.tags {
            write!(f, ",{}={}", key, value)?;
        }

        let mut value_writer = ryu::Buffer::new();
        write!(f, ":{}|{}", value_writer.format(self.value), self.metric_type)
    }
}
