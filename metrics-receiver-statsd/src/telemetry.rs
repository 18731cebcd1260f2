use metrics::{counter, Counter};

/// Receiver telemetry.
///
/// `Telemetry` tracks the receiver's own behavior, such as how many packets were received, parsed, or dropped, and
/// reports it through whichever `metrics` recorder is installed when the receiver is built. When telemetry is
/// disabled, or no recorder is installed, every update is a no-op.
#[derive(Clone)]
pub(crate) struct Telemetry {
    packets_received: Counter,
    bytes_received: Counter,
    metrics_parsed: Counter,
    parse_errors: Counter,
    receive_errors: Counter,
    packets_dropped: Counter,
    handler_panics: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance registered against the current recorder.
    pub fn new(transport: &'static str) -> Self {
        let labels = telemetry_tags!("transport" => transport);

        Self {
            packets_received: counter!("statsd.receiver.packets_received", labels.iter()),
            bytes_received: counter!("statsd.receiver.bytes_received", labels.iter()),
            metrics_parsed: counter!("statsd.receiver.metrics_parsed", labels.iter()),
            parse_errors: counter!("statsd.receiver.parse_errors", labels.iter()),
            receive_errors: counter!("statsd.receiver.receive_errors", labels.iter()),
            packets_dropped: counter!("statsd.receiver.packets_dropped", labels.iter()),
            handler_panics: counter!("statsd.receiver.handler_panics", labels.iter()),
        }
    }

    /// Creates a `Telemetry` instance that discards every update.
    pub fn noop() -> Self {
        Self {
            packets_received: Counter::noop(),
            bytes_received: Counter::noop(),
            metrics_parsed: Counter::noop(),
            parse_errors: Counter::noop(),
            receive_errors: Counter::noop(),
            packets_dropped: Counter::noop(),
            handler_panics: Counter::noop(),
        }
    }

    /// Tracks a datagram read from the socket.
    pub fn track_packet_received(&self, bytes_len: usize) {
        self.packets_received.increment(1);
        self.bytes_received.increment(bytes_len as u64);
    }

    /// Tracks a line that parsed successfully.
    pub fn track_metric_parsed(&self) {
        self.metrics_parsed.increment(1);
    }

    /// Tracks a line that failed to parse.
    pub fn track_parse_error(&self) {
        self.parse_errors.increment(1);
    }

    /// Tracks a failed socket read.
    pub fn track_receive_error(&self) {
        self.receive_errors.increment(1);
    }

    /// Tracks a datagram dropped because the dispatch queue was full.
    pub fn track_packet_dropped(&self) {
        self.packets_dropped.increment(1);
    }

    /// Tracks a handler call that panicked.
    pub fn track_handler_panic(&self) {
        self.handler_panics.increment(1);
    }
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("receiver", "statsd"),
            ::metrics::Label::from_static_parts("receiver_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;
