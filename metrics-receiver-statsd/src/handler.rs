use std::sync::Arc;

use crate::metric::Metric;

/// A consumer of received metrics.
///
/// Every successfully parsed line, and every error metric synthesized from a receive or parse failure, is delivered
/// through [`handle_metric`][Handler::handle_metric].
///
/// Calls are made concurrently from multiple tasks and in no particular order, so implementations must do their own
/// synchronization if they hold state. They should also return promptly: a handler that blocks holds up every
/// delivery queued behind it.
///
/// Closures of the form `Fn(Metric)` implement `Handler` directly:
///
/// ```
/// # use metrics_receiver_statsd::{Handler, Metric};
/// fn assert_handler<H: Handler>(_: H) {}
///
/// assert_handler(|metric: Metric| println!("{}", metric));
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Handles a single metric.
    fn handle_metric(&self, metric: Metric);
}

impl<F> Handler for F
where
    F: Fn(Metric) + Send + Sync + 'static,
{
    fn handle_metric(&self, metric: Metric) {
        self(metric);
    }
}

impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    fn handle_metric(&self, metric: Metric) {
        (**self).handle_metric(metric);
    }
}
