//! A receiver for the [StatsD][statsd] protocol over UDP.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! The receiver listens on a UDP socket, splits every datagram into lines, parses each line into a [`Metric`], and
//! hands each metric to a [`Handler`] of your choosing.
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_receiver_statsd::{Metric, StatsDReceiverBuilder};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // First, create a builder.
//! //
//! // The builder can configure the listen address, the size of the receive buffer, how datagrams are processed
//! // concurrently, and whether or not the receiver reports its own telemetry.
//! let builder = StatsDReceiverBuilder::default().with_listen_address("127.0.0.1:8125")?;
//!
//! // Any `Fn(Metric)` closure can act as the handler.
//! let handler = |metric: Metric| println!("{}", metric);
//!
//! // Run the receiver until the token is cancelled.
//! let shutdown = CancellationToken::new();
//! builder.listen_and_receive(handler, shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! For scenarios where the receiver should simply run in the background, [`StatsDReceiverBuilder::spawn`] runs it
//! either in the current Tokio runtime or on a dedicated thread, and returns a [`ReceiverHandle`] to stop it with.
//!
//! A socket that is already open can be used instead of a listen address, with
//! [`StatsDReceiverBuilder::build_with_socket`].
//!
//! # Protocol
//!
//! Each line has the form `bucket[,key=value...]:value|type`, where `type` is `c` (counter), `g` (gauge) or `ms`
//! (timer), and `value` is a floating-point number. Lines are separated by `\n`, and the last line of a datagram does
//! not need to be terminated.
//!
//! The comma-separated tags are an extension to the base protocol, and they are parsed leniently: any tag segment that
//! isn't exactly `key=value` is silently dropped.
//!
//! # Errors as metrics
//!
//! The receiver never stops because of bad input. A line that fails to parse, or a failed socket read, is turned into
//! an error metric: a counter in the `error` bucket with a value of 1, and an `error` tag describing the failure. Error
//! metrics are delivered to the handler like any other metric, and can be recognized with [`Metric::is_error`].
//!
//! # Concurrency
//!
//! Reading from the socket never waits on the handler. By default, datagrams are queued and processed by a fixed pool
//! of worker tasks, dropping datagrams once the queue is full. The unbounded model, with one task per datagram
//! and per line, is available as [`Concurrency::Unbounded`].
//!
//! Handler calls always run on Tokio's blocking thread pool, so a slow handler never delays reading the next datagram,
//! and a handler that panics only loses the metrics it was handling at the time.
//!
//! No ordering is preserved: metrics from different datagrams, or from different lines of the same datagram, can reach
//! the handler in any order.
//!
//! # Telemetry
//!
//! The receiver reports its own behavior (packets received, metrics parsed, parse errors, and so on) as counters under
//! the `statsd.receiver` namespace, through whichever [`metrics`] recorder is installed when it is built.
//!
//! Received metrics can themselves be forwarded into the installed recorder with [`RecorderHandler`].

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, ReceiverHandle, StatsDReceiverBuilder, DEFAULT_LISTEN_ADDRESS};

mod dispatch;
pub use self::dispatch::{Concurrency, OverflowPolicy};

mod handler;
pub use self::handler::Handler;

mod lines;
pub use self::lines::{split_lines, Lines};

mod metric;
pub use self::metric::{Metric, MetricType, Tags, ERROR_BUCKET, ERROR_TAG};

mod parser;
pub use self::parser::{parse_line, ParseError};

mod receiver;
pub use self::receiver::StatsDReceiver;

mod recorder;
pub use self::recorder::RecorderHandler;

mod telemetry;
