use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use tokio::{sync::Notify, task::JoinError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::{
    handler::Handler, lines::split_lines, metric::Metric, parser::parse_line, telemetry::Telemetry,
};

/// Policy applied when a datagram arrives and the dispatch queue is full.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// The incoming datagram is dropped and the queue is left untouched.
    DropNewest,

    /// The oldest queued datagram is dropped to make room for the incoming one.
    DropOldest,
}

/// How received datagrams are processed concurrently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Concurrency {
    /// Every datagram is processed in its own task, and every line is delivered to the handler in its own task.
    ///
    /// Nothing bounds the number of tasks in flight, so a burst of traffic or a slow handler can grow memory usage
    /// without limit.
    Unbounded,

    /// Datagrams are queued and processed by a fixed number of worker tasks. Each worker hands one datagram at a time
    /// to Tokio's blocking thread pool, where its lines are delivered to the handler, so a slow handler never holds
    /// up the thread reading the socket.
    ///
    /// At most `capacity` datagrams wait in the queue. Once it is full, `overflow` decides which datagram is dropped.
    Bounded {
        /// Number of worker tasks.
        workers: usize,

        /// Maximum number of datagrams waiting to be processed.
        capacity: usize,

        /// What to drop when the queue is full.
        overflow: OverflowPolicy,
    },
}

/// A datagram copied out of the receive buffer, along with its sender.
pub(crate) struct Datagram {
    pub payload: Bytes,
    pub peer: SocketAddr,
}

/// State shared between the receive loop and every dispatch task.
pub(crate) struct Shared<H> {
    pub handler: H,
    pub telemetry: Telemetry,
}

impl<H: Handler> Shared<H> {
    /// Records the outcome of a handler call made on the blocking pool.
    ///
    /// A panicking handler only loses the work it was processing: the panic is logged and counted, and dispatching
    /// carries on.
    fn track_handler_result(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                self.telemetry.track_handler_panic();
                warn!("Handler panicked while processing received metrics.");
            }
        }
    }

    /// Parses every line of `datagram`, passing each metric, or the error metric for a line that failed to parse, to
    /// `deliver`.
    fn process_datagram<F>(&self, datagram: &Datagram, mut deliver: F)
    where
        F: FnMut(Metric),
    {
        for line in split_lines(&datagram.payload) {
            match parse_line(line) {
                Ok(metric) => {
                    self.telemetry.track_metric_parsed();
                    deliver(metric);
                }
                Err(e) => {
                    self.telemetry.track_parse_error();
                    deliver(Metric::error(format!(
                        "error parsing line {:?} from {}: {}",
                        String::from_utf8_lossy(line),
                        datagram.peer,
                        e
                    )));
                }
            }
        }
    }
}

/// Hands datagrams off from the receive loop to concurrent processing.
pub(crate) enum Dispatcher<H> {
    Unbounded(Arc<Shared<H>>),
    Bounded(WorkerQueue),
}

impl<H: Handler> Dispatcher<H> {
    /// Starts dispatching according to `concurrency`.
    ///
    /// In bounded mode, the worker tasks are spawned on the current runtime and run until the returned guard is
    /// dropped, after which they drain whatever is still queued and exit.
    pub fn start(concurrency: Concurrency, shared: Arc<Shared<H>>) -> (Self, Option<DropGuard>) {
        match concurrency {
            Concurrency::Unbounded => (Dispatcher::Unbounded(shared), None),
            Concurrency::Bounded { workers, capacity, overflow } => {
                let queue = WorkerQueue {
                    work: Arc::new(ArrayQueue::new(capacity)),
                    notify: Arc::new(Notify::new()),
                    overflow,
                    telemetry: shared.telemetry.clone(),
                };

                let shutdown = CancellationToken::new();
                for _ in 0..workers {
                    tokio::spawn(run_worker(
                        Arc::clone(&shared),
                        Arc::clone(&queue.work),
                        Arc::clone(&queue.notify),
                        shutdown.clone(),
                    ));
                }
                debug!(workers, capacity, ?overflow, "Spawned dispatch workers.");

                (Dispatcher::Bounded(queue), Some(shutdown.drop_guard()))
            }
        }
    }

    /// Dispatches a datagram for processing.
    ///
    /// This never waits: the datagram is either handed off or, if the queue is full, something is dropped.
    pub fn dispatch(&self, datagram: Datagram) {
        match self {
            Dispatcher::Unbounded(shared) => {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    shared.process_datagram(&datagram, |metric| spawn_delivery(&shared, metric));
                });
            }
            Dispatcher::Bounded(queue) => queue.push(Work::Datagram(datagram)),
        }
    }

    /// Delivers a single metric to the handler without blocking the caller.
    pub fn deliver(&self, metric: Metric) {
        match self {
            Dispatcher::Unbounded(shared) => spawn_delivery(shared, metric),
            Dispatcher::Bounded(queue) => queue.push(Work::Metric(metric)),
        }
    }
}

/// Delivers `metric` to the handler in its own task.
fn spawn_delivery<H: Handler>(shared: &Arc<Shared<H>>, metric: Metric) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let delivery = Arc::clone(&shared);
        let result = tokio::task::spawn_blocking(move || delivery.handler.handle_metric(metric)).await;
        shared.track_handler_result(result);
    });
}

/// The queue feeding the bounded worker pool.
pub(crate) struct WorkerQueue {
    work: Arc<ArrayQueue<Work>>,
    notify: Arc<Notify>,
    overflow: OverflowPolicy,
    telemetry: Telemetry,
}

/// A unit of work for the worker pool.
pub(crate) enum Work {
    Datagram(Datagram),
    Metric(Metric),
}

impl WorkerQueue {
    fn push(&self, work: Work) {
        let dropped = match self.overflow {
            OverflowPolicy::DropNewest => self.work.push(work).err(),
            OverflowPolicy::DropOldest => self.work.force_push(work),
        };

        if dropped.is_some() {
            self.telemetry.track_packet_dropped();
            debug!(capacity = self.work.capacity(), policy = ?self.overflow, "Dispatch queue full, dropped work.");
        }

        self.notify.notify_one();
    }
}

async fn run_worker<H: Handler>(
    shared: Arc<Shared<H>>,
    queue: Arc<ArrayQueue<Work>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) {
    loop {
        while let Some(work) = queue.pop() {
            process_work(&shared, work).await;
        }

        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            () = notify.notified() => {}
        }
    }

    // Anything queued before shutdown is still processed.
    while let Some(work) = queue.pop() {
        process_work(&shared, work).await;
    }
    trace!("Dispatch worker stopped.");
}

/// Processes a unit of work on the blocking pool, so that handler calls never run on the thread reading the socket.
async fn process_work<H: Handler>(shared: &Arc<Shared<H>>, work: Work) {
    let worker = Arc::clone(shared);
    let result = tokio::task::spawn_blocking(move || match work {
        Work::Datagram(datagram) => {
            worker.process_datagram(&datagram, |metric| worker.handler.handle_metric(metric));
        }
        Work::Metric(metric) => worker.handler.handle_metric(metric),
    })
    .await;

    shared.track_handler_result(result);
}
