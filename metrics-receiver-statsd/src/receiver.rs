use std::{future::Future, io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    dispatch::{Concurrency, Datagram, Dispatcher, Shared},
    handler::Handler,
    metric::Metric,
    telemetry::Telemetry,
};

/// A StatsD receiver bound to a UDP socket.
///
/// The receiver owns its socket for its entire lifetime: the socket is closed when [`run`][StatsDReceiver::run]
/// returns, or when the receiver is dropped without being run.
///
/// Receivers are created with [`StatsDReceiverBuilder`][crate::StatsDReceiverBuilder].
pub struct StatsDReceiver<H> {
    socket: UdpSocket,
    shared: Arc<Shared<H>>,
    receive_buffer_size: usize,
    concurrency: Concurrency,
}

impl<H: Handler> StatsDReceiver<H> {
    pub(crate) fn new(
        socket: UdpSocket,
        handler: H,
        telemetry: Telemetry,
        receive_buffer_size: usize,
        concurrency: Concurrency,
    ) -> Self {
        StatsDReceiver {
            socket,
            shared: Arc::new(Shared { handler, telemetry }),
            receive_buffer_size,
            concurrency,
        }
    }

    /// Returns the local address the receiver is bound to.
    ///
    /// # Errors
    ///
    /// If the address cannot be queried from the underlying socket, an error is returned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs the receiver until `shutdown` is cancelled.
    ///
    /// Each datagram is copied out of the receive buffer and handed off for concurrent processing, so reading never
    /// waits on the handler. Every line is parsed and delivered to the handler. Lines that fail to parse, as well as
    /// failed socket reads, are delivered as error metrics (see [`Metric::error`]) and never stop the receiver.
    ///
    /// Cancellation is checked before every read. Datagrams that were already handed off are not waited on: they may
    /// still be reaching the handler after this method returns.
    pub async fn run(self, shutdown: CancellationToken) {
        let StatsDReceiver { socket, shared, receive_buffer_size, concurrency } = self;

        debug!(local_addr = ?socket.local_addr().ok(), ?concurrency, "StatsD receiver started.");
        receive_loop(&socket, shared, receive_buffer_size, concurrency, shutdown).await;
        debug!("StatsD receiver stopped.");
    }
}

/// Where the receive loop reads datagrams from.
pub(crate) trait DatagramSource: Send + Sync {
    /// Receives a single datagram into `buf`, returning its length and sender.
    fn recv_datagram<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a;
}

impl DatagramSource for UdpSocket {
    fn recv_datagram<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a {
        self.recv_from(buf)
    }
}

async fn receive_loop<S, H>(
    source: &S,
    shared: Arc<Shared<H>>,
    receive_buffer_size: usize,
    concurrency: Concurrency,
    shutdown: CancellationToken,
) where
    S: DatagramSource,
    H: Handler,
{
    let (dispatcher, _workers) = Dispatcher::start(concurrency, Arc::clone(&shared));
    let mut buf = vec![0; receive_buffer_size];

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            result = source.recv_datagram(&mut buf) => match result {
                Ok((len, peer)) => {
                    trace!(%peer, len, "Received datagram.");
                    shared.telemetry.track_packet_received(len);

                    let payload = Bytes::copy_from_slice(&buf[..len]);
                    dispatcher.dispatch(Datagram { payload, peer });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive datagram.");
                    shared.telemetry.track_receive_error();
                    dispatcher.deliver(Metric::error(e.to_string()));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        future::Future,
        io,
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tokio_util::sync::CancellationToken;

    use super::{receive_loop, DatagramSource};
    use crate::{
        dispatch::{Concurrency, OverflowPolicy, Shared},
        handler::Handler,
        metric::{Metric, MetricType},
        telemetry::Telemetry,
    };

    type Read = io::Result<(Vec<u8>, SocketAddr)>;

    /// Replays a fixed sequence of reads, then waits forever.
    struct ScriptedSource(Mutex<VecDeque<Read>>);

    impl ScriptedSource {
        fn new(reads: Vec<Read>) -> Self {
            ScriptedSource(Mutex::new(reads.into()))
        }
    }

    impl DatagramSource for ScriptedSource {
        fn recv_datagram<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a {
            let next = self.0.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(Ok((payload, peer))) => {
                        buf[..payload.len()].copy_from_slice(&payload);
                        Ok((payload.len(), peer))
                    }
                    Some(Err(e)) => Err(e),
                    None => std::future::pending().await,
                }
            }
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Metric>>);

    impl Handler for Collecting {
        fn handle_metric(&self, metric: Metric) {
            self.0.lock().unwrap().push(metric);
        }
    }

    #[tokio::test]
    async fn read_errors_become_error_metrics_and_receiving_continues() {
        let concurrencies = [
            Concurrency::Unbounded,
            Concurrency::Bounded { workers: 1, capacity: 8, overflow: OverflowPolicy::DropNewest },
        ];

        for concurrency in concurrencies {
            let recorder = DebuggingRecorder::new();
            let snapshotter = recorder.snapshotter();
            let telemetry = metrics::with_local_recorder(&recorder, || Telemetry::new("udp"));

            let peer = SocketAddr::from(([127, 0, 0, 1], 4321));
            let source = ScriptedSource::new(vec![
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")),
                Ok((b"after.error:1|c".to_vec(), peer)),
            ]);
            let collecting = Arc::new(Collecting::default());
            let shared = Arc::new(Shared { handler: Arc::clone(&collecting), telemetry });

            let shutdown = CancellationToken::new();
            let task = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { receive_loop(&source, shared, 64, concurrency, shutdown).await })
            };

            let mut metrics = Vec::new();
            for _ in 0..400 {
                metrics = collecting.0.lock().unwrap().clone();
                if metrics.len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            metrics.sort_by(|a, b| a.bucket.cmp(&b.bucket));

            assert_eq!(
                metrics,
                vec![
                    Metric::new(MetricType::Counter, "after.error", 1.0),
                    Metric::error("connection refused"),
                ],
                "concurrency: {:?}",
                concurrency
            );

            shutdown.cancel();
            tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

            let receive_errors = snapshotter.snapshot().into_vec().into_iter().find_map(|(ck, _, _, value)| {
                let (_, key) = ck.into_parts();
                (key.name() == "statsd.receiver.receive_errors").then_some(value)
            });
            assert_eq!(receive_errors, Some(DebugValue::Counter(1)));
        }
    }

    #[tokio::test]
    async fn cancellation_wins_over_ready_reads() {
        let peer = SocketAddr::from(([127, 0, 0, 1], 4321));
        let source = ScriptedSource::new(vec![Ok((b"never:1|c".to_vec(), peer))]);
        let collecting = Arc::new(Collecting::default());
        let shared = Arc::new(Shared { handler: Arc::clone(&collecting), telemetry: Telemetry::noop() });

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        receive_loop(&source, shared, 64, Concurrency::Unbounded, shutdown).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(collecting.0.lock().unwrap().is_empty());
    }
}
