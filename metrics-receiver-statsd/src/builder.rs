use std::{
    io,
    net::{SocketAddr, ToSocketAddrs as _},
    num::NonZeroUsize,
    thread,
};

use thiserror::Error;
use tokio::{net::UdpSocket, runtime};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::{Concurrency, OverflowPolicy},
    handler::Handler,
    receiver::StatsDReceiver,
    telemetry::Telemetry,
};

/// The default listen address: all interfaces, on the well-known StatsD port.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8125";

const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8192;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors that could occur while building or spawning a StatsD receiver.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse or resolve the listen address.
    #[error("invalid listen address: {reason}")]
    InvalidListenAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to bind the UDP socket, or to prepare an existing one for use.
    #[error("failed to bind UDP socket: {0}")]
    FailedToBind(#[source] io::Error),

    /// Failed to create the runtime or the background thread that runs the receiver.
    #[error("failed to create runtime for receiver: {0}")]
    FailedToCreateRuntime(String),

    /// The concurrency settings are not usable.
    #[error("invalid concurrency settings: {reason}")]
    InvalidConcurrency {
        /// Details about which setting is invalid.
        reason: String,
    },

    /// The receive buffer size is zero, which would truncate every datagram to nothing.
    #[error("receive buffer size must be at least 1 byte")]
    InvalidReceiveBufferSize,
}

/// Builder for a StatsD receiver.
pub struct StatsDReceiverBuilder {
    listen_addrs: Vec<SocketAddr>,
    receive_buffer_size: usize,
    concurrency: Concurrency,
    telemetry: bool,
}

impl StatsDReceiverBuilder {
    /// Set the address to listen on.
    ///
    /// The address must be in the format of `<host>:<port>`. If the host resolves to multiple addresses, each is tried
    /// in turn until one can be bound.
    ///
    /// Defaults to `0.0.0.0:8125`.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed or resolved, an error will be returned indicating the reason.
    pub fn with_listen_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.listen_addrs = resolve_listen_address(addr.as_ref())
            .map_err(|reason| BuildError::InvalidListenAddress { reason })?;
        Ok(self)
    }

    /// Set the size of the buffer each datagram is read into.
    ///
    /// Datagrams larger than this are truncated by the operating system, and the lines past the cut are lost or
    /// mangled. A size of zero is rejected when the receiver is built.
    ///
    /// Defaults to 8192 bytes.
    #[must_use]
    pub fn with_receive_buffer_size(mut self, receive_buffer_size: usize) -> Self {
        self.receive_buffer_size = receive_buffer_size;
        self
    }

    /// Set how received datagrams are processed concurrently.
    ///
    /// See [`Concurrency`] for the available strategies.
    ///
    /// Defaults to [`Concurrency::Bounded`] with one worker per available CPU, a queue of 1,024 datagrams, and
    /// [`OverflowPolicy::DropNewest`].
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets whether or not to enable telemetry for the receiver.
    ///
    /// When enabled, counters describing the receiver's own behavior, such as the number of packets received, lines
    /// that failed to parse, and datagrams dropped, are registered with the `metrics` recorder installed at the time
    /// the receiver is built.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the receiver, binding its socket.
    ///
    /// The receiver does nothing until [`StatsDReceiver::run`] is called.
    ///
    /// # Errors
    ///
    /// If the receiver settings are invalid, or the socket cannot be bound, an error will be returned.
    ///
    /// # Panics
    ///
    /// This method must be called from within an existing Tokio runtime or it will panic.
    pub fn build<H>(self, handler: H) -> Result<StatsDReceiver<H>, BuildError>
    where
        H: Handler,
    {
        self.validate()?;

        let socket = std::net::UdpSocket::bind(&self.listen_addrs[..]).map_err(BuildError::FailedToBind)?;
        self.build_with_socket(socket, handler)
    }

    /// Builds the receiver on a socket that is already open.
    ///
    /// The socket can be bound, and even connected, however the caller sees fit. The configured listen address is
    /// ignored.
    ///
    /// # Errors
    ///
    /// If the receiver settings are invalid, or the socket cannot be switched to non-blocking mode and registered with
    /// the runtime, an error will be returned.
    ///
    /// # Panics
    ///
    /// This method must be called from within an existing Tokio runtime or it will panic.
    pub fn build_with_socket<H>(self, socket: std::net::UdpSocket, handler: H) -> Result<StatsDReceiver<H>, BuildError>
    where
        H: Handler,
    {
        self.validate()?;

        socket.set_nonblocking(true).map_err(BuildError::FailedToBind)?;
        let socket = UdpSocket::from_std(socket).map_err(BuildError::FailedToBind)?;

        let telemetry = if self.telemetry { Telemetry::new("udp") } else { Telemetry::noop() };

        Ok(StatsDReceiver::new(socket, handler, telemetry, self.receive_buffer_size, self.concurrency))
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.receive_buffer_size == 0 {
            return Err(BuildError::InvalidReceiveBufferSize);
        }
        validate_concurrency(self.concurrency)
    }

    /// Builds the receiver and runs it until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// If the receiver cannot be built, an error will be returned. Once running, the receiver only returns when
    /// `shutdown` is cancelled.
    pub async fn listen_and_receive<H>(self, handler: H, shutdown: CancellationToken) -> Result<(), BuildError>
    where
        H: Handler,
    {
        let receiver = self.build(handler)?;
        receiver.run(shutdown).await;
        Ok(())
    }

    /// Builds the receiver and spawns it in the background.
    ///
    /// When called from within a Tokio runtime, the receiver is spawned directly into the runtime. Otherwise, a new
    /// single-threaded Tokio runtime is created on a background thread, and the receiver is spawned there. Handler
    /// calls run on the runtime's blocking pool either way, so a slow handler does not hold up the receive loop.
    ///
    /// # Errors
    ///
    /// If the receiver cannot be built, or the background runtime cannot be created, an error will be returned.
    pub fn spawn<H>(self, handler: H) -> Result<ReceiverHandle, BuildError>
    where
        H: Handler,
    {
        let shutdown = CancellationToken::new();

        let local_addr = if let Ok(handle) = runtime::Handle::try_current() {
            let receiver = {
                let _g = handle.enter();
                self.build(handler)?
            };
            let local_addr = receiver.local_addr().map_err(BuildError::FailedToBind)?;

            handle.spawn(receiver.run(shutdown.clone()));

            local_addr
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            let receiver = {
                let _g = runtime.enter();
                self.build(handler)?
            };
            let local_addr = receiver.local_addr().map_err(BuildError::FailedToBind)?;

            let token = shutdown.clone();
            thread::Builder::new()
                .name("metrics-receiver-statsd".to_string())
                .spawn(move || runtime.block_on(receiver.run(token)))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            local_addr
        };

        Ok(ReceiverHandle { local_addr, shutdown })
    }
}

impl Default for StatsDReceiverBuilder {
    fn default() -> Self {
        StatsDReceiverBuilder {
            listen_addrs: vec![SocketAddr::from(([0, 0, 0, 0], 8125))],
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            concurrency: Concurrency::Bounded {
                workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
                capacity: DEFAULT_QUEUE_CAPACITY,
                overflow: OverflowPolicy::DropNewest,
            },
            telemetry: true,
        }
    }
}

/// A handle to a receiver spawned with [`StatsDReceiverBuilder::spawn`].
#[derive(Clone, Debug)]
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ReceiverHandle {
    /// Returns the local address the receiver is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the receiver.
    ///
    /// The receiver stops reading new datagrams, but datagrams that were already received may still be delivered to
    /// the handler afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn resolve_listen_address(addr: &str) -> Result<Vec<SocketAddr>, String> {
    match addr.to_socket_addrs() {
        Ok(addrs) => {
            let addrs = addrs.collect::<Vec<_>>();
            if addrs.is_empty() {
                Err(format!("'{}' did not resolve to any address", addr))
            } else {
                Ok(addrs)
            }
        }
        Err(e) => Err(e.to_string()),
    }
}

fn validate_concurrency(concurrency: Concurrency) -> Result<(), BuildError> {
    if let Concurrency::Bounded { workers, capacity, .. } = concurrency {
        if workers == 0 {
            return Err(BuildError::InvalidConcurrency { reason: "workers must be at least 1".to_string() });
        }
        if capacity == 0 {
            return Err(BuildError::InvalidConcurrency { reason: "capacity must be at least 1".to_string() });
        }
    }
    Ok(())
}
