use std::{env, num::NonZeroUsize, thread};

use getopts::{Matches, Options};
use metrics_receiver_statsd::{
    Concurrency, Metric, OverflowPolicy, StatsDReceiverBuilder, DEFAULT_LISTEN_ADDRESS, ERROR_TAG,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CAPACITY: usize = 1024;

/// Receiver settings collected from the command line.
#[derive(Debug, PartialEq)]
struct Config {
    listen_address: String,
    buffer_size: Option<usize>,
    concurrency: Concurrency,
    telemetry: bool,
}

impl Config {
    fn from_matches(matches: &Matches) -> Result<Config, String> {
        let listen_address =
            matches.opt_str("listen").unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned());
        let buffer_size = parse_opt(matches, "buffer-size")?;

        let concurrency = if matches.opt_present("unbounded") {
            Concurrency::Unbounded
        } else {
            let workers = parse_opt(matches, "workers")?
                .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));
            let capacity = parse_opt(matches, "capacity")?.unwrap_or(DEFAULT_CAPACITY);
            let overflow = if matches.opt_present("drop-oldest") {
                OverflowPolicy::DropOldest
            } else {
                OverflowPolicy::DropNewest
            };
            Concurrency::Bounded { workers, capacity, overflow }
        };

        Ok(Config {
            listen_address,
            buffer_size,
            concurrency,
            telemetry: !matches.opt_present("no-telemetry"),
        })
    }

    fn into_builder(self) -> Result<StatsDReceiverBuilder, String> {
        let mut builder = StatsDReceiverBuilder::default()
            .with_listen_address(&self.listen_address)
            .map_err(|e| e.to_string())?
            .with_concurrency(self.concurrency)
            .with_telemetry(self.telemetry);
        if let Some(buffer_size) = self.buffer_size {
            builder = builder.with_receive_buffer_size(buffer_size);
        }
        Ok(builder)
    }
}

fn parse_opt(matches: &Matches, name: &str) -> Result<Option<usize>, String> {
    matches
        .opt_str(name)
        .map(|s| s.parse::<usize>().map_err(|e| format!("invalid value '{}' for --{}: {}", s, name, e)))
        .transpose()
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("l", "listen", "address to listen on (default: 0.0.0.0:8125)", "ADDRESS");
    opts.optopt("b", "buffer-size", "size of the datagram receive buffer, in bytes", "INTEGER");
    opts.optopt("w", "workers", "number of dispatch workers", "INTEGER");
    opts.optopt("c", "capacity", "maximum number of queued datagrams", "INTEGER");
    opts.optflag("", "drop-oldest", "drop the oldest queued datagram when the queue is full");
    opts.optflag("", "unbounded", "process every datagram and line in its own task");
    opts.optflag("", "no-telemetry", "disable the receiver's internal telemetry");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn log_metric(metric: Metric) {
    if metric.is_error() {
        let error = metric.tags.get(ERROR_TAG).map(String::as_str).unwrap_or_default();
        warn!(error, "Ingestion error.");
    } else {
        info!(metric_type = %metric.metric_type, bucket = %metric.bucket, value = metric.value, "{}", metric);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            return;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }

    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    info!(?config, "statsd tail");

    let builder = match config.into_builder() {
        Ok(builder) => builder,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let receiver = match builder.build(log_metric) {
        Ok(receiver) => receiver,
        Err(e) => {
            error!("Failed to start receiver: {}", e);
            return;
        }
    };
    if let Ok(local_addr) = receiver.local_addr() {
        info!(%local_addr, "Listening for StatsD metrics.");
    }

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutting down.");
        signal_shutdown.cancel();
    });

    receiver.run(shutdown).await;
}

#[cfg(test)]
mod tests {
    use metrics_receiver_statsd::{Concurrency, OverflowPolicy, DEFAULT_LISTEN_ADDRESS};

    use super::{opts, Config};

    fn config_from(args: &[&str]) -> Result<Config, String> {
        let matches = opts().parse(args).map_err(|e| e.to_string())?;
        Config::from_matches(&matches)
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.buffer_size, None);
        assert!(config.telemetry);
        assert!(matches!(
            config.concurrency,
            Concurrency::Bounded { capacity: 1024, overflow: OverflowPolicy::DropNewest, .. }
        ));
    }

    #[test]
    fn bounded_overrides() {
        let config =
            config_from(&["-l", "127.0.0.1:9125", "-b", "65535", "-w", "3", "-c", "10", "--drop-oldest"]).unwrap();
        assert_eq!(
            config,
            Config {
                listen_address: "127.0.0.1:9125".to_string(),
                buffer_size: Some(65535),
                concurrency: Concurrency::Bounded {
                    workers: 3,
                    capacity: 10,
                    overflow: OverflowPolicy::DropOldest
                },
                telemetry: true,
            }
        );
        assert!(config.into_builder().is_ok());
    }

    #[test]
    fn unbounded_without_telemetry() {
        let config = config_from(&["--unbounded", "--no-telemetry"]).unwrap();
        assert_eq!(config.concurrency, Concurrency::Unbounded);
        assert!(!config.telemetry);
    }

    #[test]
    fn invalid_values() {
        assert!(config_from(&["-w", "many"]).unwrap_err().contains("--workers"));
        assert!(config_from(&["-b", "-1"]).is_err());

        let config = config_from(&["-l", "nowhere"]).unwrap();
        assert!(config.into_builder().is_err());
    }
}
