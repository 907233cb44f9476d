//! Request counter binary - reports how many requests arrived within the retention window.

#![deny(missing_docs)]

use conf::Conf;
use request_counter::{Counter, CounterConfig, Error as CounterError, SyncPolicy};
use std::{
    env, fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod listen_http;
use listen_http::start_http_task;

/// Top-level configuration for request-counter.
#[derive(Conf, Debug)]
#[conf(serde, test)]
pub struct Config {
    /// Path to a TOML config file (optional).
    /// This is parsed before other args, so config file values can be overridden by CLI args.
    #[allow(dead_code)] // Parsed early via find_parameter, kept here for --help
    #[conf(long)]
    config_file: Option<PathBuf>,
    /// If true, just validate config and don't start
    #[conf(long)]
    dry_run: bool,
    /// Address to listen for HTTP requests on
    #[conf(long, env, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Port to listen for HTTP requests on
    #[conf(long, env, default_value = "8080")]
    port: u16,
    /// File used to persist request timestamps across restarts
    #[conf(long = "file", env = "LOG_FILE", default_value = "persistent.data")]
    log_file: PathBuf,
    /// How long a request is counted for
    #[conf(long, env, default_value = "60s", value_parser = humantime::parse_duration, serde(use_value_parser))]
    retention: Duration,
    /// How often expired requests are evicted (defaults to a tenth of the retention)
    #[conf(long, env, value_parser = humantime::parse_duration, serde(use_value_parser))]
    sweep_interval: Option<Duration>,
    /// Max number of counted requests waiting to be written to the log file
    #[conf(long, env, default_value = "1024")]
    append_queue_capacity: usize,
    /// Sync the log file to disk after every request, not just flush it
    #[conf(long)]
    fsync: bool,
    /// Keep serving from memory if writing the log file fails, instead of exiting
    #[conf(long)]
    degrade_on_append_error: bool,
    /// How long open connections get to finish on shutdown
    #[conf(long, env, default_value = "10s", value_parser = humantime::parse_duration, serde(use_value_parser))]
    shutdown_timeout: Duration,
}

impl Config {
    fn counter_config(&self) -> CounterConfig {
        let mut config = CounterConfig::new(&self.log_file)
            .with_retention(self.retention)
            .with_append_queue_capacity(self.append_queue_capacity)
            .with_sync_policy(if self.fsync {
                SyncPolicy::SyncData
            } else {
                SyncPolicy::FlushOnly
            });
        if let Some(sweep_interval) = self.sweep_interval {
            config = config.with_sweep_interval(sweep_interval);
        }
        config
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn init_logging() {
    // Build a default tracing subscriber, writing to STDERR
    // Uses RUST_LOG env var for filtering, defaults to "info" if not set
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // load dotenv file
    match dotenvy::dotenv() {
        Ok(path) => info!("Read dotenv file from: {}", path.display()),
        Err(dotenvy::Error::Io(io_error)) => {
            if matches!(io_error.kind(), std::io::ErrorKind::NotFound) {
                info!("Couldn't find a dotenv file");
            } else {
                panic!("Io error when reading dot env file: {io_error}")
            }
        }
        Err(err) => {
            panic!("Error reading dotenv file: {err}")
        }
    }
}

/// Resolves on SIGINT (ctrl-c) or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Could not listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Could not listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("ctrl-c: Stop requested"),
        _ = terminate => warn!("SIGTERM: Stop requested"),
    }
}

/// Wait for append errors until the token is cancelled.
///
/// Append failures mean counted requests are not durable. Unless `degrade` is set,
/// the first one cancels the token and is returned.
async fn watch_append_errors(
    errors: &mut UnboundedReceiver<CounterError>,
    token: &CancellationToken,
    degrade: bool,
) -> Option<CounterError> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            Some(err) = errors.recv() => {
                if degrade {
                    error!("Persistence failed, continuing with in-memory counts only: {err}");
                } else {
                    error!("Persistence failed, shutting down: {err}");
                    token.cancel();
                    return Some(err);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // Check for --config-file before the main parse, so we can load it and pass to conf
    let config_file_path = conf::find_parameter("config-file", env::args_os());

    let config = if let Some(config_path) = config_file_path {
        let path_display = config_path.to_string_lossy();
        let file_contents = fs::read_to_string(&config_path)
            .map_err(|err| format!("Could not open config file '{path_display}': {err}"))?;
        let doc: toml::Value = toml::from_str(&file_contents)
            .map_err(|err| format!("Config file '{path_display}' is not valid TOML: {err}"))?;
        info!("Loaded config file: {path_display}");
        Config::conf_builder().doc(path_display, doc).parse()
    } else {
        Config::parse()
    };

    info!("Config = {config:#?}");

    if config.dry_run {
        return Ok(());
    }

    // Replay and compact the log before accepting any traffic
    let counter = Counter::new(config.counter_config())
        .inspect_err(|err| error!("Error while loading data from file: {err}"))?;
    let counter = Arc::new(counter);

    let token = CancellationToken::new();
    let mut tasks = counter.start(token.clone()).await?;

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Server is listening at http://{listen_addr}/");

    let thread_token = token.clone();
    tokio::task::spawn(async move {
        shutdown_signal().await;
        thread_token.cancel();
    });

    let http_task = start_http_task(
        listener,
        counter.clone(),
        token.clone(),
        config.shutdown_timeout,
    );

    let fatal =
        watch_append_errors(&mut tasks.errors, &token, config.degrade_on_append_error).await;

    // Requests served while connections drain still get appended
    if let Err(err) = http_task.await {
        error!("Http task failed: {err}");
    }
    tasks.join().await;
    info!("Stopped with {} requests in the window", counter.count());

    match fatal {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
