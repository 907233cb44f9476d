//! The counter aggregate: window store, sweeper and persistence log together.

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    persist_log::{LogAppender, PersistenceLog, SyncPolicy},
    sweeper::{Sweeper, default_sweep_interval},
    timestamp::Timestamp,
    window_store::WindowStore,
};
use chrono::TimeDelta;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default retention: requests from the last minute are counted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// Default number of accepted requests that may wait for their durable append.
pub const DEFAULT_APPEND_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`Counter`].
#[derive(Clone, Debug)]
pub struct CounterConfig {
    /// Path of the persistence log.
    pub log_file: PathBuf,
    /// How long a request stays in the window.
    pub retention: Duration,
    /// How often expired entries are evicted. Defaults to a tenth of the retention.
    pub sweep_interval: Option<Duration>,
    /// Bound on requests counted but not yet handed to the log. Together with the
    /// record being written, this is the loss window on a crash.
    pub append_queue_capacity: usize,
    /// Whether each append is synced to disk or only flushed to the OS.
    pub sync_policy: SyncPolicy,
}

impl CounterConfig {
    /// Default configuration for the given log file.
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            retention: DEFAULT_RETENTION,
            sweep_interval: None,
            append_queue_capacity: DEFAULT_APPEND_QUEUE_CAPACITY,
            sync_policy: SyncPolicy::default(),
        }
    }

    pub fn with_retention(self, retention: Duration) -> Self {
        Self { retention, ..self }
    }

    pub fn with_sweep_interval(self, sweep_interval: Duration) -> Self {
        Self {
            sweep_interval: Some(sweep_interval),
            ..self
        }
    }

    pub fn with_append_queue_capacity(self, append_queue_capacity: usize) -> Self {
        Self {
            append_queue_capacity,
            ..self
        }
    }

    pub fn with_sync_policy(self, sync_policy: SyncPolicy) -> Self {
        Self {
            sync_policy,
            ..self
        }
    }

    /// The sweep interval that will actually be used
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or_else(|| default_sweep_interval(self.retention))
    }

    fn retention_delta(&self) -> Result<TimeDelta, Error> {
        if self.retention.is_zero() {
            return Err(Error::Config("retention must be > 0".into()));
        }
        TimeDelta::from_std(self.retention)
            .map_err(|err| Error::Config(format!("retention is out of range: {err}")))
    }
}

/// Handles on the background tasks started by [`Counter::start`].
#[derive(Debug)]
pub struct CounterTasks {
    pub sweeper: JoinHandle<()>,
    pub appender: JoinHandle<()>,
    /// Append failures. Each one means a counted request was not persisted.
    pub errors: UnboundedReceiver<Error>,
    stop_appender: CancellationToken,
}

impl CounterTasks {
    /// Stop the append task and wait for both tasks to finish.
    ///
    /// Call this once nothing records anymore (after the http listener has
    /// drained). The append task writes everything still queued before it exits,
    /// and the sweeper exits once the token given to [`Counter::start`] is cancelled.
    pub async fn join(self) {
        self.stop_appender.cancel();
        let (sweeper, appender) = tokio::join!(self.sweeper, self.appender);
        if let Err(err) = sweeper {
            error!("Sweeper task failed: {err}");
        }
        if let Err(err) = appender {
            error!("Append task failed: {err}");
        }
    }
}

/// Counts requests over a sliding window, persisting their timestamps.
///
/// The window store answers counts, the sweeper keeps it within the retention,
/// and the append task makes each request durable in the background. The counted
/// value never waits on the disk: a request is in the count as soon as
/// [`Counter::record_and_count`] returns, and reaches the log some time later.
pub struct Counter {
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    log: PersistenceLog,
    retention: TimeDelta,
    sweep_interval: Duration,
    sync_policy: SyncPolicy,
    append_tx: Sender<Timestamp>,
    append_rx: Mutex<Option<Receiver<Timestamp>>>,
}

impl Counter {
    /// Create a counter, replaying and compacting its persistence log.
    ///
    /// Fails if the log cannot be opened, read or rewritten. The service must
    /// not start counting on top of an unreconciled log.
    pub fn new(config: CounterConfig) -> Result<Self, Error> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`Counter::new`], reading time from the given clock.
    pub fn with_clock(config: CounterConfig, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let retention = config.retention_delta()?;
        if config.append_queue_capacity == 0 {
            return Err(Error::Config("append queue capacity must be > 0".into()));
        }

        let cutoff = clock.now().checked_sub_signed(retention).ok_or_else(|| {
            Error::Config(format!(
                "retention of {} reaches before the earliest representable time",
                humantime::format_duration(config.retention)
            ))
        })?;

        let log = PersistenceLog::new(config.log_file.clone());
        let report = log.load(cutoff)?;
        let store = Arc::new(WindowStore::from_entries(report.retained));
        let (append_tx, append_rx) = mpsc::channel(config.append_queue_capacity);

        Ok(Self {
            store,
            clock,
            log,
            retention,
            sweep_interval: config.effective_sweep_interval(),
            sync_policy: config.sync_policy,
            append_tx,
            append_rx: Mutex::new(Some(append_rx)),
        })
    }

    /// Start the sweeper and append tasks.
    ///
    /// The sweeper runs until the token is cancelled. The append task keeps
    /// persisting until [`CounterTasks::join`], so requests still being served
    /// after cancellation reach the log.
    ///
    /// Requests recorded before this is called wait in the append queue.
    pub async fn start(&self, token: CancellationToken) -> Result<CounterTasks, Error> {
        let Some(append_rx) = self
            .append_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(Error::AlreadyStarted);
        };
        let appender = match self.log.open_appender(self.sync_policy).await {
            Ok(appender) => appender,
            Err(err) => {
                // Not started, so a later call may try again
                *self.append_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(append_rx);
                return Err(Error::OpenAppender(err));
            }
        };

        let sweeper = Sweeper::new(
            self.store.clone(),
            self.clock.clone(),
            self.retention,
            self.sweep_interval,
        );
        let sweeper = tokio::task::spawn(sweeper.run(token.clone()));

        let (errors_tx, errors) = unbounded_channel();
        let stop_appender = CancellationToken::new();
        let appender = tokio::task::spawn(run_appender(
            appender,
            append_rx,
            errors_tx,
            stop_appender.clone(),
        ));

        info!(
            "Counter started: {} in window, retention {}, log {}",
            self.store.count(),
            humantime::format_duration(self.retention()),
            self.log.path().display()
        );

        Ok(CounterTasks {
            sweeper,
            appender,
            errors,
            stop_appender,
        })
    }

    /// Record a request now and return the count including it.
    ///
    /// The insert and the count happen under one lock, so concurrent requests
    /// never report the same value. The durable append is handed off afterwards;
    /// this waits only if the append queue is full.
    pub async fn record_and_count(&self) -> usize {
        let now = self.clock.now();
        let count = self.store.record_and_count(now);
        if self.append_tx.send(now).await.is_err() {
            warn!("Append task has stopped, request at {now} will not be persisted");
        }
        count
    }

    /// Number of requests currently in the window.
    pub fn count(&self) -> usize {
        self.store.count()
    }

    /// The configured retention.
    pub fn retention(&self) -> Duration {
        self.retention.to_std().unwrap_or_default()
    }

    /// The sweep interval in use, i.e. the staleness bound on [`Counter::count`].
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Path of the persistence log.
    pub fn log_path(&self) -> &std::path::Path {
        self.log.path()
    }
}

/// Owns the log file after startup and appends every handed-off timestamp.
///
/// Once stopped, takes no new timestamps, writes what is already queued and syncs.
async fn run_appender(
    mut appender: LogAppender,
    mut rx: Receiver<Timestamp>,
    errors: UnboundedSender<Error>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(ts) => append_one(&mut appender, &ts, &errors).await,
                // Every sender is gone, the counter was dropped
                None => break,
            },
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(ts) = rx.recv().await {
        append_one(&mut appender, &ts, &errors).await;
        drained += 1;
    }
    if let Err(err) = appender.sync().await {
        error!("Could not sync persistence log on shutdown: {err}");
        let _ = errors.send(Error::Append(err));
    }
    info!("Append task stopped, drained {drained} queued timestamps");
}

async fn append_one(appender: &mut LogAppender, ts: &Timestamp, errors: &UnboundedSender<Error>) {
    if let Err(err) = appender.append(ts).await {
        error!("Could not persist request at {ts}: {err}");
        let _ = errors.send(Error::Append(err));
    }
}
