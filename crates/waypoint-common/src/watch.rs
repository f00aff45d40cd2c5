//! Change watcher
//!
//! A watch runs as its own tokio task. It repeatedly asks a [`ChangeSource`] for the
//! state of a key or prefix, passing the last index it has seen. Whenever the index
//! moves, the new key/value pairs are decoded into the caller's type and sent on the
//! update channel. Failures are sent on the error channel and polling continues after
//! a back-off.
//!
//! The loop ends when the owning client is closed or dropped, when an optional
//! caller-supplied [`ShutdownSignal`] fires, or when the caller drops the update
//! receiver. The task owns both senders, so the caller sees both channels close.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{RegistryError, Result},
    kv::{self, KvPair},
    shutdown::{ShutdownSignal, cancelled},
};

/// Upper bound for the back-off between failed polls
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// State of the watched key at a given index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub pairs: Vec<KvPair>,
}

/// Result of a single poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Poll {
    /// The backend returned data at `Snapshot::index`
    Changed(Snapshot),
    /// The request completed without a change
    Unchanged,
    /// Nothing is stored under the watched key yet
    Empty,
}

/// A backend query that can be polled for changes
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    /// Human readable description for logs
    fn describe(&self) -> String;

    /// Fetch the current state. Backends with blocking queries hold the request open
    /// until the index moves past `last_index` or their wait time elapses.
    async fn fetch(&self, last_index: u64) -> Result<Poll>;
}

/// Timing for a watch loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Delay after a failed poll, doubled per consecutive failure
    pub retry: Duration,
    /// Delay between successful polls
    pub poll_interval: Duration,
}

impl WatchOptions {
    /// Options for a backend with blocking queries
    pub fn blocking(config: &Config) -> Self {
        Self {
            retry: Duration::from_millis(config.watch_retry_ms.max(1)),
            poll_interval: Duration::ZERO,
        }
    }

    /// Options for a backend that has to be polled
    pub fn polling(config: &Config) -> Self {
        Self {
            retry: Duration::from_millis(config.watch_retry_ms.max(1)),
            poll_interval: Duration::from_millis(config.watch_poll_interval_ms.max(1)),
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.retry.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    fn idle(&self) -> Duration {
        self.retry.max(self.poll_interval)
    }
}

enum Delivery {
    Sent,
    Rejected(RegistryError),
    Closed,
}

#[async_trait]
trait UpdateSender: Send + Sync {
    async fn deliver(&self, pairs: &[KvPair]) -> Delivery;

    async fn closed(&self);
}

struct TypedSender<T> {
    updates: mpsc::Sender<T>,
}

#[async_trait]
impl<T> UpdateSender for TypedSender<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn deliver(&self, pairs: &[KvPair]) -> Delivery {
        match kv::from_pairs::<T>(pairs) {
            Ok(value) => match self.updates.send(value).await {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
            Err(e) => Delivery::Rejected(e),
        }
    }

    async fn closed(&self) {
        self.updates.closed().await
    }
}

/// Sending half of a watch, with the target type erased.
///
/// Created together with its [`Watch`] by [`channel`] and handed to
/// `RegistryClient::watch_for_changes`.
pub struct WatchSink {
    updates: Box<dyn UpdateSender>,
    errors: mpsc::Sender<RegistryError>,
    cancel: Option<broadcast::Receiver<()>>,
    cancelled: bool,
}

impl WatchSink {
    /// Also stop the watch when `signal` fires, including when it already has
    pub fn with_shutdown(mut self, signal: &ShutdownSignal) -> Self {
        // Subscribe before the flag is read; a later shutdown reaches the receiver.
        self.cancel = Some(signal.subscribe());
        self.cancelled = signal.is_shutdown();
        self
    }

    /// Whether the caller's signal had already fired when it was attached
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl std::fmt::Debug for WatchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSink")
            .field("has_cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Receiving half of a watch
#[derive(Debug)]
pub struct Watch<T> {
    pub updates: mpsc::Receiver<T>,
    pub errors: mpsc::Receiver<RegistryError>,
}

impl<T> Watch<T> {
    pub fn into_parts(self) -> (mpsc::Receiver<T>, mpsc::Receiver<RegistryError>) {
        (self.updates, self.errors)
    }
}

/// Create a linked sink and watch, each channel holding up to `capacity` items
pub fn channel<T>(capacity: usize) -> (WatchSink, Watch<T>)
where
    T: DeserializeOwned + Send + 'static,
{
    let capacity = capacity.max(1);
    let (update_tx, update_rx) = mpsc::channel(capacity);
    let (error_tx, error_rx) = mpsc::channel(capacity);

    let sink = WatchSink {
        updates: Box::new(TypedSender { updates: update_tx }),
        errors: error_tx,
        cancel: None,
        cancelled: false,
    };
    let watch = Watch {
        updates: update_rx,
        errors: error_rx,
    };
    (sink, watch)
}

/// Start a watch loop on the current runtime
pub fn spawn_watch<S: ChangeSource>(
    source: S,
    sink: WatchSink,
    shutdown: broadcast::Receiver<()>,
    options: WatchOptions,
) -> JoinHandle<()> {
    tokio::spawn(run_watch(source, sink, shutdown, options))
}

async fn stopped(
    shutdown: &mut broadcast::Receiver<()>,
    cancel: &mut Option<broadcast::Receiver<()>>,
) {
    match cancel {
        Some(cancel) => {
            tokio::select! {
                _ = cancelled(shutdown) => {}
                _ = cancelled(cancel) => {}
            }
        }
        None => cancelled(shutdown).await,
    }
}

async fn run_watch<S: ChangeSource>(
    source: S,
    sink: WatchSink,
    mut shutdown: broadcast::Receiver<()>,
    options: WatchOptions,
) {
    let description = source.describe();
    if sink.is_cancelled() {
        debug!(watch = %description, "Watch cancelled before start");
        return;
    }

    let WatchSink {
        updates,
        errors,
        mut cancel,
        ..
    } = sink;
    let mut last_index = 0u64;
    let mut failures = 0u32;

    info!(watch = %description, "Watch started");

    loop {
        let outcome = tokio::select! {
            _ = stopped(&mut shutdown, &mut cancel) => break,
            _ = updates.closed() => break,
            outcome = source.fetch(last_index) => outcome,
        };

        let delay = match outcome {
            Ok(Poll::Changed(snapshot)) => {
                failures = 0;
                if snapshot.index == last_index {
                    options.poll_interval
                } else {
                    debug!(watch = %description, index = snapshot.index, "Change detected");
                    last_index = snapshot.index;

                    let delivery = tokio::select! {
                        _ = stopped(&mut shutdown, &mut cancel) => break,
                        delivery = updates.deliver(&snapshot.pairs) => delivery,
                    };
                    match delivery {
                        Delivery::Sent => options.poll_interval,
                        Delivery::Closed => break,
                        Delivery::Rejected(err) => {
                            warn!(watch = %description, error = %err, "Failed to decode watched value");
                            tokio::select! {
                                _ = stopped(&mut shutdown, &mut cancel) => break,
                                _ = updates.closed() => break,
                                _ = errors.send(err) => {}
                            }
                            options.poll_interval
                        }
                    }
                }
            }
            Ok(Poll::Unchanged) => {
                failures = 0;
                options.poll_interval
            }
            Ok(Poll::Empty) => {
                failures = 0;
                options.idle()
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = options.backoff(failures);
                warn!(
                    watch = %description,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Watch poll failed"
                );
                tokio::select! {
                    _ = stopped(&mut shutdown, &mut cancel) => break,
                    _ = updates.closed() => break,
                    _ = errors.send(err) => {}
                }
                delay
            }
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = stopped(&mut shutdown, &mut cancel) => break,
                _ = updates.closed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    info!(watch = %description, "Watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::sync::Mutex;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Poll>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Poll>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    script: Mutex::new(script.into()),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn fetch(&self, _last_index: u64) -> Result<Poll> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().await.pop_front();
            match next {
                Some(result) => result,
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(Poll::Unchanged)
                }
            }
        }
    }

    fn changed(index: u64, entries: &[(&str, &str)]) -> Result<Poll> {
        Ok(Poll::Changed(Snapshot {
            index,
            pairs: entries.iter().map(|(k, v)| KvPair::new(*k, *v)).collect(),
        }))
    }

    fn fast_options() -> WatchOptions {
        WatchOptions {
            retry: Duration::from_millis(5),
            poll_interval: Duration::ZERO,
        }
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Writable {
        #[serde(rename = "LogLevel")]
        log_level: String,
    }

    #[tokio::test]
    async fn test_delivers_changes_in_order_and_skips_same_index() {
        let (source, _) = ScriptedSource::new(vec![
            changed(5, &[("LogLevel", "INFO")]),
            changed(5, &[("LogLevel", "INFO")]),
            Ok(Poll::Unchanged),
            changed(7, &[("LogLevel", "DEBUG")]),
        ]);
        let signal = ShutdownSignal::new();
        let (sink, mut watch) = channel::<Writable>(4);

        let handle = spawn_watch(source, sink, signal.subscribe(), fast_options());

        let first = watch.updates.recv().await.unwrap();
        let second = watch.updates.recv().await.unwrap();
        assert_eq!(first.log_level, "INFO");
        assert_eq!(second.log_level, "DEBUG");

        signal.shutdown();
        handle.await.unwrap();
        assert!(watch.updates.recv().await.is_none());
        assert!(watch.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_polling_continues() {
        let (source, _) = ScriptedSource::new(vec![
            Err(RegistryError::from_status(500, "unavailable")),
            changed(3, &[("LogLevel", "WARN")]),
        ]);
        let signal = ShutdownSignal::new();
        let (sink, mut watch) = channel::<Writable>(4);

        let handle = spawn_watch(source, sink, signal.subscribe(), fast_options());

        let err = watch.errors.recv().await.unwrap();
        assert!(matches!(err, RegistryError::Status { status: 500, .. }));
        assert_eq!(watch.updates.recv().await.unwrap().log_level, "WARN");

        signal.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_failure_goes_to_error_channel() {
        let (source, _) = ScriptedSource::new(vec![
            changed(2, &[("Unrelated", "x")]),
            changed(4, &[("LogLevel", "ERROR")]),
        ]);
        let signal = ShutdownSignal::new();
        let (sink, mut watch) = channel::<Writable>(4);

        let handle = spawn_watch(source, sink, signal.subscribe(), fast_options());

        assert!(matches!(
            watch.errors.recv().await.unwrap(),
            RegistryError::Decode(_)
        ));
        assert_eq!(watch.updates.recv().await.unwrap().log_level, "ERROR");

        signal.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_watch() {
        let (source, _) = ScriptedSource::new(vec![]);
        let signal = ShutdownSignal::new();
        let (sink, watch) = channel::<Writable>(1);

        let handle = spawn_watch(source, sink, signal.subscribe(), fast_options());
        drop(watch);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_caller_signal_stops_watch() {
        let (source, _) = ScriptedSource::new(vec![]);
        let client_signal = ShutdownSignal::new();
        let caller_signal = ShutdownSignal::new();
        let (sink, mut watch) = channel::<Writable>(1);
        let sink = sink.with_shutdown(&caller_signal);

        let handle = spawn_watch(source, sink, client_signal.subscribe(), fast_options());
        caller_signal.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(watch.updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_caller_signal_fired_before_start() {
        let (source, calls) = ScriptedSource::new(vec![]);
        let client_signal = ShutdownSignal::new();
        let caller_signal = ShutdownSignal::new();
        caller_signal.shutdown();

        let (sink, mut watch) = channel::<Writable>(1);
        let sink = sink.with_shutdown(&caller_signal);
        assert!(sink.is_cancelled());

        let handle = spawn_watch(source, sink, client_signal.subscribe(), fast_options());

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(watch.updates.recv().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_updates_stop_watch_blocked_on_errors() {
        let (source, _) = ScriptedSource::new(vec![
            Err(RegistryError::from_status(500, "unavailable")),
            Err(RegistryError::from_status(500, "unavailable")),
            Err(RegistryError::from_status(500, "unavailable")),
        ]);
        let signal = ShutdownSignal::new();
        let (sink, watch) = channel::<Writable>(1);
        let (updates, _errors) = watch.into_parts();

        let handle = spawn_watch(source, sink, signal.subscribe(), fast_options());
        // Let the error channel fill up before the update receiver goes away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(updates);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_client_signal_stops_watch() {
        let (source, _) = ScriptedSource::new(vec![]);
        let client_signal = ShutdownSignal::new();
        let (sink, _watch) = channel::<Writable>(1);

        let handle = spawn_watch(source, sink, client_signal.subscribe(), fast_options());
        drop(client_signal);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = WatchOptions {
            retry: Duration::from_secs(1),
            poll_interval: Duration::ZERO,
        };
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));
        assert_eq!(options.backoff(4), Duration::from_secs(8));
        assert_eq!(options.backoff(10), MAX_RETRY_DELAY);
    }
}
