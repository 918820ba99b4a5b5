//! Health monitor (C5): the ticker loop that drives the checker and tracker.
//! Runs as a single background task; external callers observe state through
//! `get_healthy_targets`/`get_stats` or are notified of flips via the
//! `on_change` callback (the reconciler uses this to re-swap the route
//! table without polling).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CheckResult, HealthChecker, HealthTracker, RetryConfig, Target};

/// Supplies the monitor with the current set of targets to probe. The
/// deployment manager implements this over its committed replica list.
pub trait TargetProvider: Send + Sync {
    fn current_targets(&self) -> Vec<Target>;
}

/// The reconciler's committed target list, published after every
/// reconciliation pass and read by the monitor on each tick. Kept as a
/// plain swapped snapshot rather than a channel since the monitor only
/// ever wants "the latest", never a history of intermediate commits.
pub struct SharedTargets(arc_swap::ArcSwap<Vec<Target>>);

impl SharedTargets {
    pub fn new() -> Self {
        Self(arc_swap::ArcSwap::from_pointee(Vec::new()))
    }

    pub fn set(&self, targets: Vec<Target>) {
        self.0.store(Arc::new(targets));
    }
}

impl Default for SharedTargets {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetProvider for SharedTargets {
    fn current_targets(&self) -> Vec<Target> {
        (**self.0.load()).clone()
    }
}

pub struct HealthMonitor {
    checker: Arc<HealthChecker>,
    tracker: Arc<RwLock<HealthTracker>>,
    provider: Arc<dyn TargetProvider>,
    interval: Duration,
    retry: RetryConfig,
    max_concurrent: usize,
    on_change: Option<Arc<dyn Fn(&[Target]) + Send + Sync>>,
    force_check_tx: mpsc::Sender<()>,
    force_check_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        checker: HealthChecker,
        fall: u32,
        rise: u32,
        provider: Arc<dyn TargetProvider>,
        interval: Duration,
        retry: RetryConfig,
        max_concurrent: usize,
    ) -> Self {
        let (force_check_tx, force_check_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            checker: Arc::new(checker),
            tracker: Arc::new(RwLock::new(HealthTracker::new(fall, rise))),
            provider,
            interval,
            retry,
            max_concurrent: max_concurrent.max(1),
            on_change: None,
            force_check_tx,
            force_check_rx: parking_lot::Mutex::new(Some(force_check_rx)),
            handle: parking_lot::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a callback invoked unconditionally once per tick with the
    /// complete current healthy-target set (spec §4.5) — not once per
    /// flipped target. The reconciler wires this straight into
    /// `RouteTable::narrow_to_healthy`.
    pub fn with_on_change(mut self, cb: impl Fn(&[Target]) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(cb));
        self
    }

    /// Spawns the ticker loop. Idempotent: a second call while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle_guard = self.handle.lock();
        if handle_guard.is_some() {
            return;
        }

        let mut force_check_rx = self
            .force_check_rx
            .lock()
            .take()
            .expect("force_check_rx taken twice");
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.run_once().await;
                    }
                    _ = force_check_rx.recv() => {
                        this.run_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("health monitor shutting down");
                            break;
                        }
                    }
                }
            }
        });

        *handle_guard = Some(task);
    }

    /// Stops the ticker loop. Idempotent. Also cancels any in-flight probes
    /// so a shutdown isn't held up by a stuck backend.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
        let task = self.handle.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Coalesced out-of-band probe request; a burst of calls between ticks
    /// collapses into a single extra run.
    pub fn force_check(&self) {
        let _ = self.force_check_tx.try_send(());
    }

    async fn run_once(&self) {
        let targets = self.provider.current_targets();
        let membership_changed = self.tracker.write().sync_targets(&targets);
        if membership_changed {
            debug!(count = targets.len(), "health monitor target set changed");
        }

        let results: Vec<(Target, CheckResult)> = {
            let mut out = Vec::with_capacity(targets.len());
            let futures = targets.iter().map(|t| {
                let checker = self.checker.clone();
                let retry = self.retry;
                let cancel = self.cancel.clone();
                let t = t.clone();
                async move {
                    let result = checker.check_with_retry(&t, retry, &cancel, None).await;
                    (t, result)
                }
            });
            use futures::stream::{self, StreamExt};
            let mut stream = stream::iter(futures).buffer_unordered(self.max_concurrent);
            while let Some(pair) = stream.next().await {
                out.push(pair);
            }
            out
        };

        let mut flip_count = 0usize;
        {
            let mut tracker = self.tracker.write();
            for (target, result) in &results {
                if !result.healthy {
                    warn!(target = %target.id, error = ?result.error, "health check failed");
                }
                if tracker.record(&target.id, result) {
                    flip_count += 1;
                }
            }
        }
        if flip_count > 0 {
            debug!(flips = flip_count, "health monitor target state changed");
        }

        if let Some(cb) = &self.on_change {
            let healthy = self.tracker.read().healthy_targets();
            cb(&healthy);
        }
    }

    pub fn get_healthy_targets(&self) -> Vec<Target> {
        self.tracker.read().healthy_targets()
    }

    pub fn get_unhealthy_targets(&self) -> Vec<Target> {
        self.tracker.read().unhealthy_targets()
    }

    /// `(total, healthy, unhealthy)`.
    pub fn get_stats(&self) -> (usize, usize, usize) {
        self.tracker.read().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedProvider(Vec<Target>);
    impl TargetProvider for FixedProvider {
        fn current_targets(&self) -> Vec<Target> {
            self.0.clone()
        }
    }

    fn target(port: u16) -> Target {
        Target {
            id: format!("c-{port}"),
            app: "web".to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            health_path: "/healthz".to_string(),
        }
    }

    #[tokio::test]
    async fn run_once_marks_unreachable_targets_unhealthy_after_fall_threshold() {
        let monitor = Arc::new(HealthMonitor::new(
            HealthChecker::new(Duration::from_millis(50)),
            1,
            1,
            Arc::new(FixedProvider(vec![target(1)])),
            Duration::from_millis(10),
            RetryConfig {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            4,
        ));
        monitor.run_once().await;
        assert_eq!(monitor.get_stats(), (1, 0, 1));
    }

    #[tokio::test]
    async fn on_change_fires_exactly_once_per_tick_with_full_healthy_set() {
        let snapshots: Arc<StdMutex<Vec<Vec<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let snapshots_clone = snapshots.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let monitor = Arc::new(
            HealthMonitor::new(
                HealthChecker::new(Duration::from_millis(50)),
                1,
                1,
                Arc::new(FixedProvider(vec![target(1)])),
                Duration::from_millis(10),
                RetryConfig {
                    max_retries: 0,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(1),
                },
                4,
            )
            .with_on_change(move |healthy| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                snapshots_clone.lock().unwrap().push(healthy.iter().map(|t| t.id.clone()).collect());
            }),
        );

        monitor.run_once().await;
        monitor.run_once().await;

        // Fires every tick regardless of whether anything flipped, always
        // with the complete current healthy set (empty here — port 1 never
        // answers).
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(snapshots.lock().unwrap()[0].is_empty());
        assert!(snapshots.lock().unwrap()[1].is_empty());
    }
}
