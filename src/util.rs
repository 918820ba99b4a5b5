//! Small helpers shared across components, per the "one retry pattern" and
//! "one debouncer" design notes (§9): exponential backoff with a cap, a
//! per-key debounce timer, and atomic file writes for PEM/account data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Exponential-doubling backoff with a cap, the only retry pattern used by
/// both ACME waits (C7) and health-check retries (C3).
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { current: initial, max }
    }

    /// Current delay, then doubles (capped) for the next call.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Retry `f` up to `max_retries` additional times beyond the first
/// attempt, waiting with doubling backoff between attempts. Returns the
/// last error, wrapped with the attempt count, if every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    mut f: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(initial_backoff, max_backoff);
    let mut attempts = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempts += 1;
                if attempts > max_retries {
                    return Err(format!(
                        "health check failed after {} attempts: {}",
                        attempts, e
                    ));
                }
                tokio::time::sleep(backoff.next()).await;
            }
        }
    }
}

/// A per-key debounce timer: calling [`Debouncer::trigger`] repeatedly for
/// the same key resets that key's timer; once `delay` elapses with no
/// further triggers, `action` runs exactly once. Backs both the reconciler's
/// per-app event debouncer and the certificate manager's refresh debouncer
/// (spec §9: "provide one helper").
pub struct Debouncer {
    delay: Duration,
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reset `key`'s timer; when it next fires with no intervening trigger,
    /// spawn `action`. Multiple rapid calls coalesce into a single firing.
    pub async fn trigger<F, Fut>(&self, key: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = {
            let mut generations = self.generations.lock().await;
            let entry = generations.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let delay = self.delay;
        let generations = self.generations.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fires = {
                let generations = generations.lock().await;
                generations.get(&key).copied() == Some(generation)
            };
            if fires {
                action().await;
            }
        });
    }
}

/// Write `contents` to `path` via `tmp` + rename so a partial write is
/// never observable (spec §9 "PEM file atomicity"), with the given unix
/// permission bits applied before the rename.
#[cfg(unix)]
pub fn atomic_write(path: &std::path::Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        if let Ok(dir_file) = std::fs::File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn atomic_write(path: &std::path::Path, contents: &[u8], _mode: u32) -> std::io::Result<()> {
    use std::io::Write;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
        let delays: Vec<_> = (0..6).map(|_| b.next()).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[3], Duration::from_secs(4));
        assert_eq!(delays[4], Duration::from_secs(8));
        assert_eq!(delays[5], Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retry_with_backoff_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let result: Result<u32, String> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
            move || {
                let a = a.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(42u32)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max() {
        let result: Result<(), String> = retry_with_backoff(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
            || async { Err::<(), _>("boom") },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.contains("3 attempts"));
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn debouncer_coalesces_rapid_triggers() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let fired = fired.clone();
            debouncer
                .trigger("app-a", move || async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
