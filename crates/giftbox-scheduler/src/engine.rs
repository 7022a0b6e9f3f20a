//! Timer Engine: the single dispatch loop that fires durable timers.
//! Sleeps until the next expiry (or the poll interval), wakes early when a
//! sooner timer is scheduled, and re-dispatches past-due timers at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};

use giftbox_core::config::TimerConfig;
use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::types::EventKey;

use crate::persistence::GiftboxDb;
use crate::timers::Timer;

/// Processes a fired timer. `Ok` consumes it; `Err` leaves it due for retry.
/// Must be idempotent: the same timer can be delivered again after a crash.
#[async_trait]
pub trait TimerHandler: Send + Sync {
    async fn on_timer(&self, timer: &Timer) -> Result<()>;
}

/// Wakes the dispatch loop. Cloned into anything that writes timers.
#[derive(Clone, Default)]
pub struct TimerSignal {
    notify: Arc<Notify>,
}

impl TimerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Dispatch counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub fired: u64,
    pub consumed: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    fired: AtomicU64,
    consumed: AtomicU64,
    retried: AtomicU64,
}

/// State shared with dispatch tasks.
struct Shared {
    db: Arc<GiftboxDb>,
    handler: Arc<dyn TimerHandler>,
    config: TimerConfig,
    signal: TimerSignal,
    /// Keys whose handler is running. One in-flight dispatch per key.
    in_flight: Mutex<HashSet<EventKey>>,
    /// Failed keys and the earliest instant they may fire again.
    backoff: Mutex<HashMap<EventKey, DateTime<Utc>>>,
    counters: Counters,
}

impl Shared {
    fn claim(&self, key: EventKey) -> bool {
        self.in_flight.lock().map(|mut set| set.insert(key)).unwrap_or(false)
    }

    fn release(&self, key: EventKey) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&key);
        }
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: EventKey) -> bool {
        self.in_flight.lock().map(|set| set.contains(&key)).unwrap_or(false)
    }

    fn back_off(&self, key: EventKey) {
        let delay = chrono::Duration::from_std(self.config.retry_delay())
            .unwrap_or_else(|_| chrono::Duration::zero());
        if let Ok(mut map) = self.backoff.lock() {
            map.insert(key, Utc::now() + delay);
        }
    }

    fn clear_backoff(&self, key: EventKey) {
        if let Ok(mut map) = self.backoff.lock() {
            map.remove(&key);
        }
    }

    /// Run the handler for one claimed timer, then consume or schedule a retry.
    async fn fire(self: Arc<Self>, timer: Timer) {
        let key = timer.key;
        let _claim = Claim {
            shared: Arc::clone(&self),
            key,
        };
        self.counters.fired.fetch_add(1, Ordering::Relaxed);
        tracing::info!("🔔 Timer fired: {} ({} '{}')", key, timer.kind.as_str(), timer.title);

        let limit = self.config.dispatch_timeout();
        let result = match tokio::time::timeout(limit, self.handler.on_timer(&timer)).await {
            Ok(result) => result,
            Err(_) => Err(GiftboxError::Timeout(format!(
                "handler for timer {key} exceeded {}s",
                limit.as_secs()
            ))),
        };

        match result {
            Ok(()) => match self.db.consume_timer(&timer) {
                Ok(true) => {
                    self.counters.consumed.fetch_add(1, Ordering::Relaxed);
                    self.clear_backoff(key);
                    tracing::info!("✅ Timer consumed: {key}");
                }
                Ok(false) => {
                    self.clear_backoff(key);
                    tracing::debug!("⏭️ Timer {key} was moved or removed while firing");
                }
                Err(e) => {
                    self.back_off(key);
                    tracing::warn!("⚠️ Timer {key} handled but not consumed: {e}");
                }
            },
            Err(e) => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.back_off(key);
                tracing::warn!(
                    "⚠️ Timer {key} failed, retrying in {}s: {e}",
                    self.config.retry_delay().as_secs()
                );
            }
        }
    }
}

/// Holds a key in the in-flight set; released on drop, panics included.
struct Claim {
    shared: Arc<Shared>,
    key: EventKey,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.shared.release(self.key);
        self.shared.signal.wake();
    }
}

/// Owns the dispatch loop and its in-flight tasks.
pub struct TimerEngine {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl TimerEngine {
    pub fn new(
        db: Arc<GiftboxDb>,
        handler: Arc<dyn TimerHandler>,
        config: TimerConfig,
        signal: TimerSignal,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                db,
                handler,
                config,
                signal,
                in_flight: Mutex::new(HashSet::new()),
                backoff: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            fired: c.fired.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Spawn a task for every due timer that is not in flight or backing off.
    /// Returns how many were dispatched.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.shared.db.due_timers(now)?;

        let waiting: HashSet<EventKey> = match self.shared.backoff.lock() {
            Ok(mut map) => {
                map.retain(|_, at| *at > now);
                map.keys().copied().collect()
            }
            Err(_) => HashSet::new(),
        };

        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        let mut dispatched = 0;
        for timer in due {
            if waiting.contains(&timer.key) {
                continue;
            }
            if !self.shared.claim(timer.key) {
                tracing::debug!("⏭️ Timer {} already in flight", timer.key);
                continue;
            }
            dispatched += 1;
            tasks.spawn(Arc::clone(&self.shared).fire(timer));
        }
        Ok(dispatched)
    }

    /// How long the loop may sleep before something could become due.
    fn next_wait(&self) -> Duration {
        let now = Utc::now();
        let mut wait = self.shared.config.poll_interval();

        match self.shared.db.next_timer_after(now) {
            Ok(Some(next)) => {
                wait = wait.min((next.expires_at - now).to_std().unwrap_or_default());
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ Failed to read next timer: {e}"),
        }

        if let Ok(map) = self.shared.backoff.lock() {
            if let Some(retry_at) = map.values().min() {
                wait = wait.min((*retry_at - now).to_std().unwrap_or_default());
            }
        }
        wait
    }

    /// Dispatch loop. Returns after `shutdown` once in-flight work has drained.
    pub async fn run(&self) {
        tracing::info!(
            "⏰ Timer engine started (poll every {}s)",
            self.shared.config.poll_interval().as_secs()
        );
        match self.shared.db.due_timers(Utc::now()) {
            Ok(due) if !due.is_empty() => {
                tracing::info!("♻️ Recovering {} past-due timer(s)", due.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Failed to read past-due timers: {e}"),
        }

        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.dispatch_due().await {
                tracing::error!("❌ Timer dispatch failed: {e}");
            }
            let wait = self.next_wait();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shared.signal.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.drain().await;
        tracing::info!("🛑 Timer engine stopped");
    }

    /// Run the loop as a background tokio task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    /// Ask the loop to stop. In-flight dispatches still complete.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every in-flight dispatch to finish.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        let mut drained = 0;
        while tasks.join_next().await.is_some() {
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!("🧹 Drained {drained} timer dispatch(es)");
        }
    }
}
