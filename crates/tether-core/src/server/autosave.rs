//! Mutation-burst autosave.
//!
//! Successful mutating dispatches are recorded here. Each record pushes back a
//! single inactivity deadline; when that deadline passes the scheduler decides
//! whether to flush:
//!
//! - [`AutosaveMode::Inactivity`]: flush if anything was recorded.
//! - [`AutosaveMode::Burst`]: flush only if at least `mutation_burst_threshold`
//!   records fall inside the trailing `mutation_burst_window`.
//!
//! The history is cleared whenever the deadline fires. Flushes never overlap
//! and never run closer together than `min_save_interval`; a suppressed flush
//! is dropped.

use crate::config::{AutosaveConfig, AutosaveMode};
use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Lifecycle hooks of the engine's storage backend.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Called once before the server accepts connections.
    async fn initialize(&self) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    /// Write the engine's state to durable storage.
    async fn save_to_storage(&self) -> std::result::Result<(), EngineError> {
        Ok(())
    }
}

/// Persistence for engines that keep nothing on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl Persistence for NoPersistence {}

/// Pure scheduling state, driven with explicit instants.
#[derive(Debug)]
pub(crate) struct AutosaveState {
    mode: AutosaveMode,
    inactivity: Duration,
    window: Duration,
    threshold: usize,
    min_interval: Duration,
    mutations: VecDeque<Instant>,
    deadline: Option<Instant>,
    last_save: Option<Instant>,
    flushing: bool,
}

impl AutosaveState {
    pub(crate) fn new(config: &AutosaveConfig) -> Self {
        Self {
            mode: config.mode,
            inactivity: config.mutation_inactivity,
            window: config.mutation_burst_window,
            threshold: config.mutation_burst_threshold,
            min_interval: config.min_save_interval,
            mutations: VecDeque::new(),
            deadline: None,
            last_save: None,
            flushing: false,
        }
    }

    /// Record a mutation and re-arm the inactivity deadline.
    pub(crate) fn record_mutation_at(&mut self, now: Instant) {
        while let Some(&oldest) = self.mutations.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.mutations.pop_front();
            } else {
                break;
            }
        }
        self.mutations.push_back(now);
        self.deadline = Some(now + self.inactivity);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn pending_mutations(&self) -> usize {
        self.mutations.len()
    }

    /// Fire the inactivity deadline if it has passed. Returns whether a flush
    /// is wanted.
    pub(crate) fn poll_at(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return false,
        }
        self.deadline = None;

        let wanted = match self.mode {
            AutosaveMode::Inactivity => !self.mutations.is_empty(),
            AutosaveMode::Burst => {
                let in_window = self
                    .mutations
                    .iter()
                    .filter(|&&at| now.saturating_duration_since(at) <= self.window)
                    .count();
                debug!(
                    "Autosave: {} mutations in the last {:?} (threshold {})",
                    in_window, self.window, self.threshold
                );
                in_window >= self.threshold
            }
        };
        self.mutations.clear();
        wanted
    }

    /// Claim the flush slot. `force` skips the minimum-interval check.
    pub(crate) fn try_begin_flush_at(&mut self, now: Instant, force: bool) -> bool {
        if self.flushing {
            debug!("Autosave: flush already running, skipping");
            return false;
        }
        if !force {
            if let Some(last) = self.last_save {
                let since = now.saturating_duration_since(last);
                if since < self.min_interval {
                    debug!("Autosave: last save {:?} ago, skipping", since);
                    return false;
                }
            }
        }
        self.flushing = true;
        self.last_save = Some(now);
        true
    }

    pub(crate) fn finish_flush(&mut self) {
        self.flushing = false;
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing
    }
}

/// Per-server autosave scheduler.
pub struct AutosaveScheduler {
    enabled: bool,
    state: Mutex<AutosaveState>,
    persistence: Arc<dyn Persistence>,
    wake: Notify,
    flush_done: Notify,
}

impl AutosaveScheduler {
    pub fn new(config: &AutosaveConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            enabled: config.enabled,
            state: Mutex::new(AutosaveState::new(config)),
            persistence,
            wake: Notify::new(),
            flush_done: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, AutosaveState> {
        // The state has no invariants a panicking holder could break mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Note a successful mutating dispatch.
    pub fn record_mutation(&self) {
        if !self.enabled {
            return;
        }
        self.state().record_mutation_at(Instant::now());
        self.wake.notify_one();
    }

    pub fn pending_mutations(&self) -> usize {
        self.state().pending_mutations()
    }

    pub fn is_flushing(&self) -> bool {
        self.state().is_flushing()
    }

    /// Sleep until each deadline, flushing when it calls for one, until
    /// `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            debug!("Autosave disabled");
            return;
        }

        loop {
            let deadline = self.state().next_deadline();
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let wanted = self.state().poll_at(Instant::now());
                    if wanted {
                        self.clone().spawn_flush();
                    }
                }
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Autosave driver stopped");
    }

    fn spawn_flush(self: Arc<Self>) {
        if !self.state().try_begin_flush_at(Instant::now(), false) {
            return;
        }
        tokio::spawn(async move {
            self.flush_claimed("autosave").await;
        });
    }

    async fn flush_claimed(&self, reason: &str) {
        let started = std::time::Instant::now();
        let result = self.persistence.save_to_storage().await;
        self.state().finish_flush();
        self.flush_done.notify_waiters();

        match result {
            Ok(()) => info!("Saved to storage ({}, {:?})", reason, started.elapsed()),
            Err(e) => error!("Save to storage failed ({}): {}", reason, e),
        }
    }

    /// Wait for any running flush, then save once more ignoring the minimum
    /// interval. Called by the server on shutdown.
    pub async fn final_flush(&self) {
        loop {
            let done = self.flush_done.notified();
            if !self.state().is_flushing() {
                break;
            }
            done.await;
        }

        if self.state().try_begin_flush_at(Instant::now(), true) {
            self.flush_claimed("shutdown").await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn burst_config() -> AutosaveConfig {
        AutosaveConfig::default()
            .with_mode(AutosaveMode::Burst)
            .with_inactivity(Duration::from_secs(10))
            .with_burst(Duration::from_secs(120), 5)
            .with_min_save_interval(Duration::from_secs(5))
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_burst_below_threshold_does_not_flush() {
        let mut state = AutosaveState::new(&burst_config());
        let t0 = Instant::now();
        for i in 0..4 {
            state.record_mutation_at(t0 + secs(2 * i));
        }

        let deadline = state.next_deadline().unwrap();
        assert_eq!(deadline, t0 + secs(6) + secs(10));
        assert!(!state.poll_at(deadline - Duration::from_millis(1)));
        assert!(!state.poll_at(deadline));
        assert_eq!(state.pending_mutations(), 0);
        assert!(state.next_deadline().is_none());
    }

    #[test]
    fn test_burst_at_threshold_flushes_once() {
        let mut state = AutosaveState::new(&burst_config());
        let t0 = Instant::now();
        for i in 0..5 {
            state.record_mutation_at(t0 + secs(2 * i));
        }

        let deadline = state.next_deadline().unwrap();
        assert!(state.poll_at(deadline));
        assert!(!state.poll_at(deadline + secs(1)));
    }

    #[test]
    fn test_history_pruned_to_window() {
        let config = burst_config().with_burst(Duration::from_secs(30), 3);
        let mut state = AutosaveState::new(&config);
        let t0 = Instant::now();
        state.record_mutation_at(t0);
        state.record_mutation_at(t0 + secs(25));
        state.record_mutation_at(t0 + secs(40));
        assert_eq!(state.pending_mutations(), 2);

        // Only two records fall inside the window when the deadline fires.
        assert!(!state.poll_at(t0 + secs(50)));
    }

    #[test]
    fn test_inactivity_mode_flushes_any_mutation() {
        let config = burst_config().with_mode(AutosaveMode::Inactivity);
        let mut state = AutosaveState::new(&config);
        let t0 = Instant::now();
        state.record_mutation_at(t0);
        state.record_mutation_at(t0 + secs(5));

        // The second record pushed the deadline back.
        assert!(!state.poll_at(t0 + secs(12)));
        assert!(state.poll_at(t0 + secs(15)));
    }

    #[test]
    fn test_min_interval_suppresses_second_flush() {
        let mut state = AutosaveState::new(&burst_config());
        let t0 = Instant::now();

        assert!(state.try_begin_flush_at(t0, false));
        state.finish_flush();
        assert!(!state.try_begin_flush_at(t0 + secs(2), false));
        assert!(state.try_begin_flush_at(t0 + secs(5), false));
    }

    #[test]
    fn test_reentrant_flush_refused_even_when_forced() {
        let mut state = AutosaveState::new(&burst_config());
        let t0 = Instant::now();

        assert!(state.try_begin_flush_at(t0, false));
        assert!(!state.try_begin_flush_at(t0 + secs(60), true));
        state.finish_flush();
        assert!(state.try_begin_flush_at(t0 + secs(1), true));
    }

    #[derive(Default)]
    struct CountingPersistence {
        saves: AtomicUsize,
    }

    #[async_trait]
    impl Persistence for CountingPersistence {
        async fn save_to_storage(&self) -> std::result::Result<(), EngineError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingPersistence;

    #[async_trait]
    impl Persistence for FailingPersistence {
        async fn save_to_storage(&self) -> std::result::Result<(), EngineError> {
            Err(EngineError::Other("disk full".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_flushes_after_burst() {
        let persistence = Arc::new(CountingPersistence::default());
        let scheduler = Arc::new(AutosaveScheduler::new(&burst_config(), persistence.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(scheduler.clone().run(stop_rx));

        for _ in 0..5 {
            scheduler.record_mutation();
            tokio::time::sleep(secs(1)).await;
        }
        tokio::time::sleep(secs(15)).await;
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 1);

        // Four more is below threshold.
        for _ in 0..4 {
            scheduler.record_mutation();
        }
        tokio::time::sleep(secs(15)).await;
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_ignores_min_interval() {
        let persistence = Arc::new(CountingPersistence::default());
        let config = burst_config()
            .with_burst(secs(120), 1)
            .with_min_save_interval(secs(3600));
        let scheduler = Arc::new(AutosaveScheduler::new(&config, persistence.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(scheduler.clone().run(stop_rx));

        scheduler.record_mutation();
        tokio::time::sleep(secs(11)).await;
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
        scheduler.final_flush().await;
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_failure_is_contained() {
        let scheduler = AutosaveScheduler::new(&burst_config(), Arc::new(FailingPersistence));
        scheduler.final_flush().await;
        assert!(!scheduler.is_flushing());
    }

    #[tokio::test]
    async fn test_disabled_scheduler_records_nothing() {
        let mut config = burst_config();
        config.enabled = false;
        let scheduler = AutosaveScheduler::new(&config, Arc::new(NoPersistence));
        scheduler.record_mutation();
        assert_eq!(scheduler.pending_mutations(), 0);
    }
}
