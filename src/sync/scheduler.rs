//! Background Retry Scheduler
//!
//! Ticks at a fixed interval so operations parked behind a backoff delay are
//! retried without a new local trigger. Uses Tokio tasks for non-blocking
//! background execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 3600;

/// Work run on every scheduler tick
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Returns false once the target is gone; the loop then exits
    async fn tick(&self) -> bool;
}

/// Background scheduler for automatic retries
#[derive(Clone)]
pub struct BackgroundScheduler {
    interval: Duration,
    running: Arc<AtomicBool>,
    last_run: Arc<StdMutex<Option<DateTime<Utc>>>>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl BackgroundScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Arc::new(AtomicBool::new(false)),
            last_run: Arc::new(StdMutex::new(None)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start background scheduler task
    pub fn start(&self, task: Arc<dyn ScheduledTask>) -> Result<(), SchedulerError> {
        let secs = self.interval.as_secs();
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be {}-{} seconds, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, secs
            )));
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let handle = tokio::spawn(Self::scheduler_loop(
            self.interval,
            self.running.clone(),
            self.last_run.clone(),
            task,
        ));

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {:?})", self.interval);
        Ok(())
    }

    /// Stop background scheduler task
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        period: Duration,
        running: Arc<AtomicBool>,
        last_run: Arc<StdMutex<Option<DateTime<Utc>>>>,
        task: Arc<dyn ScheduledTask>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Retry tick");
            let alive = task.tick().await;
            *last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

            if !alive {
                log::info!("Scheduler target dropped, exiting loop");
                running.store(false, Ordering::SeqCst);
                break;
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
