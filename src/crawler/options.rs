use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::request::{DEFAULT_TIMEOUT_MS, MIN_TIMEOUT_MS};
use crate::downloader::names;
use crate::error::{Result, SpiderError};
use crate::scheduler::SchedulerKind;

/// Highest accepted dispatch speed, requests per second
pub const MAX_SPEED: f64 = 500.0;

/// Options of one crawl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiderOptions {
    /// Maximum follow-link depth, 0 for unlimited
    pub depth: u32,

    /// Retries allowed before a request counts as failed
    pub retried_times: u32,

    /// Seconds to wait on an empty or saturated queue before exiting
    pub empty_sleep_time: u64,

    /// Requests dispatched per second
    pub speed: f64,

    /// Requests dequeued per dispatch tick
    pub batch: usize,

    /// Ceiling on requests in flight
    pub requested_queue_count: usize,

    /// Request timeout in milliseconds
    pub default_timeout: u64,

    pub user_agent: Option<String>,

    /// Drop follow-links pointing at another host
    pub remove_outbound_links: bool,

    /// Sink for extracted data ("console", "json_file")
    pub storage_type: String,

    pub scheduler: SchedulerKind,

    /// Breadth-first schedulers dequeue deepest requests first
    pub drain_in_progress: bool,

    /// Downloader used by requests that name none
    pub default_downloader: String,
}

impl Default for SpiderOptions {
    fn default() -> Self {
        Self {
            depth: 0,
            retried_times: 3,
            empty_sleep_time: 60,
            speed: 1.0,
            batch: 4,
            requested_queue_count: 1000,
            default_timeout: DEFAULT_TIMEOUT_MS,
            user_agent: None,
            remove_outbound_links: false,
            storage_type: "console".to_string(),
            scheduler: SchedulerKind::default(),
            drain_in_progress: false,
            default_downloader: names::HTTP_CLIENT.to_string(),
        }
    }
}

impl SpiderOptions {
    /// Reject settings a crawl cannot start with
    pub fn validate(&self) -> Result<()> {
        validate_speed(self.speed)?;

        if self.default_timeout < MIN_TIMEOUT_MS {
            return Err(SpiderError::Config(format!(
                "default timeout {}ms is below the minimum of {}ms",
                self.default_timeout, MIN_TIMEOUT_MS
            )));
        }

        if self.batch == 0 {
            return Err(SpiderError::Config("batch must be at least 1".to_string()));
        }

        if self.default_downloader.trim().is_empty() {
            return Err(SpiderError::Config("default downloader must be named".to_string()));
        }

        Ok(())
    }
}

fn validate_speed(speed: f64) -> Result<()> {
    if !(speed > 0.0 && speed <= MAX_SPEED) {
        return Err(SpiderError::Config(format!(
            "speed {} is outside (0, {}]",
            speed, MAX_SPEED
        )));
    }
    Ok(())
}

/// Options that may change while a crawl runs. The dispatch loop re-reads
/// them every tick.
#[derive(Debug)]
pub struct RuntimeOptions {
    speed: RwLock<f64>,
    batch: AtomicUsize,
    drain_in_progress: Arc<AtomicBool>,
}

impl RuntimeOptions {
    pub fn new(options: &SpiderOptions) -> Self {
        Self {
            speed: RwLock::new(options.speed),
            batch: AtomicUsize::new(options.batch),
            drain_in_progress: Arc::new(AtomicBool::new(options.drain_in_progress)),
        }
    }

    pub fn speed(&self) -> f64 {
        *self.speed.read()
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        validate_speed(speed)?;
        *self.speed.write() = speed;
        Ok(())
    }

    pub fn batch(&self) -> usize {
        self.batch.load(Ordering::Relaxed)
    }

    pub fn set_batch(&self, batch: usize) {
        self.batch.store(batch.max(1), Ordering::Relaxed);
    }

    pub fn drain_in_progress(&self) -> bool {
        self.drain_in_progress.load(Ordering::Relaxed)
    }

    pub fn set_drain_in_progress(&self, drain: bool) {
        self.drain_in_progress.store(drain, Ordering::Relaxed);
    }

    /// Flag shared with breadth-first schedulers
    pub fn drain_flag(&self) -> Arc<AtomicBool> {
        self.drain_in_progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SpiderOptions::default().validate().is_ok());
    }

    #[test]
    fn test_speed_bounds() {
        let mut options = SpiderOptions::default();
        options.speed = 500.0;
        assert!(options.validate().is_ok());

        options.speed = 501.0;
        assert!(matches!(options.validate(), Err(SpiderError::Config(_))));

        options.speed = 0.0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_timeout_floor() {
        let options = SpiderOptions {
            default_timeout: 1999,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(SpiderError::Config(_))));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let options: SpiderOptions = serde_yaml::from_str("depth: 2\nspeed: 10\n").unwrap();
        assert_eq!(options.depth, 2);
        assert_eq!(options.speed, 10.0);
        assert_eq!(options.retried_times, 3);
        assert_eq!(options.scheduler, SchedulerKind::DistinctBfs);
    }

    #[test]
    fn test_runtime_updates() {
        let runtime = RuntimeOptions::new(&SpiderOptions::default());
        runtime.set_speed(20.0).unwrap();
        assert_eq!(runtime.speed(), 20.0);
        assert!(runtime.set_speed(600.0).is_err());
        assert_eq!(runtime.speed(), 20.0);

        runtime.set_batch(0);
        assert_eq!(runtime.batch(), 1);

        let flag = runtime.drain_flag();
        runtime.set_drain_in_progress(true);
        assert!(flag.load(Ordering::Relaxed));
    }
}
