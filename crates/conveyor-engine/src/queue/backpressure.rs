//! Backpressure management for the queue worker pool
//!
//! Two mechanisms:
//!
//! - worker-side hysteresis watermarks over the in-flight load counter, so
//!   a loaded worker stops claiming before it saturates and resumes once
//!   load drops meaningfully
//! - submit-side capacity checks against the durable queue depth
//!   (`backpressure_threshold` fraction of `max_queue_size`), enforced by
//!   [`SmartQueue`](super::smart::SmartQueue)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Worker-side backpressure configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop claiming when load exceeds this fraction of max concurrency.
    pub high_watermark: f64,

    /// Resume claiming when load drops below this fraction.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    /// Derive worker watermarks from the engine-level threshold fraction.
    pub fn from_threshold(threshold: f64) -> Self {
        let high = threshold.clamp(0.1, 1.0);
        Self {
            high_watermark: high,
            low_watermark: (high - 0.2).max(0.05),
        }
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }
}

/// Load tracking with hysteresis. Atomic counters only; no locks are held
/// across await points.
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrency: max_concurrency.max(1),
            accepting: AtomicBool::new(true),
        }
    }

    /// Whether the worker should claim more jobs right now.
    pub fn should_accept(&self) -> bool {
        let accepting = self.accepting.load(Ordering::Relaxed);
        let ratio = self.load_ratio();

        if accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                return true;
            }
            false
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrency as f64
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.current_load.load(Ordering::Relaxed))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn job_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }
}
