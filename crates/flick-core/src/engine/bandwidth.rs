//! Bandwidth estimation from transfer timing

use std::collections::VecDeque;
use std::time::Duration;

/// Timing of one completed transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferSample {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Throughput in bits per second
    pub fn throughput_bps(&self) -> u64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            ((self.bytes as f64 * 8.0) / self.elapsed.as_secs_f64()) as u64
        } else {
            0
        }
    }
}

/// Exponentially weighted moving average (alpha = 0.2)
#[derive(Debug, Clone, Default)]
pub struct EwmaEstimator {
    estimate: u64,
}

impl EwmaEstimator {
    const ALPHA: f64 = 0.2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: TransferSample) -> u64 {
        let bps = sample.throughput_bps();
        if bps == 0 {
            return self.estimate;
        }
        if self.estimate == 0 {
            self.estimate = bps;
        } else {
            self.estimate =
                (self.estimate as f64 * (1.0 - Self::ALPHA) + bps as f64 * Self::ALPHA) as u64;
        }
        self.estimate
    }

    pub fn estimate(&self) -> u64 {
        self.estimate
    }
}

/// Mean throughput over the most recent samples
#[derive(Debug, Clone)]
pub struct WindowEstimator {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl WindowEstimator {
    pub const DEFAULT_WINDOW: usize = 10;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: TransferSample) -> u64 {
        let bps = sample.throughput_bps();
        if bps > 0 {
            if self.samples.len() >= self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(bps);
        }
        self.estimate()
    }

    pub fn estimate(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for WindowEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
