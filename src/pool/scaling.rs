//! Auto-scaling policy and load sampling.

use std::time::Duration;

use parking_lot::Mutex;

/// Shortest auto-scaling cadence a pool accepts.
pub const MIN_ADJUSTMENT_INTERVAL: Duration = Duration::from_millis(100);

/// Pool bounds and auto-scaling knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Scale down above this CPU percentage.
    pub cpu_threshold_high: f32,
    /// Consider scaling up below this CPU percentage.
    pub cpu_threshold_low: f32,
    /// Cadence of the auto-scaling loop.
    pub adjustment_interval: Duration,
    /// Number of throughput samples kept.
    pub throughput_window: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 5,
            max_workers: default_max_workers(),
            cpu_threshold_high: 80.0,
            cpu_threshold_low: 30.0,
            adjustment_interval: Duration::from_secs(5),
            throughput_window: 5,
        }
    }
}

impl ScalingConfig {
    pub fn with_bounds(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Self::default()
        }
    }

    /// Clamp into a usable shape: at least one worker, `min <= max`, and a
    /// non-zero adjustment cadence.
    pub fn normalized(mut self) -> Self {
        self.min_workers = self.min_workers.max(1);
        self.max_workers = self.max_workers.max(self.min_workers);
        self.throughput_window = self.throughput_window.max(2);
        self.adjustment_interval = self.adjustment_interval.max(MIN_ADJUSTMENT_INTERVAL);
        self
    }
}

/// Four workers per logical CPU: stage work is I/O bound.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        * 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Add,
    Remove,
    Hold,
}

/// Threshold policy with throughput hysteresis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub cpu_threshold_high: f32,
    pub cpu_threshold_low: f32,
}

impl From<&ScalingConfig> for ScalingPolicy {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            cpu_threshold_high: config.cpu_threshold_high,
            cpu_threshold_low: config.cpu_threshold_low,
        }
    }
}

impl ScalingPolicy {
    /// Decide from one CPU sample and the throughput history (oldest first).
    pub fn decide(&self, cpu_percent: f32, throughput_history: &[f64]) -> ScalingDecision {
        if cpu_percent > self.cpu_threshold_high {
            ScalingDecision::Remove
        } else if cpu_percent < self.cpu_threshold_low && throughput_not_falling(throughput_history)
        {
            ScalingDecision::Add
        } else {
            ScalingDecision::Hold
        }
    }
}

fn throughput_not_falling(history: &[f64]) -> bool {
    match history {
        [.., prev, last] => last >= prev,
        _ => true,
    }
}

/// Source of the CPU utilisation sample fed into the policy.
pub trait LoadSampler: Send + Sync {
    /// Global CPU usage in percent (0-100).
    fn cpu_percent(&self) -> f32;
}

/// Samples global CPU usage through `sysinfo`.
///
/// Usage is computed between consecutive refreshes, so the first sample
/// after construction reads as idle.
pub struct SystemCpuSampler {
    system: Mutex<sysinfo::System>,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemCpuSampler {
    fn cpu_percent(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.global_cpu_info().cpu_usage()
    }
}

/// Fixed reading, for tests and for pools that must not scale.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f32);

impl LoadSampler for FixedLoad {
    fn cpu_percent(&self) -> f32 {
        self.0
    }
}
