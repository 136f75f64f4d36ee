// Adaptive worker-pool size from sampled CPU load

use std::sync::Mutex;

use sysinfo::System;

use crate::constants::{LOAD_HIGH_WATER, LOAD_LOW_WATER};

/// Source of the current system CPU load as a fraction in `0.0..=1.0`.
/// None means the sample could not be taken.
pub trait LoadSampler: Send + Sync {
    fn cpu_load(&self) -> Option<f32>;
}

/// Global CPU usage via sysinfo. Usage is measured between two refreshes,
/// so the first reading after construction is not meaningful.
pub struct SystemLoadSampler {
    system: Mutex<System>,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system: Mutex::new(system) }
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemLoadSampler {
    fn cpu_load(&self) -> Option<f32> {
        let mut system = self.system.lock().ok()?;
        system.refresh_cpu_usage();
        let usage = system.global_cpu_usage() / 100.0;
        usage.is_finite().then_some(usage.clamp(0.0, 1.0))
    }
}

/// Number of jobs to keep in flight for a given load.
///
/// At or below the low-water mark the pool runs at `max`; at or above the
/// high-water mark it drops to `min`; in between it scales linearly. A
/// failed sample yields `min`, and the result is never below 1.
pub fn pool_size(load: Option<f32>, min: usize, max: usize) -> usize {
    let min = min.max(1);
    let max = max.max(min);
    let load = match load {
        Some(l) if l.is_finite() => l,
        _ => return min,
    };

    if load <= LOAD_LOW_WATER {
        max
    } else if load >= LOAD_HIGH_WATER {
        min
    } else {
        let headroom = (LOAD_HIGH_WATER - load) / (LOAD_HIGH_WATER - LOAD_LOW_WATER);
        min + ((max - min) as f32 * headroom).round() as usize
    }
}
