//! Host resource sampling and worker spawn gating.
//!
//! Samples CPU utilisation and free memory via `sysinfo` and combines them
//! with the live worker count and spawn-throttle state to answer "may we
//! spawn another worker right now?". When the answer is no, callers leave
//! the task in the queue and retry on the next tick.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::debug;

use crate::config::DelegateConfig;

/// Point-in-time view of host resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Average CPU utilisation across all cores, 0..100.
    pub cpu_usage_percent: f32,
    pub free_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub cpu_cores: usize,
    pub live_workers: usize,
}

/// Gating thresholds, extracted from the config snapshot.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub memory_reserve: u64,
    pub cpu_cores_reserved: u32,
    pub min_spawn_delay: Duration,
    pub settling_window: Duration,
}

impl From<&DelegateConfig> for MonitorConfig {
    fn from(config: &DelegateConfig) -> Self {
        Self {
            memory_reserve: config.memory_reserve,
            cpu_cores_reserved: config.cpu_cores_reserved,
            min_spawn_delay: Duration::from_millis(config.min_spawn_delay_ms),
            settling_window: Duration::from_millis(config.settling_window_ms),
        }
    }
}

struct MonitorState {
    system: System,
    last_spawn_at: Option<Instant>,
}

/// Resource monitor shared between the worker pool and the autoscaler.
pub struct ResourceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    live_workers: AtomicUsize,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            config,
            state: Mutex::new(MonitorState {
                system,
                last_spawn_at: None,
            }),
            live_workers: AtomicUsize::new(0),
        }
    }

    /// Refresh samples and return a snapshot.
    pub fn get_resources(&self) -> ResourceSnapshot {
        let mut state = self.state.lock().expect("monitor state poisoned");
        state.system.refresh_cpu();
        state.system.refresh_memory();

        let cpus = state.system.cpus();
        let cpu_usage_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let total = state.system.total_memory();
        let used = state.system.used_memory();

        ResourceSnapshot {
            cpu_usage_percent,
            free_memory_bytes: total.saturating_sub(used),
            total_memory_bytes: total,
            cpu_cores: cpus.len().max(1),
            live_workers: self.live_workers.load(Ordering::SeqCst),
        }
    }

    /// Memory and CPU headroom alone, ignoring the spawn throttle.
    pub fn has_available_resources(&self) -> bool {
        let snapshot = self.get_resources();
        self.check_headroom(&snapshot).is_ok()
    }

    /// Full spawn gate: headroom plus throttle and settling window.
    pub fn can_spawn_worker(&self) -> bool {
        let now = Instant::now();
        {
            let state = self.state.lock().expect("monitor state poisoned");
            if let Some(last) = state.last_spawn_at {
                if now.duration_since(last) < self.config.min_spawn_delay {
                    debug!("spawn throttled: within min spawn delay");
                    return false;
                }
            }
        }

        let snapshot = self.get_resources();
        if let Err(reason) = self.check_headroom(&snapshot) {
            debug!(reason, "spawn refused: no headroom");
            return false;
        }

        // Inside the settling window the last worker's load is assumed not
        // yet visible, so count it as one phantom busy core on top of the
        // live set.
        let settling = {
            let state = self.state.lock().expect("monitor state poisoned");
            state
                .last_spawn_at
                .is_some_and(|last| now.duration_since(last) < self.config.settling_window)
        };
        let assumed_busy = snapshot.live_workers + 1 + usize::from(settling);
        let reserved = self.config.cpu_cores_reserved as usize;
        if snapshot.cpu_cores < assumed_busy + reserved {
            debug!(
                cores = snapshot.cpu_cores,
                assumed_busy, reserved, "spawn refused: would starve reserved cores"
            );
            return false;
        }

        true
    }

    /// Record a successful spawn for throttle accounting.
    pub fn record_spawn(&self) {
        let mut state = self.state.lock().expect("monitor state poisoned");
        state.last_spawn_at = Some(Instant::now());
    }

    /// Worker-count gauge, incremented and decremented by the pool.
    pub fn worker_started(&self) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_stopped(&self) {
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_worker_count(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    fn check_headroom(&self, snapshot: &ResourceSnapshot) -> Result<(), &'static str> {
        if snapshot.free_memory_bytes < self.config.memory_reserve {
            return Err("free memory below reserve");
        }
        Ok(())
    }
}
