//! 作業各階段的耗時與行程記憶體紀錄
//!
//! 階段耗時一律記錄；記憶體與 CPU 只有在 `cli` 建置且啟用監控時才取樣。

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(feature = "cli")]
use sysinfo::{Pid, RefreshKind, System};

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSample {
    pub phase: String,
    /// 距離上一個階段結束的時間
    pub elapsed: Duration,
    pub memory_mb: Option<u64>,
}

#[cfg(feature = "cli")]
struct ProcessSampler {
    system: System,
    pid: Pid,
}

#[cfg(feature = "cli")]
impl ProcessSampler {
    fn new() -> Option<Self> {
        match sysinfo::get_current_pid() {
            Ok(pid) => Some(Self {
                system: System::new_with_specifics(RefreshKind::everything()),
                pid,
            }),
            Err(e) => {
                tracing::warn!("Process monitoring unavailable: {}", e);
                None
            }
        }
    }

    /// (RSS MB, CPU %, 佔總記憶體 %)
    fn sample(&mut self) -> Option<(u64, f32, f32)> {
        self.system.refresh_all();
        let process = self.system.process(self.pid)?;
        let memory_mb = process.memory() / 1024 / 1024;
        let total_mb = self.system.total_memory() / 1024 / 1024;
        let percent = if total_mb > 0 {
            memory_mb as f32 / total_mb as f32 * 100.0
        } else {
            0.0
        };
        Some((memory_mb, process.cpu_usage(), percent))
    }
}

#[derive(Default)]
struct MonitorState {
    last_mark: Option<Instant>,
    phases: Vec<PhaseSample>,
    peak_memory_mb: u64,
}

pub struct SystemMonitor {
    enabled: bool,
    started: Instant,
    state: Mutex<MonitorState>,
    #[cfg(feature = "cli")]
    sampler: Option<Mutex<ProcessSampler>>,
}

impl SystemMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            state: Mutex::new(MonitorState::default()),
            #[cfg(feature = "cli")]
            sampler: if enabled {
                ProcessSampler::new().map(Mutex::new)
            } else {
                None
            },
        }
    }

    #[cfg(feature = "cli")]
    fn sample_process(&self) -> Option<(u64, f32, f32)> {
        self.sampler.as_ref()?.lock().ok()?.sample()
    }

    #[cfg(not(feature = "cli"))]
    fn sample_process(&self) -> Option<(u64, f32, f32)> {
        None
    }

    /// 標記一個階段結束
    pub fn log_stats(&self, phase: &str) {
        let now = Instant::now();
        let process = if self.enabled { self.sample_process() } else { None };

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let elapsed = now.duration_since(state.last_mark.unwrap_or(self.started));
        state.last_mark = Some(now);
        if let Some((memory_mb, _, _)) = process {
            state.peak_memory_mb = state.peak_memory_mb.max(memory_mb);
        }
        state.phases.push(PhaseSample {
            phase: phase.to_string(),
            elapsed,
            memory_mb: process.map(|(m, _, _)| m),
        });

        if !self.enabled {
            return;
        }
        match process {
            Some((memory_mb, cpu, percent)) => tracing::info!(
                "📊 {} took {:.2}s - CPU: {:.1}%, Memory: {}MB ({:.1}%), Peak: {}MB",
                phase,
                elapsed.as_secs_f64(),
                cpu,
                memory_mb,
                percent,
                state.peak_memory_mb
            ),
            None => tracing::info!("📊 {} took {:.2}s", phase, elapsed.as_secs_f64()),
        }
    }

    pub fn phases(&self) -> Vec<PhaseSample> {
        self.state
            .lock()
            .map(|s| s.phases.clone())
            .unwrap_or_default()
    }

    pub fn log_final_stats(&self) {
        if !self.enabled {
            return;
        }
        let Ok(state) = self.state.lock() else {
            return;
        };
        let slowest = state.phases.iter().max_by_key(|p| p.elapsed);
        tracing::info!(
            "📊 Final Stats - Total Time: {:.2}s, Peak Memory: {}MB, Slowest phase: {}",
            self.started.elapsed().as_secs_f64(),
            state.peak_memory_mb,
            slowest.map(|p| p.phase.as_str()).unwrap_or("-")
        );
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
