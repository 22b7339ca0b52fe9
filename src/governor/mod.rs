//! Edge Resource Governor: samples process/host resource
//! usage, adapts worker/batch/buffer setpoints under sustained pressure,
//! and reacts to panic-level spikes with an emergency mode. Background
//! loop shape (ticker + shutdown notify) follows the same
//! tokio `interval` + last-tick-map pattern used for driver polling;
//! `ResourceSampler` is introduced as a trait (not present elsewhere in
//! this crate) purely so the control loops are unit-testable without
//! real OS metrics, with `SysinfoSampler` as the production default.

mod sampler;

pub use sampler::{ResourceSample, ResourceSampler, SysinfoSampler};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const HISTORY_CAP: usize = 100;

/// Governor tuning surface.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f32,
    pub max_network_mbps: f64,
    pub max_workers: u32,
    pub max_connections: u32,
    pub monitoring_interval: Duration,
    pub threshold_check_interval: Duration,
    pub memory_panic_threshold: f32,
    pub cpu_panic_threshold: f32,
    pub network_panic_threshold: f32,
    pub worker_floor: u32,
    pub default_batch_size: usize,
    pub default_buffer_size: usize,
    pub default_connector_parallelism: u32,
    pub low_power_cpu_target: f32,
    pub low_power_memory_target: f32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            max_memory_mb: 512,
            max_cpu_percent: 80.0,
            max_network_mbps: 10.0,
            max_workers: 8,
            max_connections: 256,
            monitoring_interval: Duration::from_secs(5),
            threshold_check_interval: Duration::from_secs(15),
            memory_panic_threshold: 0.9,
            cpu_panic_threshold: 0.9,
            network_panic_threshold: 0.9,
            worker_floor: 1,
            default_batch_size: 50,
            default_buffer_size: 10_000,
            default_connector_parallelism: 4,
            low_power_cpu_target: 0.25,
            low_power_memory_target: 0.5,
        }
    }
}

/// Current optimal knobs the governor publishes ("Setpoint
/// publication"). `connector_parallelism` and `compression_level` are
/// enrichments beyond the three named values, feeding the same adaptive
/// decisions without requiring a separate channel.
#[derive(Debug, Clone, Copy)]
pub struct Setpoints {
    pub batch_size: usize,
    pub worker_count: u32,
    pub buffer_size: usize,
    pub connector_parallelism: u32,
    pub compression_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Normal,
    Emergency,
}

struct Histories {
    memory_bytes: VecDeque<u64>,
    cpu_percent: VecDeque<f32>,
    network_bps: VecDeque<u64>,
}

impl Histories {
    fn new() -> Self {
        Histories {
            memory_bytes: VecDeque::with_capacity(HISTORY_CAP),
            cpu_percent: VecDeque::with_capacity(HISTORY_CAP),
            network_bps: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    fn push(&mut self, sample: &ResourceSample) {
        push_bounded(&mut self.memory_bytes, sample.memory_used_bytes);
        push_bounded(&mut self.cpu_percent, sample.cpu_percent);
        push_bounded(&mut self.network_bps, sample.network_bps);
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() >= HISTORY_CAP {
        history.pop_front();
    }
    history.push_back(value);
}

/// Samples resource usage, adapts setpoints under sustained pressure, and
/// reacts to panic-level spikes.
pub struct ResourceGovernor {
    config: RwLock<GovernorConfig>,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    histories: Mutex<Histories>,
    latest: Mutex<Option<ResourceSample>>,
    worker_count: AtomicU32,
    batch_size: AtomicUsize,
    buffer_size: AtomicUsize,
    connector_parallelism: AtomicU32,
    compression_level: AtomicU32,
    emergency: AtomicBool,
    normal_streak: AtomicU32,
    low_power: AtomicBool,
    throttling_connections: AtomicBool,
    memory_pass_count: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, sampler: Box<dyn ResourceSampler>) -> Arc<Self> {
        let worker_count = config.max_workers;
        let batch_size = config.default_batch_size;
        let buffer_size = config.default_buffer_size;
        let connector_parallelism = config.default_connector_parallelism;
        Arc::new(ResourceGovernor {
            sampler: Mutex::new(sampler),
            histories: Mutex::new(Histories::new()),
            latest: Mutex::new(None),
            worker_count: AtomicU32::new(worker_count),
            batch_size: AtomicUsize::new(batch_size),
            buffer_size: AtomicUsize::new(buffer_size),
            connector_parallelism: AtomicU32::new(connector_parallelism),
            compression_level: AtomicU32::new(1),
            emergency: AtomicBool::new(false),
            normal_streak: AtomicU32::new(0),
            low_power: AtomicBool::new(false),
            throttling_connections: AtomicBool::new(false),
            memory_pass_count: AtomicU64::new(0),
            config: RwLock::new(config),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let monitor_task = tokio::spawn(async move { monitor.monitoring_loop().await });
        let adaptive = self.clone();
        let adaptive_task = tokio::spawn(async move { adaptive.adaptive_loop().await });
        let emergency = self.clone();
        let emergency_task = tokio::spawn(async move { emergency.emergency_loop().await });
        let mut tasks = self.tasks.lock();
        tasks.push(monitor_task);
        tasks.push(adaptive_task);
        tasks.push(emergency_task);
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn monitoring_loop(self: Arc<Self>) {
        let interval = self.config.read().monitoring_interval;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => self.sample_once(),
            }
        }
    }

    fn sample_once(&self) {
        let workers = self.worker_count.load(Ordering::Relaxed);
        let sample = self.sampler.lock().sample(workers);
        self.histories.lock().push(&sample);
        *self.latest.lock() = Some(sample);
    }

    async fn adaptive_loop(self: Arc<Self>) {
        let interval = self.config.read().threshold_check_interval;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => self.check_adaptive_thresholds(),
            }
        }
    }

    fn check_adaptive_thresholds(&self) {
        let Some(sample) = *self.latest.lock() else { return };
        let config = self.config.read().clone();
        let memory_cap = config.max_memory_mb * 1024 * 1024;
        let memory_ratio = sample.memory_used_bytes as f64 / memory_cap as f64;
        let cpu_ratio = sample.cpu_percent as f64 / config.max_cpu_percent as f64;
        let network_ratio = (sample.network_bps as f64 / 1_000_000.0) / config.max_network_mbps;

        if memory_ratio > 0.7 {
            self.compact_buffers();
            info!(ratio = memory_ratio, "memory above 70% of cap, compacted buffers");
        }
        if cpu_ratio > 0.7 {
            self.step_down_workers(&config);
            info!(ratio = cpu_ratio, "cpu above 70% of cap, reduced worker count");
        }
        if network_ratio > 0.7 {
            self.compression_level.fetch_add(1, Ordering::Relaxed);
            self.connector_parallelism
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(1).max(1)))
                .ok();
            info!(ratio = network_ratio, "network above 70% of cap, raised compression and shrank parallelism");
        }
    }

    async fn emergency_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => self.check_emergency_thresholds(),
            }
        }
    }

    fn check_emergency_thresholds(&self) {
        let Some(sample) = *self.latest.lock() else { return };
        let config = self.config.read().clone();
        let memory_cap = config.max_memory_mb * 1024 * 1024;
        let memory_ratio = sample.memory_used_bytes as f64 / memory_cap as f64;
        let cpu_ratio = (sample.cpu_percent / config.max_cpu_percent) as f64;
        let network_ratio = (sample.network_bps as f64 / 1_000_000.0) / config.max_network_mbps;

        let mut panicked = false;

        if memory_ratio > config.memory_panic_threshold as f64 {
            panicked = true;
            self.compact_buffers();
            self.compact_buffers(); // emergency mode compacts twice to shed memory faster
            self.memory_pass_count.fetch_add(2, Ordering::Relaxed);
            self.enter_emergency();
            warn!(ratio = memory_ratio, "memory panic threshold exceeded");
        }
        if cpu_ratio > config.cpu_panic_threshold as f64 {
            panicked = true;
            self.worker_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some(w.saturating_sub(1).max(1))).ok();
            warn!(ratio = cpu_ratio, "cpu panic threshold exceeded");
        }
        if network_ratio > config.network_panic_threshold as f64 {
            panicked = true;
            self.throttling_connections.store(true, Ordering::Relaxed);
            self.compression_level.store(9, Ordering::Relaxed);
            warn!(ratio = network_ratio, "network panic threshold exceeded");
        } else {
            self.throttling_connections.store(false, Ordering::Relaxed);
        }

        if panicked {
            self.normal_streak.store(0, Ordering::Relaxed);
        } else if self.emergency.load(Ordering::Relaxed) {
            let streak = self.normal_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= 2 {
                self.exit_emergency();
            }
        }
    }

    fn compact_buffers(&self) {
        let floor = self.config.read().default_buffer_size / 4;
        self.buffer_size.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| Some((b / 2).max(floor.max(1)))).ok();
    }

    fn step_down_workers(&self, config: &GovernorConfig) {
        let floor = config.worker_floor.max(1);
        self.worker_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| Some(w.saturating_sub(1).max(floor)))
            .ok();
    }

    fn enter_emergency(&self) {
        if !self.emergency.swap(true, Ordering::Relaxed) {
            let half_batch = (self.batch_size.load(Ordering::Relaxed) / 2).max(1);
            self.batch_size.store(half_batch, Ordering::Relaxed);
            let half_buffer = (self.buffer_size.load(Ordering::Relaxed) / 2).max(1);
            self.buffer_size.store(half_buffer, Ordering::Relaxed);
            let half_parallelism = (self.connector_parallelism.load(Ordering::Relaxed) / 2).max(1);
            self.connector_parallelism.store(half_parallelism, Ordering::Relaxed);
            warn!("entering emergency mode");
        }
    }

    fn exit_emergency(&self) {
        if self.emergency.swap(false, Ordering::Relaxed) {
            let config = self.config.read();
            self.batch_size.store(config.default_batch_size, Ordering::Relaxed);
            self.buffer_size.store(config.default_buffer_size, Ordering::Relaxed);
            self.connector_parallelism.store(config.default_connector_parallelism, Ordering::Relaxed);
            self.normal_streak.store(0, Ordering::Relaxed);
            info!("exiting emergency mode after two consecutive normal samples");
        }
    }

    pub fn mode(&self) -> OperatingMode {
        if self.emergency.load(Ordering::Relaxed) {
            OperatingMode::Emergency
        } else {
            OperatingMode::Normal
        }
    }

    pub fn is_low_power(&self) -> bool {
        self.low_power.load(Ordering::Relaxed)
    }

    pub fn is_throttling_connections(&self) -> bool {
        self.throttling_connections.load(Ordering::Relaxed)
    }

    /// Enters low-power mode. Operator-driven, not automatic.
    pub fn enter_low_power(&self, cores: u32) {
        if self.low_power.swap(true, Ordering::Relaxed) {
            return;
        }
        let config = self.config.read();
        let target_workers = ((cores as f32 * config.low_power_cpu_target).round() as u32).max(1);
        self.worker_count.store(target_workers, Ordering::Relaxed);
        let target_memory = (config.max_memory_mb as f32 * config.low_power_memory_target) as u64;
        let target_buffer = ((target_memory * 1024) as usize).min(config.default_buffer_size);
        self.buffer_size.store(target_buffer.max(1), Ordering::Relaxed);
        info!(workers = target_workers, "entered low-power mode");
    }

    pub fn exit_low_power(&self) {
        if !self.low_power.swap(false, Ordering::Relaxed) {
            return;
        }
        let config = self.config.read();
        self.worker_count.store(config.max_workers, Ordering::Relaxed);
        self.buffer_size.store(config.default_buffer_size, Ordering::Relaxed);
        info!("exited low-power mode, restored configured caps");
    }

    pub fn setpoints(&self) -> Setpoints {
        Setpoints {
            batch_size: self.batch_size.load(Ordering::Relaxed),
            worker_count: self.worker_count.load(Ordering::Relaxed),
            buffer_size: self.buffer_size.load(Ordering::Relaxed),
            connector_parallelism: self.connector_parallelism.load(Ordering::Relaxed),
            compression_level: self.compression_level.load(Ordering::Relaxed),
        }
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        *self.latest.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct FixedSampler {
        memory_used_bytes: Arc<StdAtomicU64>,
        cpu_percent: Arc<Mutex<f32>>,
        network_bps: Arc<StdAtomicU64>,
    }

    impl ResourceSampler for FixedSampler {
        fn sample(&mut self, worker_count: u32) -> ResourceSample {
            ResourceSample {
                memory_used_bytes: self.memory_used_bytes.load(Ordering::Relaxed),
                cpu_percent: *self.cpu_percent.lock(),
                network_bps: self.network_bps.load(Ordering::Relaxed),
                worker_count,
            }
        }
    }

    fn governor_with(memory_bytes: u64, cpu: f32, network_bps: u64) -> Arc<ResourceGovernor> {
        let config = GovernorConfig {
            max_memory_mb: 100,
            max_cpu_percent: 100.0,
            max_network_mbps: 1.0,
            memory_panic_threshold: 0.9,
            cpu_panic_threshold: 0.9,
            network_panic_threshold: 0.9,
            ..Default::default()
        };
        let sampler = FixedSampler {
            memory_used_bytes: Arc::new(StdAtomicU64::new(memory_bytes)),
            cpu_percent: Arc::new(Mutex::new(cpu)),
            network_bps: Arc::new(StdAtomicU64::new(network_bps)),
        };
        ResourceGovernor::new(config, Box::new(sampler))
    }

    #[test]
    fn adaptive_threshold_reduces_workers_under_cpu_pressure() {
        let governor = governor_with(10_000_000, 95.0, 1_000);
        governor.sample_once();
        let before = governor.setpoints().worker_count;
        governor.check_adaptive_thresholds();
        let after = governor.setpoints().worker_count;
        assert!(after < before);
    }

    #[test]
    fn emergency_mode_enters_on_panic_and_exits_after_two_normal_samples() {
        let governor = governor_with(99_000_000, 10.0, 1_000);
        let parallelism_before = governor.setpoints().connector_parallelism;
        governor.sample_once();
        governor.check_emergency_thresholds();
        assert_eq!(governor.mode(), OperatingMode::Emergency);
        assert_eq!(governor.setpoints().connector_parallelism, (parallelism_before / 2).max(1));

        *governor.sampler.lock() = Box::new(FixedSampler {
            memory_used_bytes: Arc::new(StdAtomicU64::new(1_000)),
            cpu_percent: Arc::new(Mutex::new(5.0)),
            network_bps: Arc::new(StdAtomicU64::new(10)),
        });
        governor.sample_once();
        governor.check_emergency_thresholds();
        assert_eq!(governor.mode(), OperatingMode::Emergency); // first normal sample: streak 1

        governor.sample_once();
        governor.check_emergency_thresholds();
        assert_eq!(governor.mode(), OperatingMode::Normal); // second normal sample: exits
        assert_eq!(governor.setpoints().connector_parallelism, parallelism_before);
    }

    #[test]
    fn low_power_mode_clamps_workers_and_restores_on_exit() {
        let governor = governor_with(1_000, 1.0, 1);
        let before = governor.setpoints().worker_count;
        governor.enter_low_power(8);
        assert!(governor.setpoints().worker_count < before);
        assert!(governor.is_low_power());
        governor.exit_low_power();
        assert_eq!(governor.setpoints().worker_count, before);
        assert!(!governor.is_low_power());
    }
}
