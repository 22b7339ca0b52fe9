//! Resource sampling ("Samples every `monitoring_interval`:
//! heap usage, CPU estimate, network estimate, worker/thread count").
//! `ResourceSampler` is a small trait so the governor's adaptive/
//! emergency loops are unit-testable with a fixed sampler; `SysinfoSampler`
//! is the production implementation over the `sysinfo` crate, a standard
//! choice for this kind of OS-level metrics gathering.

use std::time::Instant;

use sysinfo::{Networks, System};

/// One point-in-time resource reading.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub memory_used_bytes: u64,
    pub cpu_percent: f32,
    pub network_bps: u64,
    pub worker_count: u32,
}

pub trait ResourceSampler: Send + Sync {
    /// `worker_count` is supplied by the governor (its own current
    /// setpoint) rather than measured, since "current worker count" is
    /// process-internal bookkeeping, not an OS-observable quantity.
    fn sample(&mut self, worker_count: u32) -> ResourceSample;
}

/// Samples this process's memory/CPU and the host's aggregate network
/// throughput via `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    networks: Networks,
    pid: sysinfo::Pid,
    last_network_total: u64,
    last_sampled_at: Instant,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let pid = sysinfo::get_current_pid().unwrap_or(sysinfo::Pid::from(0));
        let networks = Networks::new_with_refreshed_list();
        let last_network_total = networks.iter().map(|(_, data)| data.total_received() + data.total_transmitted()).sum();
        SysinfoSampler {
            system,
            networks,
            pid,
            last_network_total,
            last_sampled_at: Instant::now(),
        }
    }

    pub fn core_count(&self) -> u32 {
        self.system.cpus().len().max(1) as u32
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self, worker_count: u32) -> ResourceSample {
        self.system.refresh_processes(sysinfo::ProcessesToUpdate::All);
        self.system.refresh_cpu_usage();
        self.networks.refresh(true);

        let memory_used_bytes = self
            .system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or_else(|| self.system.used_memory());

        let cpu_percent = self
            .system
            .process(self.pid)
            .map(|p| p.cpu_usage())
            .unwrap_or_else(|| self.system.global_cpu_usage());

        let total_bytes: u64 = self.networks.iter().map(|(_, data)| data.total_received() + data.total_transmitted()).sum();
        let elapsed = self.last_sampled_at.elapsed().as_secs_f64().max(0.001);
        let delta = total_bytes.saturating_sub(self.last_network_total);
        let network_bps = (delta as f64 / elapsed) as u64;
        self.last_network_total = total_bytes;
        self.last_sampled_at = Instant::now();

        ResourceSample {
            memory_used_bytes,
            cpu_percent,
            network_bps,
            worker_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_without_panicking_and_reports_a_worker_count() {
        let mut sampler = SysinfoSampler::new();
        let sample = sampler.sample(4);
        assert_eq!(sample.worker_count, 4);
    }
}
