use std::sync::{Mutex, PoisonError};

use sysinfo::{Disks, System};

use crate::vm::VmManager;

/// Host resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub hypervisor_alive: bool,
    pub active_proxies: usize,
    pub host: HostMetrics,
}

/// Samples host metrics. CPU usage is measured between consecutive samples,
/// so the first one reads zero.
pub struct HostMonitor {
    sys: Mutex<System>,
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMonitor {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> HostMetrics {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let (mut disk_used, mut disk_total) = (0u64, 0u64);
        for disk in Disks::new_with_refreshed_list().list() {
            disk_total += disk.total_space();
            disk_used += disk.total_space().saturating_sub(disk.available_space());
        }

        let load_avg = System::load_average();

        HostMetrics {
            cpu_percent: sys.global_cpu_usage(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            load_avg_1: load_avg.one as f32,
            load_avg_5: load_avg.five as f32,
            load_avg_15: load_avg.fifteen as f32,
        }
    }
}

/// Hypervisor liveness, live display proxies and host usage.
pub async fn check(manager: &VmManager, monitor: &HostMonitor) -> HealthReport {
    HealthReport {
        hypervisor_alive: manager.hypervisor().is_alive().await,
        active_proxies: manager.proxies().active_count().await,
        host: monitor.sample(),
    }
}
