//! 主机状态采集

use sysinfo::{Disks, System};

use common::protocol::status::NodeStatus;

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// 主机状态采集器
///
/// CPU 使用率基于两次刷新之间的差值，首次采集可能为 0。
pub struct HostMonitor {
    sys: System,
}

impl HostMonitor {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self { sys }
    }

    /// 采集 CPU、内存、磁盘使用率（百分比）与开机时长（秒）
    pub fn collect(&mut self) -> NodeStatus {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpus = self.sys.cpus();
        let cpu = if cpus.is_empty() {
            0.0
        } else {
            let total: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
            (total / cpus.len() as f32) as f64
        };

        let mem = percent(self.sys.used_memory(), self.sys.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
        let disk = percent(total.saturating_sub(available), total);

        NodeStatus {
            cpu,
            mem,
            disk,
            uptime: System::uptime(),
        }
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}
