//! Facts about the machine, recorded into the `system` knowledge domain.
//!
//! A [`SystemSnapshot`] is read through sysinfo and turned into short
//! sentences ("Total memory is 16.0 GB") that are embedded like any other
//! fact. Each refresh replaces the previously recorded system facts, so the
//! domain never holds two readings of the same gauge.

use std::time::Duration;

use serde::Serialize;
use sysinfo::{Disks, System};

use crate::{
    error::Result,
    knowledge::{KnowledgeTree, TreeSummary},
    records::SourceKind,
};

/// Domain the facts are recorded in.
pub const SYSTEM_DOMAIN: &str = "system";

/// Volumes smaller than this are pseudo or boot partitions and not reported.
const MIN_DISK_BYTES: u64 = 100 * 1024 * 1024;

/// Processes reported, by resident memory.
const TOP_PROCESSES: usize = 5;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;
const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub name: String,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Point-in-time reading of the machine's hardware and load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub os: Option<String>,
    pub host_name: Option<String>,
    pub cpu_brand: String,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
    pub cpu_frequency_mhz: u64,
    pub cpu_usage_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub disks: Vec<DiskUsage>,
    pub uptime_secs: u64,
    /// Heaviest processes by resident memory, largest first.
    pub top_processes: Vec<ProcessUsage>,
}

impl SystemSnapshot {
    /// Read the current state of the machine. CPU usage needs two samples,
    /// so this blocks for sysinfo's minimum update interval.
    pub fn capture() -> Self {
        let mut sys = System::new_all();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(200)));
        sys.refresh_all();

        let cpus = sys.cpus();
        let mut processes: Vec<ProcessUsage> = sys
            .processes()
            .values()
            .map(|p| ProcessUsage {
                name: p.name().to_string_lossy().into_owned(),
                memory_bytes: p.memory(),
                cpu_percent: p.cpu_usage(),
            })
            .collect();
        processes.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes).then_with(|| a.name.cmp(&b.name)));
        processes.truncate(TOP_PROCESSES);

        let disks = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|d| DiskUsage {
                mount_point: d.mount_point().to_string_lossy().into_owned(),
                total_bytes: d.total_space(),
                available_bytes: d.available_space(),
            })
            .collect();

        let snapshot = Self {
            os: System::long_os_version(),
            host_name: System::host_name(),
            cpu_brand: cpus
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            physical_cores: System::physical_core_count(),
            logical_cores: cpus.len(),
            cpu_frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
            cpu_usage_percent: sys.global_cpu_usage(),
            memory_total_bytes: sys.total_memory(),
            memory_used_bytes: sys.used_memory(),
            memory_available_bytes: sys.available_memory(),
            swap_total_bytes: sys.total_swap(),
            swap_used_bytes: sys.used_swap(),
            disks,
            uptime_secs: System::uptime(),
            top_processes: processes,
        };
        tracing::debug!(
            cpus = snapshot.logical_cores,
            disks = snapshot.disks.len(),
            "captured system snapshot"
        );
        snapshot
    }

    /// One sentence per reading. Unknown readings are left out.
    pub fn facts(&self) -> Vec<String> {
        let mut facts = Vec::new();

        if let Some(os) = &self.os {
            facts.push(format!("The operating system is {os}"));
        }
        if let Some(host) = &self.host_name {
            facts.push(format!("The computer's host name is {host}"));
        }

        if !self.cpu_brand.is_empty() {
            facts.push(format!("The CPU is {}", self.cpu_brand));
        }
        match self.physical_cores {
            Some(physical) => facts.push(format!(
                "The CPU has {physical} physical cores and {} logical cores",
                self.logical_cores
            )),
            None if self.logical_cores > 0 => {
                facts.push(format!("The CPU has {} logical cores", self.logical_cores))
            }
            None => {}
        }
        if self.cpu_frequency_mhz > 0 {
            facts.push(format!("The CPU runs at {} MHz", self.cpu_frequency_mhz));
        }
        facts.push(format!("CPU usage is {:.0}%", self.cpu_usage_percent));

        if self.memory_total_bytes > 0 {
            let used_pct = self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0;
            facts.push(format!("Total memory is {:.1} GB", self.memory_total_bytes as f64 / GB));
            facts.push(format!(
                "Memory in use is {:.1} GB ({used_pct:.0}%)",
                self.memory_used_bytes as f64 / GB
            ));
            facts.push(format!(
                "Available memory is {:.1} GB",
                self.memory_available_bytes as f64 / GB
            ));
        }
        if self.swap_total_bytes > 0 {
            facts.push(format!(
                "Swap in use is {:.1} GB of {:.1} GB",
                self.swap_used_bytes as f64 / GB,
                self.swap_total_bytes as f64 / GB
            ));
        }

        for disk in self.disks.iter().filter(|d| d.total_bytes >= MIN_DISK_BYTES) {
            let used_pct =
                (disk.total_bytes - disk.available_bytes.min(disk.total_bytes)) as f64
                    / disk.total_bytes as f64
                    * 100.0;
            facts.push(format!(
                "Disk {} has {:.1} GB free of {:.1} GB ({used_pct:.0}% used)",
                disk.mount_point,
                disk.available_bytes as f64 / GB,
                disk.total_bytes as f64 / GB
            ));
        }

        if self.uptime_secs > 0 {
            facts.push(format!(
                "The system has been up for {:.1} hours",
                self.uptime_secs as f64 / 3600.0
            ));
        }

        for process in &self.top_processes {
            facts.push(format!(
                "Process {} uses {:.0} MB of memory and {:.0}% CPU",
                process.name,
                process.memory_bytes as f64 / MB,
                process.cpu_percent
            ));
        }
        facts
    }
}

/// Replace the system facts in [`SYSTEM_DOMAIN`] with those of `snapshot`.
/// Facts recorded there from other sources are kept.
pub fn record_system_facts(
    tree: &KnowledgeTree<'_>,
    snapshot: &SystemSnapshot,
) -> Result<TreeSummary> {
    let facts = snapshot.facts();
    let summary = tree.replace_source_items(SYSTEM_DOMAIN, SourceKind::System, &facts)?;
    tracing::info!(facts = facts.len(), items = summary.items, "recorded system facts");
    Ok(summary)
}
