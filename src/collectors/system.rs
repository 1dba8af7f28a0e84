use crate::collectors::{CollectionError, ResourceSource};
use std::path::Path;
use std::time::Duration;
use sysinfo::{CpuExt, CpuRefreshKind, DiskExt, RefreshKind, System, SystemExt};
use tracing::debug;

// sysinfo needs at least this much time between CPU refreshes on Linux.
const MIN_CPU_WINDOW: Duration = Duration::from_millis(200);

pub struct SysinfoSource {
    system: System,
    cpu_window: Duration,
}

impl SysinfoSource {
    pub fn new(cpu_window: Duration) -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(),
        );
        system.refresh_cpu();
        Self { system, cpu_window }
    }
}

impl ResourceSource for SysinfoSource {
    fn cpu_utilization(&mut self) -> Result<f64, CollectionError> {
        if !self.cpu_window.is_zero() {
            self.system.refresh_cpu();
            std::thread::sleep(self.cpu_window.max(MIN_CPU_WINDOW));
        }
        self.system.refresh_cpu();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(CollectionError::Unavailable {
                resource: "cpu",
                reason: "ядра CPU не обнаружены".to_string(),
            });
        }
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        Ok((sum / cpus.len() as f32) as f64)
    }

    fn memory_utilization(&mut self) -> Result<f64, CollectionError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(CollectionError::Unavailable {
                resource: "memory",
                reason: "общий объём памяти равен нулю".to_string(),
            });
        }
        let used = self.system.used_memory();
        Ok((used as f64 / total as f64) * 100.0)
    }

    fn disk_utilization(&mut self, path: &Path) -> Result<f64, CollectionError> {
        self.system.refresh_disks_list();
        self.system.refresh_disks();

        let disk = self
            .system
            .disks()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count())
            .ok_or_else(|| CollectionError::Unavailable {
                resource: "disk",
                reason: format!("не найдена точка монтирования для {}", path.display()),
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Err(CollectionError::Unavailable {
                resource: "disk",
                reason: format!(
                    "нулевой размер файловой системы {}",
                    disk.mount_point().display()
                ),
            });
        }
        let used = total.saturating_sub(disk.available_space());
        debug!(
            mount = %disk.mount_point().display(),
            used_bytes = used,
            total_bytes = total,
            "disk usage"
        );
        Ok((used as f64 / total as f64) * 100.0)
    }
}
