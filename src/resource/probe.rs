//! Resource snapshot sources.
//!
//! | Probe | Measures |
//! |-------|----------|
//! | [`SystemMemoryProbe`] | System RAM (`/proc/meminfo` on Linux, `sysctl` on macOS) |
//! | [`NvidiaSmiProbe`] | Summed GPU memory reported by `nvidia-smi` |
//! | [`FixedProbe`] | Configured constants |
//!
//! All values are MiB. A probe that cannot measure returns
//! [`VigilError::Probe`]; callers decide how conservative to be.

use super::ResourceSnapshot;
use crate::config::{ProbeKind, ResourceConfig};
use crate::error::{Result, VigilError};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Supplies current usage/total of the tracked resource.
#[async_trait]
pub trait ResourceSnapshotSource: Send + Sync {
    /// Short label for logs (e.g. `"nvidia-smi"`).
    fn name(&self) -> &'static str;

    /// Take a fresh snapshot.
    async fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Build the probe selected in config.
pub fn probe_from_config(config: &ResourceConfig) -> Box<dyn ResourceSnapshotSource> {
    match config.probe {
        ProbeKind::SystemMemory => Box::new(SystemMemoryProbe),
        ProbeKind::NvidiaSmi => Box::new(NvidiaSmiProbe::new(Duration::from_secs(
            config.probe_timeout_secs,
        ))),
        ProbeKind::Fixed => Box::new(FixedProbe::new(config.fixed_used, config.fixed_total)),
    }
}

/// Reports system RAM: `used = total - available`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

#[async_trait]
impl ResourceSnapshotSource for SystemMemoryProbe {
    fn name(&self) -> &'static str {
        "system-memory"
    }

    async fn sample(&self) -> Result<ResourceSnapshot> {
        let (total_bytes, available_bytes) = memory_bytes()
            .ok_or_else(|| VigilError::Probe("system memory is not measurable here".to_owned()))?;
        let total = total_bytes / (1024 * 1024);
        let available = available_bytes / (1024 * 1024);
        Ok(ResourceSnapshot::new(total.saturating_sub(available), total))
    }
}

fn memory_bytes() -> Option<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&content)
    }
    #[cfg(target_os = "macos")]
    {
        let page_size = run_sysctl_u64("hw.pagesize")?;
        let free_pages = run_sysctl_u64("vm.page_free_count")?;
        let total = run_sysctl_u64("hw.memsize")?;
        Some((total, free_pages.saturating_mul(page_size)))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

#[cfg(target_os = "macos")]
fn run_sysctl_u64(name: &str) -> Option<u64> {
    let output = std::process::Command::new("sysctl")
        .arg("-n")
        .arg(name)
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()
}

/// Parse `MemTotal` and `MemAvailable` (bytes) out of `/proc/meminfo`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field_kb = |key: &str| -> Option<u64> {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(key)?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };

    let total = field_kb("MemTotal:")?.saturating_mul(1024);
    let available = field_kb("MemAvailable:")?.saturating_mul(1024);
    Some((total, available))
}

/// Queries `nvidia-smi` and sums memory across all visible GPUs.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    timeout: Duration,
}

impl NvidiaSmiProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ResourceSnapshotSource for NvidiaSmiProbe {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    async fn sample(&self) -> Result<ResourceSnapshot> {
        let mut command = tokio::process::Command::new("nvidia-smi");
        command
            .arg("--query-gpu=memory.used,memory.total")
            .arg("--format=csv,noheader,nounits")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| VigilError::Probe(format!("nvidia-smi timed out after {:?}", self.timeout)))?
            .map_err(|e| VigilError::Probe(format!("cannot run nvidia-smi: {e}")))?;

        if !output.status.success() {
            return Err(VigilError::Probe(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }

        let (used, total) = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| VigilError::Probe("unrecognized nvidia-smi output".to_owned()))?;
        Ok(ResourceSnapshot::new(used, total))
    }
}

/// Parse `used, total` CSV lines (MiB), summing all GPUs.
fn parse_nvidia_smi(stdout: &str) -> Option<(u64, u64)> {
    let mut used = 0u64;
    let mut total = 0u64;
    let mut rows = 0usize;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let u = fields.next()?.parse::<u64>().ok()?;
        let t = fields.next()?.parse::<u64>().ok()?;
        used = used.saturating_add(u);
        total = total.saturating_add(t);
        rows += 1;
    }

    (rows > 0).then_some((used, total))
}

/// Returns configured values. Values can be changed at runtime, which the
/// test suites use to simulate pressure.
#[derive(Debug)]
pub struct FixedProbe {
    values: Mutex<Option<(u64, u64)>>,
}

impl FixedProbe {
    pub fn new(used: u64, total: u64) -> Self {
        Self {
            values: Mutex::new(Some((used, total))),
        }
    }

    /// A probe that always fails, as if the source were unavailable.
    pub fn unavailable() -> Self {
        Self {
            values: Mutex::new(None),
        }
    }

    pub fn set(&self, used: u64, total: u64) {
        if let Ok(mut values) = self.values.lock() {
            *values = Some((used, total));
        }
    }
}

#[async_trait]
impl ResourceSnapshotSource for FixedProbe {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn sample(&self) -> Result<ResourceSnapshot> {
        let values = *self
            .values
            .lock()
            .map_err(|_| VigilError::Probe("fixed probe lock poisoned".to_owned()))?;
        let (used, total) =
            values.ok_or_else(|| VigilError::Probe("fixed probe marked unavailable".to_owned()))?;
        Ok(ResourceSnapshot::new(used, total))
    }
}
