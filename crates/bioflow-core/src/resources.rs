//! Resource grammars and host bookkeeping.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::Resources;

// Size strings like "4GB", "512MB", "16G". Binary units; a unit
// indicator (letter or B) is required, a bare number is not a size.
static MEMORY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([KMGT]B?|B)$").unwrap());

// Durations like "30s", "15m", "2h", "1d".
static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)([smhd])$").unwrap());

/// Parse a memory size string into bytes.
pub fn parse_memory(value: &str) -> Result<u64> {
    let normalized = value.trim().to_uppercase();
    let caps = MEMORY_REGEX
        .captures(&normalized)
        .ok_or_else(|| Error::Resource(format!("invalid memory string: '{value}'")))?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| Error::Resource(format!("invalid memory string: '{value}'")))?;
    let multiplier: u64 = match caps[2].trim_end_matches('B') {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => unreachable!(),
    };

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Resource(format!("memory size overflows: '{value}'")))
}

/// Parse a duration string into a `Duration`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let caps = DURATION_REGEX
        .captures(value.trim())
        .ok_or_else(|| Error::Resource(format!("invalid duration string: '{value}'")))?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| Error::Resource(format!("invalid duration string: '{value}'")))?;
    let seconds = match &caps[2] {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        _ => unreachable!(),
    };

    Ok(Duration::from_secs(seconds))
}

/// A step's parsed resource demand, validated at pre-flight so the
/// scheduler never has to handle a grammar error mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceDemand {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub gpus: u32,
    pub timeout: Option<Duration>,
}

impl ResourceDemand {
    pub fn from_resources(resources: Option<&Resources>) -> Result<Self> {
        let Some(resources) = resources else {
            return Ok(Self::default());
        };

        Ok(Self {
            cpus: resources.cpu.unwrap_or(0),
            memory_bytes: resources
                .memory
                .as_deref()
                .map(parse_memory)
                .transpose()?
                .unwrap_or(0),
            gpus: resources.gpu.unwrap_or(0),
            timeout: resources.time.as_deref().map(parse_duration).transpose()?,
        })
    }
}

/// Host capacity the scheduler budgets against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub cpus: u32,
    pub memory_bytes: u64,
    /// No portable probe exists; defaults to 0, set by the embedder.
    pub gpus: u32,
}

impl HostCapacity {
    /// Probe the current host.
    pub fn detect() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();

        Self {
            cpus: num_cpus::get() as u32,
            memory_bytes: system.available_memory(),
            gpus: 0,
        }
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    /// Whether a demand could ever be satisfied on this host.
    pub fn can_ever_fit(&self, demand: &ResourceDemand) -> bool {
        demand.cpus <= self.cpus
            && demand.memory_bytes <= self.memory_bytes
            && demand.gpus <= self.gpus
    }
}

/// Running tally of allocated resources. Allocate on `mark_running`,
/// release on any terminal transition; the sum never exceeds capacity.
#[derive(Debug)]
pub struct ResourceTracker {
    capacity: HostCapacity,
    allocated_cpus: u32,
    allocated_memory: u64,
    allocated_gpus: u32,
}

impl ResourceTracker {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            capacity,
            allocated_cpus: 0,
            allocated_memory: 0,
            allocated_gpus: 0,
        }
    }

    pub fn can_run(&self, demand: &ResourceDemand) -> bool {
        self.allocated_cpus + demand.cpus <= self.capacity.cpus
            && self.allocated_memory + demand.memory_bytes <= self.capacity.memory_bytes
            && self.allocated_gpus + demand.gpus <= self.capacity.gpus
    }

    pub fn allocate(&mut self, demand: &ResourceDemand) {
        self.allocated_cpus += demand.cpus;
        self.allocated_memory += demand.memory_bytes;
        self.allocated_gpus += demand.gpus;
    }

    pub fn release(&mut self, demand: &ResourceDemand) {
        self.allocated_cpus = self.allocated_cpus.saturating_sub(demand.cpus);
        self.allocated_memory = self.allocated_memory.saturating_sub(demand.memory_bytes);
        self.allocated_gpus = self.allocated_gpus.saturating_sub(demand.gpus);
    }
}
