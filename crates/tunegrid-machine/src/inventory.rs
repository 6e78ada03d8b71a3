//! CPU/GPU inventory derived from the agent trees.

use std::collections::BTreeMap;

use tracing::warn;

use crate::topology::{Property, PropertyTree};

/// Prefix the ISA name carries in front of the architecture.
const ISA_PREFIX: &str = "amdgcn-amd-amdhsa--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuEntry {
    pub rinfo: PropertyTree,
    pub arch: String,
    pub num_cu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuEntry {
    pub rinfo: PropertyTree,
    pub num_cu: u32,
}

/// Devices of one host, in agent order. GPU `i` is local GPU index `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub cpus: Vec<CpuEntry>,
    pub gpus: Vec<GpuEntry>,
    /// Total CPU compute units.
    pub num_cpus: u32,
}

impl Inventory {
    /// Classify agents by `Device Type`; other device types are skipped.
    pub fn from_agents(agents: &BTreeMap<u32, PropertyTree>) -> Self {
        let mut inventory = Inventory::default();
        for (agent, rinfo) in agents {
            let num_cu = compute_units(*agent, rinfo);
            match rinfo.value("Device Type") {
                Some("GPU") => inventory.gpus.push(GpuEntry {
                    arch: gpu_arch(rinfo),
                    num_cu,
                    rinfo: rinfo.clone(),
                }),
                Some("CPU") => inventory.cpus.push(CpuEntry {
                    rinfo: rinfo.clone(),
                    num_cu,
                }),
                _ => {}
            }
        }
        inventory.num_cpus = inventory.cpus.iter().map(|c| c.num_cu).sum();
        inventory
    }

    /// A host whose device report was empty: CPUs only, no GPUs.
    pub fn cpu_only(num_cpus: u32) -> Self {
        Self {
            num_cpus,
            ..Self::default()
        }
    }

    pub fn gpu(&self, index: usize) -> Option<&GpuEntry> {
        self.gpus.get(index)
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus.len()
    }
}

/// `Name`, refined by `ISA Info / ISA 1 / Name` when the report has it.
fn gpu_arch(rinfo: &PropertyTree) -> String {
    match rinfo.lookup(&["ISA Info", "ISA 1", "Name"]) {
        Some(Property::Value(isa)) => isa.strip_prefix(ISA_PREFIX).unwrap_or(isa).to_string(),
        _ => rinfo.value("Name").unwrap_or_default().to_string(),
    }
}

fn compute_units(agent: u32, rinfo: &PropertyTree) -> u32 {
    let raw = rinfo.value("Compute Unit").unwrap_or_default();
    raw.parse().unwrap_or_else(|_| {
        warn!(agent, value = raw, "unreadable compute unit count");
        0
    })
}
