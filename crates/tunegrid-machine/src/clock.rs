//! GPU clock level parsing and control commands.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::MachineResult;

/// Current clock levels of one GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuClocks {
    pub sclk: Option<u32>,
    pub mclk: Option<u32>,
}

/// Parse `rocm-smi -c` output into per-GPU levels.
///
/// Device indices are rebased so the smallest one seen becomes 0.
pub fn parse_clock_levels(text: &str) -> MachineResult<Vec<GpuClocks>> {
    let device_re = Regex::new(r"GPU\[(\d+)\]")?;
    let level_re = Regex::new(r"level\s*:\s*(\d+)")?;

    let mut by_device: BTreeMap<u32, GpuClocks> = BTreeMap::new();
    for line in text.lines() {
        let Some(device) = device_re
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok())
        else {
            continue;
        };
        let entry = by_device.entry(device).or_default();
        let level = level_re
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok());
        if line.contains("sclk") {
            entry.sclk = level.or(entry.sclk);
        }
        if line.contains("mclk") {
            entry.mclk = level.or(entry.mclk);
        }
    }

    let Some(&base) = by_device.keys().next() else {
        return Ok(Vec::new());
    };
    let len = by_device.keys().last().map_or(0, |&last| (last - base) as usize + 1);
    let mut clocks = vec![GpuClocks::default(); len];
    for (device, levels) in by_device {
        clocks[(device - base) as usize] = levels;
    }
    Ok(clocks)
}

/// One `rocm-smi` invocation per configured clock target.
pub fn set_clock_commands(rocm_smi: &str, gpu: u32, target: GpuClocks) -> Vec<String> {
    let mut cmds = Vec::new();
    if let Some(level) = target.sclk {
        cmds.push(format!("{rocm_smi} -d {gpu} --setsclk {level}"));
    }
    if let Some(level) = target.mclk {
        cmds.push(format!("{rocm_smi} -d {gpu} --setmclk {level}"));
    }
    cmds
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMI: &str = "\
========================ROCm System Management Interface========================
================================= Current clock frequencies =================================
GPU[2]		: mclk clock level: 3 (1600Mhz)
GPU[2]		: sclk clock level: 7 (1700Mhz)
GPU[3]		: mclk clock level: 3 (1600Mhz)
GPU[3]		: sclk clock level: 1 (800Mhz)
GPU[3]		: socclk clock level: 2 (900Mhz)
=============================================================================================
";

    #[test]
    fn indices_are_rebased() {
        let clocks = parse_clock_levels(SMI).unwrap();
        assert_eq!(clocks.len(), 2);
        assert_eq!(clocks[0], GpuClocks { sclk: Some(7), mclk: Some(3) });
        assert_eq!(clocks[1], GpuClocks { sclk: Some(1), mclk: Some(3) });
    }

    #[test]
    fn no_devices_no_clocks() {
        assert!(parse_clock_levels("rocm-smi: command not found\n").unwrap().is_empty());
    }

    #[test]
    fn set_commands_only_for_targets() {
        let cmds = set_clock_commands("/opt/rocm/bin/rocm-smi", 1, GpuClocks { sclk: Some(5), mclk: None });
        assert_eq!(cmds, vec!["/opt/rocm/bin/rocm-smi -d 1 --setsclk 5"]);
        assert!(set_clock_commands("rocm-smi", 0, GpuClocks::default()).is_empty());
    }
}
