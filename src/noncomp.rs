// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Non-compute die discovery.
//!
//! Dies without CPUs (I/O dies, memory dies) are invisible to the kernel
//! topology subsystem, but each corresponds to a UFS TPMI cluster whose
//! status register reports no core agent. The logical die number of a
//! cluster is `instance + cluster`; these are logical uncore-scaling
//! entities and do not necessarily correspond to physical dies.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use base::Result;
use log::debug;
use tpmi::TpmiEngine;

/// Fabric agent types a die may carry, as reported by `UFS_STATUS`.
/// Non-compute dies never have the core agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentType {
    Core,
    Cache,
    Io,
    Memory,
}

impl AgentType {
    const ALL: [AgentType; 4] = [AgentType::Core, AgentType::Cache, AgentType::Io, AgentType::Memory];

    fn bitfield(&self) -> &'static str {
        match self {
            AgentType::Core => "AGENT_TYPE_CORE",
            AgentType::Cache => "AGENT_TYPE_CACHE",
            AgentType::Io => "AGENT_TYPE_IO",
            AgentType::Memory => "AGENT_TYPE_MEMORY",
        }
    }

    fn title_word(&self) -> &'static str {
        match self {
            AgentType::Core => "core",
            AgentType::Cache => "cache",
            AgentType::Io => "I/O",
            AgentType::Memory => "memory",
        }
    }
}

/// Detailed information about one non-compute die.
#[derive(Clone, Debug)]
pub struct NonCompDieInfo {
    pub package: u32,
    pub die: u32,
    pub agent_types: Vec<AgentType>,
    /// Human label built from the agent types, e.g. "I/O" or
    /// "Cache and memory".
    pub title: String,
}

// "x", "x and y", or "x, y, and z", first letter capitalized.
fn format_title(agent_types: &[AgentType]) -> String {
    let words: Vec<&str> = agent_types.iter().map(|agent| agent.title_word()).collect();

    let title = match words.len() {
        0 => String::new(),
        1 => words[0].to_string(),
        2 => format!("{} and {}", words[0], words[1]),
        _ => format!("{}, and {}", words[..words.len() - 1].join(", "), words[words.len() - 1]),
    };

    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => title,
    }
}

/// Discovers non-compute dies via the UFS TPMI feature, lazily on first
/// query.
pub struct NonCompDies {
    tpmi: TpmiEngine,
    discovered: bool,
    dies: BTreeMap<u32, Vec<u32>>,
    dies_sets: BTreeMap<u32, BTreeSet<u32>>,
    info: BTreeMap<u32, BTreeMap<u32, NonCompDieInfo>>,
}

impl NonCompDies {
    pub fn new(tpmi: TpmiEngine) -> NonCompDies {
        NonCompDies {
            tpmi,
            discovered: false,
            dies: BTreeMap::new(),
            dies_sets: BTreeMap::new(),
            info: BTreeMap::new(),
        }
    }

    pub fn tpmi(&mut self) -> &mut TpmiEngine {
        &mut self.tpmi
    }

    fn discover(&mut self) -> Result<()> {
        self.discovered = true;

        for (package, addr, instance, cluster) in self.tpmi.iter_ufs_feature(&[], &[], &[], &[])? {
            let regval = self
                .tpmi
                .read_ufs_register(&addr, instance, cluster, "UFS_STATUS", None)?;

            if self
                .tpmi
                .get_bitfield(regval, "ufs", "UFS_STATUS", AgentType::Core.bitfield())?
                != 0
            {
                debug!(
                    "skipping a compute die at package {package}, addr {addr}, instance \
                     {instance}, cluster {cluster}"
                );
                continue;
            }

            let die = instance + cluster;

            let mut agent_types = Vec::new();
            for agent in AgentType::ALL {
                if self
                    .tpmi
                    .get_bitfield(regval, "ufs", "UFS_STATUS", agent.bitfield())?
                    != 0
                {
                    agent_types.push(agent);
                }
            }

            self.dies.entry(package).or_default().push(die);
            self.dies_sets.entry(package).or_default().insert(die);
            self.info.entry(package).or_default().insert(
                die,
                NonCompDieInfo {
                    package,
                    die,
                    title: format_title(&agent_types),
                    agent_types,
                },
            );
        }
        Ok(())
    }

    fn ensure_discovered(&mut self) -> Result<()> {
        if !self.discovered {
            self.discover()?;
        }
        Ok(())
    }

    /// Non-compute die numbers per package, ascending.
    pub fn get_dies(&mut self) -> Result<&BTreeMap<u32, Vec<u32>>> {
        self.ensure_discovered()?;
        Ok(&self.dies)
    }

    /// Non-compute die numbers per package, as sets.
    pub fn get_dies_sets(&mut self) -> Result<&BTreeMap<u32, BTreeSet<u32>>> {
        self.ensure_discovered()?;
        Ok(&self.dies_sets)
    }

    /// Detailed per-die information, per package.
    pub fn get_dies_info(&mut self) -> Result<&BTreeMap<u32, BTreeMap<u32, NonCompDieInfo>>> {
        self.ensure_discovered()?;
        Ok(&self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_formatting() {
        assert_eq!(format_title(&[AgentType::Io]), "I/O");
        assert_eq!(format_title(&[AgentType::Cache, AgentType::Memory]), "Cache and memory");
        assert_eq!(
            format_title(&[AgentType::Cache, AgentType::Io, AgentType::Memory]),
            "Cache, I/O, and memory"
        );
        assert_eq!(format_title(&[AgentType::Memory]), "Memory");
    }
}
