// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Read-only CPU topology handle.
//!
//! The handle is constructed from explicit per-CPU topology records (the
//! enumeration itself lives outside this workspace) and precomputes sibling
//! tables for every scope level, so sibling lookups during MSR scope
//! optimization are O(1).

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use crate::cpumodel;
use crate::fmt::rangify;
use crate::Error;
use crate::Result;

/// Register scope: the set of CPUs sharing one physical copy of a register.
/// Ordered from the smallest to the largest scope.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Scope {
    Cpu,
    Core,
    Module,
    Die,
    Node,
    Package,
}

impl Scope {
    pub const ALL: [Scope; 6] = [
        Scope::Cpu,
        Scope::Core,
        Scope::Module,
        Scope::Die,
        Scope::Node,
        Scope::Package,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scope::Cpu => "CPU",
            Scope::Core => "core",
            Scope::Module => "module",
            Scope::Die => "die",
            Scope::Node => "node",
            Scope::Package => "package",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hybrid CPU classification.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HybridKind {
    PCore,
    ECore,
    LpECore,
}

impl HybridKind {
    pub fn name(&self) -> &'static str {
        match self {
            HybridKind::PCore => "P-core",
            HybridKind::ECore => "E-core",
            HybridKind::LpECore => "LPE-core",
        }
    }
}

/// Hybrid CPU sets. All empty on non-hybrid systems.
#[derive(Clone, Debug, Default)]
pub struct HybridCpus {
    pub pcores: Vec<u32>,
    pub ecores: Vec<u32>,
    pub lpecores: Vec<u32>,
}

/// One CPU's position in the topology. Core, module and die numbers are
/// relative to the package, as in sysfs.
#[derive(Clone, Copy, Debug)]
pub struct CpuTopologyEntry {
    pub cpu: u32,
    pub core: u32,
    pub module: u32,
    pub die: u32,
    pub node: u32,
    pub package: u32,
}

struct ScopeTable {
    // CPU number -> index into 'groups'.
    group_of: HashMap<u32, usize>,
    // Sibling lists, each sorted ascending.
    groups: Vec<Vec<u32>>,
}

pub struct CpuInfo {
    entries: Vec<CpuTopologyEntry>,
    vfm: u32,
    flags: HashMap<u32, HashSet<String>>,
    hybrid: Option<HybridCpus>,
    offline: Vec<u32>,
    tables: HashMap<Scope, ScopeTable>,
    cpus: Vec<u32>,
    packages: Vec<u32>,
}

impl CpuInfo {
    /// Build a topology handle from explicit records.
    ///
    /// `flags` holds the `/proc/cpuinfo` feature-flag set of every CPU, and
    /// `hybrid` the P-core/E-core/LPE-core classification (None for
    /// non-hybrid systems).
    pub fn new(
        entries: Vec<CpuTopologyEntry>,
        vfm: u32,
        flags: HashMap<u32, HashSet<String>>,
        hybrid: Option<HybridCpus>,
    ) -> Result<CpuInfo> {
        if entries.is_empty() {
            return Err(Error::BadValue("empty CPU topology".to_string()));
        }

        let mut cpus: Vec<u32> = entries.iter().map(|e| e.cpu).collect();
        cpus.sort_unstable();
        cpus.dedup();
        if cpus.len() != entries.len() {
            return Err(Error::BadValue("duplicate CPU numbers in topology".to_string()));
        }

        let mut packages: Vec<u32> = entries.iter().map(|e| e.package).collect();
        packages.sort_unstable();
        packages.dedup();

        let mut tables = HashMap::new();
        for scope in Scope::ALL {
            tables.insert(scope, Self::build_scope_table(&entries, scope));
        }

        Ok(CpuInfo {
            entries,
            vfm,
            flags,
            hybrid,
            offline: Vec::new(),
            tables,
            cpus,
            packages,
        })
    }

    fn build_scope_table(entries: &[CpuTopologyEntry], scope: Scope) -> ScopeTable {
        // Key uniquely identifying the scope group an entry belongs to.
        let key = |e: &CpuTopologyEntry| -> (u32, u32) {
            match scope {
                Scope::Cpu => (u32::MAX, e.cpu),
                Scope::Core => (e.package, e.core),
                Scope::Module => (e.package, e.module),
                Scope::Die => (e.package, e.die),
                Scope::Node => (u32::MAX, e.node),
                Scope::Package => (u32::MAX, e.package),
            }
        };

        let mut key2group: HashMap<(u32, u32), usize> = HashMap::new();
        let mut groups: Vec<Vec<u32>> = Vec::new();
        let mut group_of: HashMap<u32, usize> = HashMap::new();

        let mut sorted: Vec<&CpuTopologyEntry> = entries.iter().collect();
        sorted.sort_by_key(|e| e.cpu);

        for entry in sorted {
            let idx = *key2group.entry(key(entry)).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[idx].push(entry.cpu);
            group_of.insert(entry.cpu, idx);
        }

        ScopeTable { group_of, groups }
    }

    /// Mark CPUs as offline. Offline CPUs still appear in the topology; the
    /// frequency layer consults this list for bug advisories.
    pub fn set_offline_cpus(&mut self, cpus: Vec<u32>) {
        self.offline = cpus;
    }

    /// All CPU numbers, ascending.
    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    /// All package numbers, ascending.
    pub fn packages(&self) -> &[u32] {
        &self.packages
    }

    pub fn offline_cpus(&self) -> &[u32] {
        &self.offline
    }

    pub fn vfm(&self) -> u32 {
        self.vfm
    }

    pub fn is_intel(&self) -> bool {
        cpumodel::is_intel(self.vfm)
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid.is_some()
    }

    pub fn hybrid_cpus(&self) -> Option<&HybridCpus> {
        self.hybrid.as_ref()
    }

    /// The `/proc/cpuinfo` flags of a CPU. Unknown CPUs have no flags.
    pub fn cpu_flags(&self, cpu: u32) -> Option<&HashSet<String>> {
        self.flags.get(&cpu)
    }

    /// Sibling CPUs of `cpu` at scope `scope`, ascending, including `cpu`
    /// itself. O(1).
    pub fn cpu_siblings(&self, cpu: u32, scope: Scope) -> Result<&[u32]> {
        let table = &self.tables[&scope];
        let idx = table
            .group_of
            .get(&cpu)
            .ok_or_else(|| Error::BadValue(format!("CPU {cpu} does not exist")))?;
        Ok(&table.groups[*idx])
    }

    /// CPU numbers of package `package`, ascending.
    pub fn package_cpus(&self, package: u32) -> Result<Vec<u32>> {
        if !self.packages.contains(&package) {
            return Err(Error::BadValue(format!(
                "package {package} does not exist, valid packages: {}",
                rangify(&self.packages)
            )));
        }
        let mut cpus: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.package == package)
            .map(|e| e.cpu)
            .collect();
        cpus.sort_unstable();
        Ok(cpus)
    }

    /// Die numbers of package `package`, ascending.
    pub fn package_dies(&self, package: u32) -> Result<Vec<u32>> {
        let dies: BTreeSet<u32> = self
            .entries
            .iter()
            .filter(|e| e.package == package)
            .map(|e| e.die)
            .collect();
        if dies.is_empty() {
            return Err(Error::BadValue(format!(
                "package {package} does not exist, valid packages: {}",
                rangify(&self.packages)
            )));
        }
        Ok(dies.into_iter().collect())
    }

    /// Validate a CPU selection and return it in the original order with
    /// duplicates dropped. `None` selects all CPUs.
    pub fn normalize_cpus(&self, cpus: Option<&[u32]>) -> Result<Vec<u32>> {
        let cpus = match cpus {
            None => return Ok(self.cpus.clone()),
            Some(cpus) => cpus,
        };

        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            if !self.tables[&Scope::Cpu].group_of.contains_key(&cpu) {
                return Err(Error::BadValue(format!(
                    "CPU {cpu} does not exist, valid CPUs: {}",
                    rangify(&self.cpus)
                )));
            }
            if seen.insert(cpu) {
                result.push(cpu);
            }
        }
        Ok(result)
    }

    /// Render a CPU list as a compact range string for messages.
    pub fn cpus_str(&self, cpus: &[u32]) -> String {
        rangify(cpus)
    }

    /// A short human description of the processor.
    pub fn descr(&self) -> String {
        let (_, family, model) = cpumodel::split_vfm(self.vfm);
        match cpumodel::codename(self.vfm) {
            Some(codename) => format!("{codename} (family {family}, model {model:#x})"),
            None if cpumodel::is_intel(self.vfm) => {
                format!("Intel processor (family {family}, model {model:#x})")
            }
            None => format!("processor (family {family}, model {model:#x})"),
        }
    }
}

/// Canned topologies for tests across the workspace.
pub mod testing {
    use super::*;

    /// A 2-package, 2-dies-per-package, 2-CPUs-per-core topology used across
    /// the workspace tests: 16 CPUs, CPU n belongs to package n/8, die
    /// (n%8)/4, core (n%4)/2 within the die.
    pub fn two_package_topology() -> Vec<CpuTopologyEntry> {
        let mut entries = Vec::new();
        for cpu in 0..16u32 {
            let package = cpu / 8;
            let die = (cpu % 8) / 4;
            let core = (cpu % 4) / 2;
            entries.push(CpuTopologyEntry {
                cpu,
                core: die * 2 + core,
                module: die * 2 + core,
                die,
                node: package,
                package,
            });
        }
        entries
    }

    pub fn cpu_info_with_flags(vfm: u32, flag_names: &[&str]) -> CpuInfo {
        let entries = two_package_topology();
        let mut flags = HashMap::new();
        for entry in &entries {
            flags.insert(
                entry.cpu,
                flag_names.iter().map(|f| f.to_string()).collect::<HashSet<String>>(),
            );
        }
        CpuInfo::new(entries, vfm, flags, None).unwrap()
    }
}
