// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scope-aware write-through cache of MSR values.

use std::collections::HashMap;
use std::rc::Rc;

use base::CpuInfo;
use base::Error;
use base::Result;
use base::Scope;

/// Caches raw 64-bit values keyed by `(register address, CPU number)`.
///
/// Insertions and removals are scope-aware: adding a value with, say,
/// package scope populates the same value for every CPU of the package,
/// because all of them share the one physical register copy. With the cache
/// disabled every operation is a no-op and reads go through to hardware.
pub struct PerCpuCache {
    cpuinfo: Rc<CpuInfo>,
    enable_cache: bool,
    enable_scope: bool,
    vals: HashMap<(u32, u32), u64>,
}

impl PerCpuCache {
    pub fn new(cpuinfo: Rc<CpuInfo>, enable_cache: bool, enable_scope: bool) -> PerCpuCache {
        PerCpuCache {
            cpuinfo,
            enable_cache,
            enable_scope,
            vals: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable_cache
    }

    /// Whether a value is cached for `(regaddr, cpu)`.
    pub fn is_cached(&self, regaddr: u32, cpu: u32) -> bool {
        self.enable_cache && self.vals.contains_key(&(regaddr, cpu))
    }

    /// The cached value for `(regaddr, cpu)`.
    pub fn get(&self, regaddr: u32, cpu: u32) -> Result<u64> {
        if !self.enable_cache {
            return Err(Error::NotFound(format!(
                "MSR {regaddr:#x} is not cached for CPU {cpu}: caching is disabled"
            )));
        }
        self.vals.get(&(regaddr, cpu)).copied().ok_or_else(|| {
            Error::NotFound(format!("MSR {regaddr:#x} is not cached for CPU {cpu}"))
        })
    }

    /// Cache `val` for `(regaddr, cpu)` and for every sibling of `cpu` at
    /// scope `sname`.
    pub fn add(&mut self, regaddr: u32, cpu: u32, val: u64, sname: Scope) -> Result<()> {
        if !self.enable_cache {
            return Ok(());
        }

        if self.enable_scope {
            for &sibling in self.cpuinfo.cpu_siblings(cpu, sname)? {
                self.vals.insert((regaddr, sibling), val);
            }
        } else {
            self.vals.insert((regaddr, cpu), val);
        }
        Ok(())
    }

    /// Drop the cached value of `(regaddr, cpu)` and of every sibling of
    /// `cpu` at scope `sname`.
    pub fn remove(&mut self, regaddr: u32, cpu: u32, sname: Scope) -> Result<()> {
        if !self.enable_cache {
            return Ok(());
        }

        if self.enable_scope {
            for &sibling in self.cpuinfo.cpu_siblings(cpu, sname)? {
                self.vals.remove(&(regaddr, sibling));
            }
        } else {
            self.vals.remove(&(regaddr, cpu));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::cpumodel;
    use base::testing;

    fn cache() -> PerCpuCache {
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        PerCpuCache::new(info, true, true)
    }

    #[test]
    fn package_scope_fans_out_to_all_siblings() {
        let mut cache = cache();
        cache.add(0xE2, 0, 0x1234, Scope::Package).unwrap();

        for cpu in 0..8 {
            assert!(cache.is_cached(0xE2, cpu));
            assert_eq!(cache.get(0xE2, cpu).unwrap(), 0x1234);
        }
        for cpu in 8..16 {
            assert!(!cache.is_cached(0xE2, cpu));
        }
    }

    #[test]
    fn cpu_scope_stays_per_cpu() {
        let mut cache = cache();
        cache.add(0x774, 3, 0xff, Scope::Cpu).unwrap();
        assert!(cache.is_cached(0x774, 3));
        assert!(!cache.is_cached(0x774, 2));
    }

    #[test]
    fn remove_invalidates_scope_siblings() {
        let mut cache = cache();
        cache.add(0xCE, 5, 7, Scope::Die).unwrap();
        assert!(cache.is_cached(0xCE, 4));
        cache.remove(0xCE, 7, Scope::Die).unwrap();
        for cpu in 4..8 {
            assert!(!cache.is_cached(0xCE, cpu));
        }
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let mut cache = PerCpuCache::new(info, false, true);
        cache.add(0xCE, 0, 7, Scope::Package).unwrap();
        assert!(!cache.is_cached(0xCE, 0));
        assert!(cache.get(0xCE, 0).is_err());
    }

    #[test]
    fn scope_disabled_caches_single_cpu_only() {
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let mut cache = PerCpuCache::new(info, true, false);
        cache.add(0xCE, 0, 7, Scope::Package).unwrap();
        assert!(cache.is_cached(0xCE, 0));
        assert!(!cache.is_cached(0xCE, 1));
    }
}
