// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The HWP performance level ladder (`MSR_HWP_CAPABILITIES`) and HWP
//! status, as consumed by the property orchestrator.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;
use msr::regs;
use msr::FeaturedMsr;
use msr::MsrEngine;

/// Raw HWP performance levels. Unlike `CpuFreqMsr`, values are plain
/// performance units, not hertz.
pub struct HwpMsr {
    cpuinfo: Rc<CpuInfo>,
    msr: Rc<RefCell<MsrEngine>>,
    pmenable: Option<FeaturedMsr>,
    hwpcap: Option<FeaturedMsr>,
}

impl HwpMsr {
    pub fn new(cpuinfo: Rc<CpuInfo>, msr: Rc<RefCell<MsrEngine>>) -> HwpMsr {
        HwpMsr {
            cpuinfo,
            msr,
            pmenable: None,
            hwpcap: None,
        }
    }

    fn hwpcap(&mut self) -> Result<&FeaturedMsr> {
        if self.hwpcap.is_none() {
            self.hwpcap = Some(regs::hwp_capabilities::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.hwpcap.as_ref().unwrap())
    }

    fn pmenable(&mut self) -> Result<&FeaturedMsr> {
        if self.pmenable.is_none() {
            self.pmenable = Some(regs::pm_enable::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.pmenable.as_ref().unwrap())
    }

    fn perf_level(&mut self, fname: &str, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.hwpcap()?.read_feature_int(fname, Some(cpus))
    }

    pub fn get_lowest_perf(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.perf_level("lowest_perf", cpus)
    }

    pub fn get_efficient_perf(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.perf_level("efficient_perf", cpus)
    }

    pub fn get_guaranteed_perf(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.perf_level("guaranteed_perf", cpus)
    }

    pub fn get_highest_perf(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.perf_level("highest_perf", cpus)
    }

    /// Whether hardware-managed P-states are enabled.
    pub fn get_hwp(&mut self, cpus: &[u32]) -> Result<Vec<(u32, bool)>> {
        self.pmenable()?.is_feature_enabled("hwp", Some(cpus))
    }
}
