// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU frequency control via `MSR_HWP_REQUEST` on Intel platforms.
//!
//! The MSR is programmed in performance level units. On most platforms a
//! level is the frequency ratio (frequency divided by the bus clock); on
//! hybrid platforms the P-cores use abstract units scaled by a
//! platform-dependent factor, and frequencies are rounded down to a bus
//! clock multiple the way the `intel_pstate` driver does it.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::fmt::hertz;
use base::CpuInfo;
use base::Error;
use base::Result;
use log::debug;
use msr::regs;
use msr::FeatureValue;
use msr::FeaturedMsr;
use msr::MsrEngine;

// Performance-level-to-hertz factors for hybrid P-cores.
const PERF_FACTOR_METEORLAKE: u64 = 80_000_000;
const PERF_FACTOR_LUNARLAKE: u64 = 86_957_000;
const PERF_FACTOR_ADL_RPL: u64 = 78_741_000;

// The fallback bus clock on Intel platforms without MSR_FSB_FREQ.
const DEFAULT_INTEL_BCLK_HZ: u64 = 100_000_000;

#[derive(Clone, Copy)]
enum FreqKey {
    Min,
    Max,
}

impl FreqKey {
    fn feature(&self) -> &'static str {
        match self {
            FreqKey::Min => "min_perf",
            FreqKey::Max => "max_perf",
        }
    }

    fn what(&self) -> &'static str {
        match self {
            FreqKey::Min => "min",
            FreqKey::Max => "max",
        }
    }
}

/// `MSR_HWP_REQUEST`-based frequency control. The per-MSR feature tables
/// are created lazily; callers must pass valid, online CPU numbers.
pub struct CpuFreqMsr {
    cpuinfo: Rc<CpuInfo>,
    msr: Rc<RefCell<MsrEngine>>,
    fsbfreq: Option<FeaturedMsr>,
    pmenable: Option<FeaturedMsr>,
    hwpreq: Option<FeaturedMsr>,
    hwpreq_pkg: Option<FeaturedMsr>,
    hwpcap: Option<FeaturedMsr>,
    platinfo: Option<FeaturedMsr>,
    trl: Option<FeaturedMsr>,
    pcore_cpus: Vec<u32>,
    perf_to_freq_factor: u64,
}

impl CpuFreqMsr {
    pub fn new(cpuinfo: Rc<CpuInfo>, msr: Rc<RefCell<MsrEngine>>) -> CpuFreqMsr {
        let mut pcore_cpus = Vec::new();
        let mut factor = 0;

        if let Some(hybrid) = cpuinfo.hybrid_cpus() {
            pcore_cpus = hybrid.pcores.clone();
            let vfm = cpuinfo.vfm();
            factor = if cpumodel::GROUP_METEORLAKE.contains(&vfm) {
                PERF_FACTOR_METEORLAKE
            } else if cpumodel::GROUP_LUNARLAKE.contains(&vfm) {
                PERF_FACTOR_LUNARLAKE
            } else {
                PERF_FACTOR_ADL_RPL
            };
        }

        CpuFreqMsr {
            cpuinfo,
            msr,
            fsbfreq: None,
            pmenable: None,
            hwpreq: None,
            hwpreq_pkg: None,
            hwpcap: None,
            platinfo: None,
            trl: None,
            pcore_cpus,
            perf_to_freq_factor: factor,
        }
    }

    fn hwpreq(&mut self) -> Result<&FeaturedMsr> {
        if self.hwpreq.is_none() {
            self.hwpreq = Some(regs::hwp_request::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.hwpreq.as_ref().unwrap())
    }

    fn hwpreq_pkg(&mut self) -> Result<&FeaturedMsr> {
        if self.hwpreq_pkg.is_none() {
            self.hwpreq_pkg = Some(regs::hwp_request_pkg::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.hwpreq_pkg.as_ref().unwrap())
    }

    fn hwpcap(&mut self) -> Result<&FeaturedMsr> {
        if self.hwpcap.is_none() {
            self.hwpcap = Some(regs::hwp_capabilities::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.hwpcap.as_ref().unwrap())
    }

    fn platinfo(&mut self) -> Result<&FeaturedMsr> {
        if self.platinfo.is_none() {
            self.platinfo = Some(regs::platform_info::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.platinfo.as_ref().unwrap())
    }

    fn trl(&mut self) -> Result<&FeaturedMsr> {
        if self.trl.is_none() {
            self.trl = Some(regs::turbo_ratio_limit::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.trl.as_ref().unwrap())
    }

    fn pmenable(&mut self) -> Result<&FeaturedMsr> {
        if self.pmenable.is_none() {
            self.pmenable = Some(regs::pm_enable::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.pmenable.as_ref().unwrap())
    }

    /// Bus clock speeds, Hz. Falls back to 100 MHz on Intel platforms
    /// without `MSR_FSB_FREQ`.
    pub fn get_bclks(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        if self.fsbfreq.is_none() {
            match regs::fsb_freq::new(&self.cpuinfo, &self.msr) {
                Ok(fsbfreq) => self.fsbfreq = Some(fsbfreq),
                Err(err) if err.is_not_supported() && self.cpuinfo.is_intel() => {
                    return Ok(cpus.iter().map(|&cpu| (cpu, DEFAULT_INTEL_BCLK_HZ)).collect());
                }
                Err(err) => return Err(err),
            }
        }

        let fsbfreq = self.fsbfreq.as_ref().unwrap();
        fsbfreq
            .read_feature("fsb", Some(cpus))?
            .into_iter()
            .map(|(cpu, val)| match val {
                FeatureValue::Float(mhz) => Ok((cpu, (mhz * 1_000_000.0).round() as u64)),
                other => Err(Error::BadValue(format!(
                    "unexpected bus clock value '{other}' for CPU {cpu}"
                ))),
            })
            .collect()
    }

    fn perf_to_freq(&self, cpu: u32, perf: u64, bclk: u64) -> u64 {
        if self.pcore_cpus.contains(&cpu) {
            let freq = perf * self.perf_to_freq_factor;
            // Frequency changes in bus clock increments; round down the way
            // the intel_pstate driver does.
            return freq - (freq % bclk);
        }
        perf * bclk
    }

    fn freq_to_perf(&self, cpu: u32, freq: u64, bclk: u64) -> u64 {
        if self.pcore_cpus.contains(&cpu) {
            // Round up so the requested frequency is reachable.
            return (freq + self.perf_to_freq_factor - 1) / self.perf_to_freq_factor;
        }
        freq / bclk
    }

    fn get_freq(&mut self, key: FreqKey, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        let fname = key.feature();
        let bclks = self.get_bclks(cpus)?;

        let mut result = Vec::with_capacity(cpus.len());
        for (cpu, bclk) in bclks {
            let hwpreq = self.hwpreq()?;
            let perf = if regs::hwp_request::is_cpu_feature_pkg_controlled(hwpreq, fname, cpu)? {
                let pkg = self.hwpreq_pkg()?;
                pkg.read_feature_int(fname, Some(&[cpu]))?[0].1
            } else {
                let hwpreq = self.hwpreq()?;
                hwpreq.read_feature_int(fname, Some(&[cpu]))?[0].1
            };

            let freq = self.perf_to_freq(cpu, perf, bclk);
            debug!("CPU {cpu}: {} frequency from MSR_HWP_REQUEST: {freq} Hz (perf {perf})", key.what());
            result.push((cpu, freq));
        }
        Ok(result)
    }

    /// Minimum frequency from `MSR_HWP_REQUEST` (merged with
    /// `MSR_HWP_REQUEST_PKG` where package control is active), Hz.
    pub fn get_min_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.get_freq(FreqKey::Min, cpus)
    }

    /// Maximum frequency, Hz.
    pub fn get_max_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.get_freq(FreqKey::Max, cpus)
    }

    fn get_hwpcap_freq(&mut self, fname: &str, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        if cpus.is_empty() {
            return Ok(Vec::new());
        }
        let bclks = self.get_bclks(cpus)?;
        let perfs = self.hwpcap()?.read_feature_int(fname, Some(cpus))?;
        Ok(bclks
            .into_iter()
            .zip(perfs)
            .map(|((cpu, bclk), (_, perf))| (cpu, self.perf_to_freq(cpu, perf, bclk)))
            .collect())
    }

    fn get_platinfo_freq(&mut self, fname: &str, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        if cpus.is_empty() {
            return Ok(Vec::new());
        }
        let bclks = self.get_bclks(cpus)?;
        let ratios = self.platinfo()?.read_feature_int(fname, Some(cpus))?;
        Ok(bclks
            .into_iter()
            .zip(ratios)
            .map(|((cpu, bclk), (_, ratio))| (cpu, ratio * bclk))
            .collect())
    }

    /// Base frequency: `MSR_HWP_CAPABILITIES` guaranteed performance, or
    /// the `MSR_PLATFORM_INFO` max non-turbo ratio on non-HWP systems. Hz.
    pub fn get_base_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        match self.get_hwpcap_freq("guaranteed_perf", cpus) {
            Ok(result) => Ok(result),
            Err(err) if err.is_not_supported() => {
                self.get_platinfo_freq("max_non_turbo_ratio", cpus)
            }
            Err(err) => Err(err),
        }
    }

    /// Minimum operating frequency (`MSR_PLATFORM_INFO`), Hz.
    pub fn get_min_oper_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.get_platinfo_freq("min_oper_ratio", cpus)
    }

    /// Maximum efficiency frequency, Hz.
    pub fn get_max_eff_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        match self.get_hwpcap_freq("efficient_perf", cpus) {
            Ok(result) => Ok(result),
            Err(err) if err.is_not_supported() => self.get_platinfo_freq("max_eff_ratio", cpus),
            Err(err) => Err(err),
        }
    }

    fn get_max_turbo_freq_trl(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        if cpus.is_empty() {
            return Ok(Vec::new());
        }
        let bclks = self.get_bclks(cpus)?;
        let trl = self.trl()?;

        let ratios = match trl.read_feature_int("max_1c_turbo_ratio", Some(cpus)) {
            Ok(ratios) => ratios,
            Err(err1) if err1.is_not_supported() => {
                // Group-encoded variant: group 0 corresponds to the 1-core
                // turbo ratio.
                match trl.read_feature_int("max_g0_turbo_ratio", Some(cpus)) {
                    Ok(ratios) => ratios,
                    Err(err2) if err2.is_not_supported() => {
                        return Err(Error::NotSupported(format!("{err1}\n{err2}")))
                    }
                    Err(err2) => return Err(err2),
                }
            }
            Err(err1) => return Err(err1),
        };

        Ok(bclks
            .into_iter()
            .zip(ratios)
            .map(|((cpu, bclk), (_, ratio))| (cpu, ratio * bclk))
            .collect())
    }

    /// Maximum 1-core turbo frequency: `MSR_HWP_CAPABILITIES` highest
    /// performance, or `MSR_TURBO_RATIO_LIMIT` on non-HWP systems. Hz.
    pub fn get_max_turbo_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        match self.get_hwpcap_freq("highest_perf", cpus) {
            Ok(result) => Ok(result),
            Err(err) if err.is_not_supported() => self.get_max_turbo_freq_trl(cpus),
            Err(err) => Err(err),
        }
    }

    /// Whether hardware-managed P-states are enabled.
    pub fn get_hwp(&mut self, cpus: &[u32]) -> Result<Vec<(u32, bool)>> {
        self.pmenable()?.is_feature_enabled("hwp", Some(cpus))
    }

    fn validate_freq(&mut self, freq: u64, key: FreqKey, cpus: &[u32]) -> Result<()> {
        let min_limits = self.get_min_oper_freq(cpus)?;
        let max_limits = self.get_max_turbo_freq(cpus)?;

        for ((cpu, min_limit), (_, max_limit)) in min_limits.into_iter().zip(max_limits) {
            if freq < min_limit || freq > max_limit {
                return Err(Error::OutOfRange(format!(
                    "{} CPU {cpu} frequency value of '{}' is out of range, must be within \
                     [{}, {}]",
                    key.what(),
                    hertz(freq),
                    hertz(min_limit),
                    hertz(max_limit)
                )));
            }
        }

        match key {
            FreqKey::Min => {
                for (cpu, max_freq) in self.get_freq(FreqKey::Max, cpus)? {
                    if freq > max_freq {
                        return Err(Error::BadOrder(format!(
                            "min CPU {cpu} frequency value of '{}' is greater than the \
                             currently configured max frequency of {}",
                            hertz(freq),
                            hertz(max_freq)
                        )));
                    }
                }
            }
            FreqKey::Max => {
                for (cpu, min_freq) in self.get_freq(FreqKey::Min, cpus)? {
                    if freq < min_freq {
                        return Err(Error::BadOrder(format!(
                            "max CPU {cpu} frequency value of '{}' is less than the currently \
                             configured min frequency of {}",
                            hertz(freq),
                            hertz(min_freq)
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn set_freq(&mut self, freq: u64, key: FreqKey, cpus: &[u32]) -> Result<()> {
        let fname = key.feature();

        // Route the field back to per-CPU control where the package-level
        // MSR currently governs it.
        let pkg_control_cpus = match self.hwpreq()?.is_feature_enabled("pkg_control", Some(cpus)) {
            Ok(statuses) => statuses
                .into_iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(cpu, _)| cpu)
                .collect::<Vec<u32>>(),
            Err(err) if err.is_not_supported() => Vec::new(),
            Err(err) => return Err(err),
        };
        if !pkg_control_cpus.is_empty() {
            let valid_fname = format!("{fname}_valid");
            self.hwpreq()?.write_feature(
                &valid_fname,
                &FeatureValue::Str("on".to_string()),
                Some(&pkg_control_cpus),
            )?;
        }

        self.validate_freq(freq, key, cpus)?;

        // Group CPUs by the computed performance level so each level is
        // written with one multi-CPU operation.
        let mut groups: Vec<(u64, Vec<u32>)> = Vec::new();
        for (cpu, bclk) in self.get_bclks(cpus)? {
            let perf = self.freq_to_perf(cpu, freq, bclk);
            match groups.iter_mut().find(|(val, _)| *val == perf) {
                Some((_, group)) => group.push(cpu),
                None => groups.push((perf, vec![cpu])),
            }
        }

        for (perf, group) in groups {
            self.hwpreq()?
                .write_feature(fname, &FeatureValue::Int(perf), Some(&group))?;
        }
        Ok(())
    }

    /// Set the minimum frequency, Hz. Fails `OutOfRange` outside
    /// [min. operating frequency, max. turbo frequency] and `BadOrder` when
    /// above the currently configured maximum.
    pub fn set_min_freq(&mut self, freq: u64, cpus: &[u32]) -> Result<()> {
        self.set_freq(freq, FreqKey::Min, cpus)
    }

    /// Set the maximum frequency, Hz.
    pub fn set_max_freq(&mut self, freq: u64, cpus: &[u32]) -> Result<()> {
        self.set_freq(freq, FreqKey::Max, cpus)
    }
}
