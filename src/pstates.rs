// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The P-states property orchestrator.
//!
//! Each property (min_freq, governor, epp, ...) names the mechanisms that
//! can serve it, in order of preference: "sysfs" (cpufreq files), "msr"
//! (direct register access), "cppc" (ACPI CPPC files), or "doc"
//! (documented architectural constants). A mechanism that is missing on
//! the platform answers `NotSupported` and the next one is tried;
//! `TryAnotherMechanism` forces an explicit rotation. Frequencies are
//! always hertz at this layer.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use base::fmt::hertz;
use base::CpuInfo;
use base::Error;
use base::Executor;
use base::Result;
use base::Scope;
use base::SysfsIo;
use cpufreq::CppcSysfs;
use cpufreq::CpuFreqMsr;
use cpufreq::CpuFreqSysfs;
use cpufreq::HwpMsr;
use cpufreq::IntelPstateMode;
use log::debug;
use msr::regs;
use msr::FeatureValue;
use msr::FeaturedMsr;
use msr::MsrEngine;

const SYSFS_BASE: &str = "/sys/devices/system/cpu";

/// A property access mechanism.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mechanism {
    Sysfs,
    Msr,
    Cppc,
    Doc,
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Sysfs => "sysfs",
            Mechanism::Msr => "msr",
            Mechanism::Cppc => "cppc",
            Mechanism::Doc => "doc",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Int(u64),
    Bool(bool),
    Str(String),
    IntList(Vec<u64>),
    StrList(Vec<String>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(val) => write!(f, "{val}"),
            PropertyValue::Bool(val) => write!(f, "{val}"),
            PropertyValue::Str(val) => f.write_str(val),
            PropertyValue::IntList(vals) => {
                let text: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
                f.write_str(&text.join(", "))
            }
            PropertyValue::StrList(vals) => f.write_str(&vals.join(", ")),
        }
    }
}

/// Static description of one property.
#[derive(Clone, Copy, Debug)]
pub struct PropertyDef {
    pub pname: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub sname: Scope,
    pub mnames: &'static [Mechanism],
    pub writable: bool,
}

const PROPS: &[PropertyDef] = &[
    PropertyDef {
        pname: "min_freq",
        name: "Min. CPU frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        writable: true,
    },
    PropertyDef {
        pname: "max_freq",
        name: "Max. CPU frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        writable: true,
    },
    PropertyDef {
        pname: "min_freq_limit",
        name: "Min. supported CPU frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "max_freq_limit",
        name: "Max. supported CPU frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "base_freq",
        name: "Base CPU frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Cppc, Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "min_oper_freq",
        name: "Min. CPU operating frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "max_eff_freq",
        name: "Max. CPU efficiency frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "max_turbo_freq",
        name: "Max. CPU turbo frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "frequencies",
        name: "Acceptable CPU frequencies",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Doc],
        writable: false,
    },
    PropertyDef {
        pname: "bus_clock",
        name: "Bus clock speed",
        unit: Some("Hz"),
        sname: Scope::Package,
        mnames: &[Mechanism::Msr, Mechanism::Doc],
        writable: false,
    },
    PropertyDef {
        pname: "turbo",
        name: "Turbo",
        unit: None,
        sname: Scope::Package,
        mnames: &[Mechanism::Sysfs],
        writable: true,
    },
    PropertyDef {
        pname: "driver",
        name: "CPU frequency driver",
        unit: None,
        sname: Scope::Package,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "intel_pstate_mode",
        name: "Operation mode of 'intel_pstate' driver",
        unit: None,
        sname: Scope::Package,
        mnames: &[Mechanism::Sysfs],
        writable: true,
    },
    PropertyDef {
        pname: "governor",
        name: "CPU frequency governor",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: true,
    },
    PropertyDef {
        pname: "governors",
        name: "Available CPU frequency governors",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "epp",
        name: "EPP",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        writable: true,
    },
    PropertyDef {
        pname: "epb",
        name: "EPB",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs, Mechanism::Msr],
        writable: true,
    },
    PropertyDef {
        pname: "hwp",
        name: "Hardware power management",
        unit: None,
        sname: Scope::Package,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "cppc_lowest_perf",
        name: "Lowest CPPC performance",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "cppc_lowest_nonlinear_perf",
        name: "Lowest non-linear CPPC performance",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "cppc_nominal_perf",
        name: "Nominal CPPC performance",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "cppc_highest_perf",
        name: "Highest CPPC performance",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "cppc_nominal_freq",
        name: "Nominal CPPC frequency",
        unit: Some("Hz"),
        sname: Scope::Cpu,
        mnames: &[Mechanism::Sysfs],
        writable: false,
    },
    PropertyDef {
        pname: "hwp_lowest_perf",
        name: "Lowest HWP performance level",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "hwp_efficient_perf",
        name: "Most efficient HWP performance level",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "hwp_guaranteed_perf",
        name: "Guaranteed HWP performance level",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
    PropertyDef {
        pname: "hwp_highest_perf",
        name: "Highest HWP performance level",
        unit: None,
        sname: Scope::Cpu,
        mnames: &[Mechanism::Msr],
        writable: false,
    },
];

/// The P-states orchestrator: resolves `(property, CPUs)` requests to a
/// mechanism and dispatches to the frequency controllers, the featured
/// MSRs, or plain sysfs nodes.
pub struct PStates {
    cpuinfo: Rc<CpuInfo>,
    sysfs_io: Rc<RefCell<SysfsIo>>,
    msr: Rc<RefCell<MsrEngine>>,
    cpufreq_sysfs: Option<CpuFreqSysfs>,
    cppc: Option<CppcSysfs>,
    cpufreq_msr: Option<CpuFreqMsr>,
    hwp_msr: Option<HwpMsr>,
    hwpreq: Option<FeaturedMsr>,
    epb_msr: Option<FeaturedMsr>,
}

impl PStates {
    pub fn new(cpuinfo: Rc<CpuInfo>, exec: Rc<dyn Executor>, enable_cache: bool) -> PStates {
        let sysfs_io = Rc::new(RefCell::new(SysfsIo::new(exec.clone(), enable_cache)));
        let msr = Rc::new(RefCell::new(MsrEngine::new(
            cpuinfo.clone(),
            exec,
            enable_cache,
        )));
        PStates {
            cpuinfo,
            sysfs_io,
            msr,
            cpufreq_sysfs: None,
            cppc: None,
            cpufreq_msr: None,
            hwp_msr: None,
            hwpreq: None,
            epb_msr: None,
        }
    }

    /// The property table.
    pub fn props() -> &'static [PropertyDef] {
        PROPS
    }

    /// The definition of one property.
    pub fn prop(pname: &str) -> Result<&'static PropertyDef> {
        PROPS.iter().find(|prop| prop.pname == pname).ok_or_else(|| {
            let known: Vec<&str> = PROPS.iter().map(|prop| prop.pname).collect();
            Error::BadValue(format!(
                "unknown property '{pname}', known properties are: {}",
                known.join(", ")
            ))
        })
    }

    fn cpufreq_sysfs(&mut self) -> &mut CpuFreqSysfs {
        if self.cpufreq_sysfs.is_none() {
            self.cpufreq_sysfs = Some(CpuFreqSysfs::new(
                self.cpuinfo.clone(),
                self.sysfs_io.clone(),
                self.msr.clone(),
                true,
            ));
        }
        self.cpufreq_sysfs.as_mut().unwrap()
    }

    fn cppc(&mut self) -> &CppcSysfs {
        if self.cppc.is_none() {
            self.cppc = Some(CppcSysfs::new(self.sysfs_io.clone()));
        }
        self.cppc.as_ref().unwrap()
    }

    fn cpufreq_msr(&mut self) -> &mut CpuFreqMsr {
        if self.cpufreq_msr.is_none() {
            self.cpufreq_msr = Some(CpuFreqMsr::new(self.cpuinfo.clone(), self.msr.clone()));
        }
        self.cpufreq_msr.as_mut().unwrap()
    }

    fn hwp_msr(&mut self) -> &mut HwpMsr {
        if self.hwp_msr.is_none() {
            self.hwp_msr = Some(HwpMsr::new(self.cpuinfo.clone(), self.msr.clone()));
        }
        self.hwp_msr.as_mut().unwrap()
    }

    fn hwpreq(&mut self) -> Result<&FeaturedMsr> {
        if self.hwpreq.is_none() {
            self.hwpreq = Some(regs::hwp_request::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.hwpreq.as_ref().unwrap())
    }

    fn epb_msr(&mut self) -> Result<&FeaturedMsr> {
        if self.epb_msr.is_none() {
            self.epb_msr = Some(regs::energy_perf_bias::new(&self.cpuinfo, &self.msr)?);
        }
        Ok(self.epb_msr.as_ref().unwrap())
    }

    fn epp_sysfs_path(cpu: u32) -> PathBuf {
        PathBuf::from(SYSFS_BASE)
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
            .join("energy_performance_preference")
    }

    fn epb_sysfs_path(cpu: u32) -> PathBuf {
        PathBuf::from(SYSFS_BASE)
            .join(format!("cpu{cpu}"))
            .join("power")
            .join("energy_perf_bias")
    }

    fn ints(vals: Vec<(u32, u64)>) -> Vec<(u32, PropertyValue)> {
        vals.into_iter().map(|(cpu, val)| (cpu, PropertyValue::Int(val))).collect()
    }

    // Acceptable-frequency list for intel_pstate, which takes any multiple
    // of the bus clock between the current min and max limits.
    fn frequencies_doc(&mut self, cpus: &[u32]) -> Result<Vec<(u32, PropertyValue)>> {
        let drivers = self.cpufreq_sysfs().get_driver(cpus)?;
        for (_, driver) in &drivers {
            if driver != "intel_pstate" {
                return Err(Error::NotSupported(format!(
                    "unsupported driver '{driver}': only 'intel_pstate' was verified to accept \
                     any frequency value that is a multiple of bus clock"
                )));
            }
        }

        let min_freqs = self.get_prop_cpus("min_freq", Some(cpus), None)?;
        let max_freqs = self.get_prop_cpus("max_freq", Some(cpus), None)?;

        let mut result = Vec::with_capacity(cpus.len());
        for ((cpu, min_freq), (_, max_freq)) in min_freqs.into_iter().zip(max_freqs) {
            let (PropertyValue::Int(min_freq), PropertyValue::Int(max_freq)) = (min_freq, max_freq)
            else {
                return Err(Error::BadValue("BUG: non-integer frequency".to_string()));
            };
            let bclk = cpufreq::bclk::get_bclk(&self.cpuinfo, &self.msr, cpu)?;

            let mut freqs = Vec::new();
            let mut freq = min_freq;
            while freq <= max_freq {
                freqs.push(freq);
                freq += bclk;
            }
            result.push((cpu, PropertyValue::IntList(freqs)));
        }
        Ok(result)
    }

    fn bus_clock(&mut self, cpus: &[u32], mname: Mechanism) -> Result<Vec<(u32, PropertyValue)>> {
        match mname {
            Mechanism::Msr => {
                let fsbfreq = regs::fsb_freq::new(&self.cpuinfo, &self.msr)?;
                fsbfreq
                    .read_feature("fsb", Some(cpus))?
                    .into_iter()
                    .map(|(cpu, val)| match val {
                        FeatureValue::Float(mhz) => {
                            Ok((cpu, PropertyValue::Int((mhz * 1_000_000.0).round() as u64)))
                        }
                        other => Err(Error::BadValue(format!(
                            "unexpected bus clock value '{other}'"
                        ))),
                    })
                    .collect()
            }
            Mechanism::Doc => {
                match regs::fsb_freq::new(&self.cpuinfo, &self.msr) {
                    Ok(_) => Err(Error::TryAnotherMechanism(format!(
                        "use the 'msr' mechanism for {}",
                        self.cpuinfo.descr()
                    ))),
                    Err(err) if err.is_not_supported() => {
                        if !self.cpuinfo.is_intel() {
                            return Err(Error::NotSupported(format!(
                                "unsupported CPU model '{}'",
                                self.cpuinfo.descr()
                            )));
                        }
                        // Modern Intel platforms use a 100MHz bus clock.
                        Ok(cpus
                            .iter()
                            .map(|&cpu| (cpu, PropertyValue::Int(100_000_000)))
                            .collect())
                    }
                    Err(err) => Err(err),
                }
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property 'bus_clock'"
            ))),
        }
    }

    fn get_epp(&mut self, cpus: &[u32], mname: Mechanism) -> Result<Vec<(u32, PropertyValue)>> {
        match mname {
            Mechanism::Sysfs => {
                let mut result = Vec::with_capacity(cpus.len());
                for &cpu in cpus {
                    let val = self
                        .sysfs_io
                        .borrow_mut()
                        .read(&Self::epp_sysfs_path(cpu), "EPP")?;
                    result.push((cpu, PropertyValue::Str(val)));
                }
                Ok(result)
            }
            Mechanism::Msr => {
                let hwpreq = self.hwpreq()?;
                Ok(Self::ints(hwpreq.read_feature_int("epp", Some(cpus))?))
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property 'epp'"
            ))),
        }
    }

    fn get_epb(&mut self, cpus: &[u32], mname: Mechanism) -> Result<Vec<(u32, PropertyValue)>> {
        match mname {
            Mechanism::Sysfs => {
                let mut result = Vec::with_capacity(cpus.len());
                for &cpu in cpus {
                    let val = self
                        .sysfs_io
                        .borrow_mut()
                        .read_int(&Self::epb_sysfs_path(cpu), "EPB")?;
                    result.push((cpu, PropertyValue::Int(val)));
                }
                Ok(result)
            }
            Mechanism::Msr => {
                let epb = self.epb_msr()?;
                Ok(Self::ints(epb.read_feature_int("epb", Some(cpus))?))
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property 'epb'"
            ))),
        }
    }

    fn get_prop_mech(
        &mut self,
        pname: &str,
        cpus: &[u32],
        mname: Mechanism,
    ) -> Result<Vec<(u32, PropertyValue)>> {
        debug!("getting property '{pname}' using mechanism '{mname}'");

        match (pname, mname) {
            ("min_freq", Mechanism::Sysfs) => Ok(Self::ints(self.cpufreq_sysfs().get_min_freq(cpus)?)),
            ("min_freq", Mechanism::Msr) => Ok(Self::ints(self.cpufreq_msr().get_min_freq(cpus)?)),
            ("max_freq", Mechanism::Sysfs) => Ok(Self::ints(self.cpufreq_sysfs().get_max_freq(cpus)?)),
            ("max_freq", Mechanism::Msr) => Ok(Self::ints(self.cpufreq_msr().get_max_freq(cpus)?)),
            ("min_freq_limit", Mechanism::Sysfs) => {
                Ok(Self::ints(self.cpufreq_sysfs().get_min_freq_limit(cpus)?))
            }
            ("max_freq_limit", Mechanism::Sysfs) => {
                Ok(Self::ints(self.cpufreq_sysfs().get_max_freq_limit(cpus)?))
            }
            ("base_freq", Mechanism::Sysfs) => Ok(Self::ints(self.cpufreq_sysfs().get_base_freq(cpus)?)),
            ("base_freq", Mechanism::Cppc) => Ok(Self::ints(self.cppc().get_base_freq(cpus)?)),
            ("base_freq", Mechanism::Msr) => Ok(Self::ints(self.cpufreq_msr().get_base_freq(cpus)?)),
            ("min_oper_freq", Mechanism::Msr) => {
                Ok(Self::ints(self.cpufreq_msr().get_min_oper_freq(cpus)?))
            }
            ("max_eff_freq", Mechanism::Msr) => {
                Ok(Self::ints(self.cpufreq_msr().get_max_eff_freq(cpus)?))
            }
            ("max_turbo_freq", Mechanism::Msr) => {
                Ok(Self::ints(self.cpufreq_msr().get_max_turbo_freq(cpus)?))
            }
            ("frequencies", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_available_frequencies(cpus)?
                .into_iter()
                .map(|(cpu, freqs)| (cpu, PropertyValue::IntList(freqs)))
                .collect()),
            ("frequencies", Mechanism::Doc) => self.frequencies_doc(cpus),
            ("bus_clock", _) => self.bus_clock(cpus, mname),
            ("turbo", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_turbo(cpus)?
                .into_iter()
                .map(|(cpu, enabled)| (cpu, PropertyValue::Bool(enabled)))
                .collect()),
            ("driver", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_driver(cpus)?
                .into_iter()
                .map(|(cpu, name)| (cpu, PropertyValue::Str(name)))
                .collect()),
            ("intel_pstate_mode", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_intel_pstate_mode(cpus)?
                .into_iter()
                .map(|(cpu, mode)| (cpu, PropertyValue::Str(mode.name().to_string())))
                .collect()),
            ("governor", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_governor(cpus)?
                .into_iter()
                .map(|(cpu, name)| (cpu, PropertyValue::Str(name)))
                .collect()),
            ("governors", Mechanism::Sysfs) => Ok(self
                .cpufreq_sysfs()
                .get_available_governors(cpus)?
                .into_iter()
                .map(|(cpu, names)| (cpu, PropertyValue::StrList(names)))
                .collect()),
            ("epp", _) => self.get_epp(cpus, mname),
            ("epb", _) => self.get_epb(cpus, mname),
            ("hwp", Mechanism::Msr) => Ok(self
                .hwp_msr()
                .get_hwp(cpus)?
                .into_iter()
                .map(|(cpu, enabled)| (cpu, PropertyValue::Bool(enabled)))
                .collect()),
            ("cppc_lowest_perf", Mechanism::Sysfs) => Ok(Self::ints(self.cppc().get_lowest_perf(cpus)?)),
            ("cppc_lowest_nonlinear_perf", Mechanism::Sysfs) => {
                Ok(Self::ints(self.cppc().get_lowest_nonlinear_perf(cpus)?))
            }
            ("cppc_nominal_perf", Mechanism::Sysfs) => Ok(Self::ints(self.cppc().get_base_perf(cpus)?)),
            ("cppc_highest_perf", Mechanism::Sysfs) => {
                Ok(Self::ints(self.cppc().get_highest_perf(cpus)?))
            }
            ("cppc_nominal_freq", Mechanism::Sysfs) => Ok(Self::ints(self.cppc().get_base_freq(cpus)?)),
            ("hwp_lowest_perf", Mechanism::Msr) => Ok(Self::ints(self.hwp_msr().get_lowest_perf(cpus)?)),
            ("hwp_efficient_perf", Mechanism::Msr) => {
                Ok(Self::ints(self.hwp_msr().get_efficient_perf(cpus)?))
            }
            ("hwp_guaranteed_perf", Mechanism::Msr) => {
                Ok(Self::ints(self.hwp_msr().get_guaranteed_perf(cpus)?))
            }
            ("hwp_highest_perf", Mechanism::Msr) => {
                Ok(Self::ints(self.hwp_msr().get_highest_perf(cpus)?))
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property '{pname}'"
            ))),
        }
    }

    fn resolve_mnames(
        prop: &PropertyDef,
        mnames: Option<&[Mechanism]>,
    ) -> Result<Vec<Mechanism>> {
        match mnames {
            None => Ok(prop.mnames.to_vec()),
            Some(mnames) => {
                for mname in mnames {
                    if !prop.mnames.contains(mname) {
                        return Err(Error::BadValue(format!(
                            "mechanism '{mname}' is not supported for property '{}', supported \
                             mechanisms are: {}",
                            prop.pname,
                            prop.mnames
                                .iter()
                                .map(|m| m.name())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )));
                    }
                }
                Ok(mnames.to_vec())
            }
        }
    }

    /// Read a property on the given CPUs (all CPUs when `None`), trying
    /// the mechanisms in `mnames` order (the property's default preference
    /// when `None`).
    pub fn get_prop_cpus(
        &mut self,
        pname: &str,
        cpus: Option<&[u32]>,
        mnames: Option<&[Mechanism]>,
    ) -> Result<Vec<(u32, PropertyValue)>> {
        let prop = Self::prop(pname)?;
        let mnames = Self::resolve_mnames(prop, mnames)?;
        let cpus = self.cpuinfo.normalize_cpus(cpus)?;

        let mut last_err: Option<Error> = None;
        for mname in mnames {
            match self.get_prop_mech(pname, &cpus, mname) {
                Ok(result) => return Ok(result),
                Err(err)
                    if err.is_not_supported() || matches!(err, Error::TryAnotherMechanism(_)) =>
                {
                    debug!("mechanism '{mname}' cannot serve property '{pname}': {err}");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        match last_err {
            Some(Error::TryAnotherMechanism(msg)) => Err(Error::NotSupported(msg)),
            Some(err) => Err(err),
            None => Err(Error::NotSupported(format!(
                "no mechanism can provide property '{pname}'"
            ))),
        }
    }

    /// Read a property on one CPU.
    pub fn get_cpu_prop(&mut self, pname: &str, cpu: u32) -> Result<PropertyValue> {
        Ok(self.get_prop_cpus(pname, Some(&[cpu]), None)?.remove(0).1)
    }

    // Resolve the special frequency values "min", "max" and "base" to
    // hertz.
    fn numeric_freq(&mut self, val: &PropertyValue, cpu: u32) -> Result<u64> {
        let text = match val {
            PropertyValue::Int(freq) => return Ok(*freq),
            PropertyValue::Str(text) => text.as_str(),
            other => {
                return Err(Error::BadValue(format!(
                    "bad frequency value '{other}': expected hertz or one of: min, max, base"
                )))
            }
        };

        let pname = match text {
            "min" => "min_freq_limit",
            "max" => "max_freq_limit",
            "base" | "hfm" => "base_freq",
            _ => {
                return text.parse::<u64>().map_err(|_| {
                    Error::BadValue(format!(
                        "bad frequency value '{text}': expected hertz or one of: min, max, base"
                    ))
                })
            }
        };

        match self.get_prop_cpus(pname, Some(&[cpu]), Some(&[Mechanism::Sysfs]))?.remove(0).1 {
            PropertyValue::Int(freq) => Ok(freq),
            other => Err(Error::BadValue(format!("BUG: non-integer '{pname}': {other}"))),
        }
    }

    /// A sysfs frequency write failed read-back verification: explain why
    /// when possible. The driver may only accept values from a fixed list,
    /// or the requested value may exceed the base frequency while turbo is
    /// off.
    fn enrich_freq_verify_error(&mut self, err: Error) -> Error {
        let Error::VerifyFailed {
            msg,
            cpu: Some(cpu),
            expected,
            actual,
            path,
        } = err
        else {
            return err;
        };

        let mut msg = msg;

        if let Ok(mut vals) = self.get_prop_cpus("frequencies", Some(&[cpu]), None) {
            if let PropertyValue::IntList(frequencies) = vals.remove(0).1 {
                if !frequencies.contains(&expected) && frequencies.contains(&actual) {
                    let fvals: Vec<String> = frequencies.iter().map(|freq| hertz(*freq)).collect();
                    msg = format!(
                        "{msg}.\n  Linux kernel CPU frequency driver does not support {}, \
                         use one of the following values instead:\n  {}",
                        hertz(expected),
                        fvals.join(", ")
                    );
                }
            }
        }

        if let Ok(PropertyValue::Bool(false)) = self.get_cpu_prop("turbo", cpu) {
            if let Ok(PropertyValue::Int(base_freq)) = self.get_cpu_prop("base_freq", cpu) {
                if expected > base_freq {
                    msg = format!(
                        "{msg}.\n  Hint: turbo is disabled, base frequency is {}, and this may \
                         be the limiting factor",
                        hertz(base_freq)
                    );
                }
            }
        }

        Error::VerifyFailed {
            msg,
            cpu: Some(cpu),
            expected,
            actual,
            path,
        }
    }

    fn set_freq(
        &mut self,
        pname: &str,
        val: &PropertyValue,
        cpus: &[u32],
        mname: Mechanism,
    ) -> Result<()> {
        // Group CPUs by the resolved frequency so each value is written
        // once per group.
        let mut groups: Vec<(u64, Vec<u32>)> = Vec::new();
        for &cpu in cpus {
            let freq = self.numeric_freq(val, cpu)?;
            match groups.iter_mut().find(|(f, _)| *f == freq) {
                Some((_, group)) => group.push(cpu),
                None => groups.push((freq, vec![cpu])),
            }
        }

        for (freq, group) in groups {
            let result = match (pname, mname) {
                ("min_freq", Mechanism::Sysfs) => self.cpufreq_sysfs().set_min_freq(freq, &group),
                ("max_freq", Mechanism::Sysfs) => self.cpufreq_sysfs().set_max_freq(freq, &group),
                ("min_freq", Mechanism::Msr) => self.cpufreq_msr().set_min_freq(freq, &group),
                ("max_freq", Mechanism::Msr) => self.cpufreq_msr().set_max_freq(freq, &group),
                _ => Err(Error::BadValue(format!(
                    "BUG: unexpected mechanism '{mname}' for property '{pname}'"
                ))),
            };

            if let Err(err) = result {
                if matches!(err, Error::VerifyFailed { .. }) {
                    return Err(self.enrich_freq_verify_error(err));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// An EPP write was refused: on intel_pstate in active mode with the
    /// performance governor the kernel pins EPP to 0 and rejects anything
    /// else. Return the tailored explanation when that is the case.
    fn explain_epp_set_error(&mut self, val: &str, cpu: u32, err: &Error) -> Option<String> {
        if val == "0" || val == "performance" {
            return None;
        }

        let driver = self.get_cpu_prop("driver", cpu).ok()?;
        if driver != PropertyValue::Str("intel_pstate".to_string()) {
            return None;
        }
        let mode = self.get_cpu_prop("intel_pstate_mode", cpu).ok()?;
        if mode != PropertyValue::Str("active".to_string()) {
            return None;
        }
        let governor = self.get_cpu_prop("governor", cpu).ok()?;
        if governor != PropertyValue::Str("performance".to_string()) {
            return None;
        }

        Some(format!(
            "{err}\nThe 'performance' governor of the 'intel_pstate' driver sets EPP to 0 \
             (performance) and does not allow for changing it."
        ))
    }

    fn set_epp(&mut self, val: &PropertyValue, cpus: &[u32], mname: Mechanism) -> Result<()> {
        match mname {
            Mechanism::Sysfs => {
                let text = val.to_string();
                for &cpu in cpus {
                    let path = Self::epp_sysfs_path(cpu);
                    let result = self.sysfs_io.borrow_mut().write(&path, &text, "EPP");
                    if let Err(err) = result {
                        if err.is_not_supported() {
                            return Err(err);
                        }
                        match self.explain_epp_set_error(&text, cpu, &err) {
                            Some(msg) => return Err(err.with_msg(msg)),
                            None => return Err(err),
                        }
                    }
                }
                Ok(())
            }
            Mechanism::Msr => {
                let raw = match val {
                    PropertyValue::Int(raw) => *raw,
                    PropertyValue::Str(text) => text.parse::<u64>().map_err(|_| {
                        Error::BadValue(format!(
                            "bad EPP value '{text}': the 'msr' mechanism takes integers 0-255"
                        ))
                    })?,
                    other => {
                        return Err(Error::BadValue(format!("bad EPP value '{other}'")));
                    }
                };
                let hwpreq = self.hwpreq()?;
                hwpreq.write_feature("epp", &FeatureValue::Int(raw), Some(cpus))
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property 'epp'"
            ))),
        }
    }

    fn set_epb(&mut self, val: &PropertyValue, cpus: &[u32], mname: Mechanism) -> Result<()> {
        let raw = match val {
            PropertyValue::Int(raw) => *raw,
            PropertyValue::Str(text) => text.parse::<u64>().map_err(|_| {
                Error::BadValue(format!("bad EPB value '{text}': expected an integer 0-15"))
            })?,
            other => return Err(Error::BadValue(format!("bad EPB value '{other}'"))),
        };
        if raw > 15 {
            return Err(Error::BadValue(format!(
                "bad EPB value '{raw}': should be within [0, 15]"
            )));
        }

        match mname {
            Mechanism::Sysfs => {
                for &cpu in cpus {
                    let path = Self::epb_sysfs_path(cpu);
                    self.sysfs_io.borrow_mut().write_int(&path, raw, "EPB")?;
                }
                Ok(())
            }
            Mechanism::Msr => {
                let epb = self.epb_msr()?;
                epb.write_feature("epb", &FeatureValue::Int(raw), Some(cpus))
            }
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property 'epb'"
            ))),
        }
    }

    fn set_prop_mech(
        &mut self,
        pname: &str,
        val: &PropertyValue,
        cpus: &[u32],
        mname: Mechanism,
    ) -> Result<()> {
        debug!("setting property '{pname}' to '{val}' using mechanism '{mname}'");

        match (pname, mname) {
            ("min_freq" | "max_freq", _) => self.set_freq(pname, val, cpus, mname),
            ("turbo", Mechanism::Sysfs) => {
                let PropertyValue::Bool(enable) = val else {
                    return Err(Error::BadValue(format!(
                        "bad turbo value '{val}': expected a boolean"
                    )));
                };
                self.cpufreq_sysfs().set_turbo(*enable, cpus)
            }
            ("intel_pstate_mode", Mechanism::Sysfs) => {
                let PropertyValue::Str(mode) = val else {
                    return Err(Error::BadValue(format!(
                        "bad 'intel_pstate' mode value '{val}'"
                    )));
                };
                let mode = IntelPstateMode::from_str(mode)?;
                self.cpufreq_sysfs().set_intel_pstate_mode(mode, cpus)
            }
            ("governor", Mechanism::Sysfs) => {
                let PropertyValue::Str(governor) = val else {
                    return Err(Error::BadValue(format!("bad governor value '{val}'")));
                };
                let governor = governor.clone();
                self.cpufreq_sysfs().set_governor(&governor, cpus)
            }
            ("epp", _) => self.set_epp(val, cpus, mname),
            ("epb", _) => self.set_epb(val, cpus, mname),
            _ => Err(Error::BadValue(format!(
                "BUG: unexpected mechanism '{mname}' for property '{pname}'"
            ))),
        }
    }

    /// Write a property on the given CPUs, trying the mechanisms in order.
    pub fn set_prop_cpus(
        &mut self,
        pname: &str,
        val: &PropertyValue,
        cpus: Option<&[u32]>,
        mnames: Option<&[Mechanism]>,
    ) -> Result<()> {
        let prop = Self::prop(pname)?;
        if !prop.writable {
            return Err(Error::PermissionDenied(format!(
                "property '{pname}' ({}) is read-only",
                prop.name
            )));
        }
        let mnames = Self::resolve_mnames(prop, mnames)?;
        let cpus = self.cpuinfo.normalize_cpus(cpus)?;

        let mut last_err: Option<Error> = None;
        for mname in mnames {
            match self.set_prop_mech(pname, val, &cpus, mname) {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.is_not_supported() || matches!(err, Error::TryAnotherMechanism(_)) =>
                {
                    debug!("mechanism '{mname}' cannot set property '{pname}': {err}");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        match last_err {
            Some(Error::TryAnotherMechanism(msg)) => Err(Error::NotSupported(msg)),
            Some(err) => Err(err),
            None => Err(Error::NotSupported(format!(
                "no mechanism can set property '{pname}'"
            ))),
        }
    }

    /// Write a property on one CPU.
    pub fn set_cpu_prop(&mut self, pname: &str, val: &PropertyValue, cpu: u32) -> Result<()> {
        self.set_prop_cpus(pname, val, Some(&[cpu]), None)
    }
}
