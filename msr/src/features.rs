// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The "featured MSR" layer: declarative per-register feature tables giving
//! named, type-checked access to MSR bit fields.
//!
//! A feature covers one bit range of one MSR, optionally with an enumerated
//! value set, a supported-platform list (VFMs), and a required CPU-flag set.
//! Per-CPU support masks are computed when the table is instantiated, so
//! reads and writes can be validated before any hardware I/O happens.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Error;
use base::Result;
use base::Scope;

use crate::engine::bits_max;
use crate::MsrEngine;

/// The type of a feature value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeatureType {
    Int,
    Float,
    Bool,
    Str,
}

/// A feature value as surfaced to the user. Boolean features read back as
/// `Str("on")`/`Str("off")`; the predicate APIs additionally map those to
/// `bool`.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Int(u64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Int(val) => write!(f, "{val}"),
            FeatureValue::Float(val) => write!(f, "{val}"),
            FeatureValue::Bool(val) => write!(f, "{val}"),
            FeatureValue::Str(val) => f.write_str(val),
        }
    }
}

impl From<u64> for FeatureValue {
    fn from(val: u64) -> FeatureValue {
        FeatureValue::Int(val)
    }
}

impl From<bool> for FeatureValue {
    fn from(val: bool) -> FeatureValue {
        FeatureValue::Bool(val)
    }
}

impl From<&str> for FeatureValue {
    fn from(val: &str) -> FeatureValue {
        FeatureValue::Str(val.to_string())
    }
}

/// Computed read hooks for features whose value is derived from the raw
/// bits rather than being the raw bits (the static-schema rendition of the
/// original per-method overrides).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeatureHook {
    None,
    /// RAPL unit features: `1 / 2^bits`, except the Silvermont energy
    /// units, which are `2^bits / 1_000_000`.
    RaplUnits,
}

/// One feature of an MSR. Instances are built by the `regs` modules, with
/// platform-dependent fields (scope, bits, value tables) resolved for the
/// target CPU.
#[derive(Clone, Debug)]
pub struct FeatureDef {
    /// Short key, e.g. "max_perf".
    pub fname: &'static str,
    /// Human name, e.g. "Max. CPU performance".
    pub name: &'static str,
    pub help: &'static str,
    pub ftype: FeatureType,
    /// Functional scope.
    pub sname: Scope,
    /// I/O scope: where the bits actually live. Same as `sname` on most
    /// platforms.
    pub iosname: Scope,
    pub bits: Option<(u32, u32)>,
    pub writable: bool,
    /// `/proc/cpuinfo` flags every covered CPU must expose. Empty: no flag
    /// requirement.
    pub cpuflags: &'static [&'static str],
    /// VFMs the feature exists on. Empty: no platform restriction.
    pub vfms: Vec<u32>,
    /// Enumerated values: user symbol -> raw bits. Order is preserved for
    /// error messages.
    pub vals: Vec<(&'static str, u64)>,
    /// Enumerated float values (e.g. bus-clock codes): value -> raw bits.
    pub fvals: Vec<(f64, u64)>,
    pub hook: FeatureHook,
}

impl FeatureDef {
    /// A defaulted definition to be customized with struct update syntax.
    pub fn base(fname: &'static str, name: &'static str, help: &'static str) -> FeatureDef {
        FeatureDef {
            fname,
            name,
            help,
            ftype: FeatureType::Int,
            sname: Scope::Cpu,
            iosname: Scope::Cpu,
            bits: None,
            writable: true,
            cpuflags: &[],
            vfms: Vec::new(),
            vals: Vec::new(),
            fvals: Vec::new(),
            hook: FeatureHook::None,
        }
    }
}

struct Feature {
    def: FeatureDef,
    supported: HashMap<u32, bool>,
    rvals: HashMap<u64, FeatureValue>,
    vals_nocase: HashMap<String, u64>,
}

/// On Cascade Lake-AP, which packages two Cascade Lake-SP dies, most MSRs
/// that are package-scoped elsewhere behave as die-scoped. Returns the
/// adjusted scope for such MSRs.
pub fn clx_ap_adjusted_scope(cpuinfo: &CpuInfo) -> Scope {
    if cpuinfo.vfm() == cpumodel::SKYLAKE_X {
        if let Ok(dies) = cpuinfo.package_dies(cpuinfo.packages()[0]) {
            if dies.len() > 1 {
                return Scope::Die;
            }
        }
    }
    Scope::Package
}

/// A featured MSR: the feature table plus the engine handle to act on it.
pub struct FeaturedMsr {
    regaddr: u32,
    regname: &'static str,
    cpuinfo: Rc<CpuInfo>,
    msr: Rc<RefCell<MsrEngine>>,
    features: Vec<Feature>,
    index: HashMap<&'static str, usize>,
}

impl FeaturedMsr {
    /// Build the feature table for `regaddr`, computing per-CPU support
    /// from the VFM and CPU-flag requirements. Fails `NotSupported` when
    /// the vendor is not Intel or no feature is supported on any CPU.
    pub fn new(
        regaddr: u32,
        regname: &'static str,
        defs: Vec<FeatureDef>,
        cpuinfo: Rc<CpuInfo>,
        msr: Rc<RefCell<MsrEngine>>,
    ) -> Result<FeaturedMsr> {
        if !cpuinfo.is_intel() {
            return Err(Error::NotSupported(format!(
                "unsupported MSR {:#x} ({}): it is only available on Intel CPUs",
                regaddr, regname
            )));
        }

        let vfm = cpuinfo.vfm();
        let mut any_supported = false;
        let mut features = Vec::with_capacity(defs.len());
        let mut index = HashMap::new();

        for def in defs {
            let mut supported = HashMap::new();

            let vfm_ok = def.vfms.is_empty() || def.vfms.contains(&vfm);
            for &cpu in cpuinfo.cpus() {
                let cpu_ok = vfm_ok
                    && (def.cpuflags.is_empty()
                        || cpuinfo
                            .cpu_flags(cpu)
                            .map(|flags| def.cpuflags.iter().all(|f| flags.contains(*f)))
                            .unwrap_or(false));
                supported.insert(cpu, cpu_ok);
                any_supported |= cpu_ok;
            }

            let mut rvals = HashMap::new();
            let mut vals_nocase = HashMap::new();
            for (symbol, code) in &def.vals {
                rvals.insert(*code, FeatureValue::Str(symbol.to_string()));
                if matches!(def.ftype, FeatureType::Bool | FeatureType::Str) {
                    vals_nocase.insert(symbol.to_lowercase(), *code);
                }
            }
            for (value, code) in &def.fvals {
                rvals.insert(*code, FeatureValue::Float(*value));
            }

            index.insert(def.fname, features.len());
            features.push(Feature {
                def,
                supported,
                rvals,
                vals_nocase,
            });
        }

        if !any_supported {
            return Err(Error::NotSupported(format!(
                "MSR {:#x} ({}) is not supported{} ({})",
                regaddr,
                regname,
                msr.borrow().executor().hostmsg(),
                cpuinfo.descr()
            )));
        }

        Ok(FeaturedMsr {
            regaddr,
            regname,
            cpuinfo,
            msr,
            features,
            index,
        })
    }

    pub fn regaddr(&self) -> u32 {
        self.regaddr
    }

    pub fn regname(&self) -> &'static str {
        self.regname
    }

    pub fn cpuinfo(&self) -> &Rc<CpuInfo> {
        &self.cpuinfo
    }

    pub fn feature_names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.def.fname).collect()
    }

    fn feature(&self, fname: &str) -> Result<&Feature> {
        match self.index.get(fname) {
            Some(&idx) => Ok(&self.features[idx]),
            None => {
                let known = self.feature_names().join(", ");
                Err(Error::BadValue(format!(
                    "unknown feature '{fname}', known features are: {known}"
                )))
            }
        }
    }

    /// The feature definition, for callers that need scope or bit
    /// information.
    pub fn feature_def(&self, fname: &str) -> Result<&FeatureDef> {
        Ok(&self.feature(fname)?.def)
    }

    /// Mark `cpus` as not supporting `fname`. Used by register constructors
    /// that refine support beyond the VFM/flag computation (e.g. HWP-gated
    /// registers when HWP is disabled).
    pub fn mark_unsupported(&mut self, fname: &str, cpus: &[u32]) -> Result<()> {
        let idx = *self.index.get(fname).ok_or_else(|| {
            Error::BadValue(format!("unknown feature '{fname}'"))
        })?;
        for &cpu in cpus {
            self.features[idx].supported.insert(cpu, false);
        }
        Ok(())
    }

    /// A short description of where the feature lives, e.g.
    /// `"MSR_PLATFORM_INFO 0xce bits 55:48"`.
    pub fn msr_bits_str(&self, fname: &str) -> Result<String> {
        let feat = self.feature(fname)?;
        let bits_str = match feat.def.bits {
            Some((msb, lsb)) if msb == lsb => format!(" bit {msb}"),
            Some((msb, lsb)) => format!(" bits {msb}:{lsb}"),
            None => String::new(),
        };
        Ok(format!("{} {:#x}{}", self.regname, self.regaddr, bits_str))
    }

    /// Verify that every listed CPU supports `fname`; the error message
    /// names the CPUs that do and do not.
    pub fn validate_feature_supported(&self, fname: &str, cpus: Option<&[u32]>) -> Result<()> {
        let feat = self.feature(fname)?;
        let cpus = self.cpuinfo.normalize_cpus(cpus)?;

        let mut supported = Vec::new();
        let mut unsupported = Vec::new();
        for cpu in cpus {
            if *feat.supported.get(&cpu).unwrap_or(&false) {
                supported.push(cpu);
            } else {
                unsupported.push(cpu);
            }
        }

        if unsupported.is_empty() {
            return Ok(());
        }

        if supported.is_empty() {
            return Err(Error::NotSupported(format!(
                "{} is not supported on {}",
                feat.def.name,
                self.cpuinfo.descr()
            )));
        }

        Err(Error::NotSupported(format!(
            "{} is not supported on CPUs {}.\n{} supports {} only on the following CPUs: {}",
            feat.def.name,
            self.cpuinfo.cpus_str(&unsupported),
            self.cpuinfo.descr(),
            feat.def.name,
            self.cpuinfo.cpus_str(&supported)
        )))
    }

    pub fn is_feature_supported(&self, fname: &str, cpus: Option<&[u32]>) -> bool {
        self.validate_feature_supported(fname, cpus).is_ok()
    }

    pub fn is_cpu_feature_supported(&self, fname: &str, cpu: u32) -> bool {
        self.is_feature_supported(fname, Some(&[cpu]))
    }

    fn translate_raw(&self, feat: &Feature, raw: u64) -> Result<FeatureValue> {
        if feat.rvals.is_empty() {
            return Ok(FeatureValue::Int(raw));
        }
        feat.rvals.get(&raw).cloned().ok_or_else(|| {
            Error::BadValue(format!(
                "unexpected raw value {:#x} for feature '{}' of {}",
                raw, feat.def.fname, self.regname
            ))
        })
    }

    fn read_rapl_units(&self, feat: &Feature, cpus: Option<&[u32]>) -> Result<Vec<(u32, FeatureValue)>> {
        let bits = feat.def.bits.ok_or_else(|| {
            Error::BadValue(format!(
                "BUG: RAPL unit feature '{}' has no bit range",
                feat.def.fname
            ))
        })?;
        let silvermont = self.cpuinfo.vfm() == cpumodel::ATOM_SILVERMONT;
        let raws =
            self.msr
                .borrow_mut()
                .read_bits(self.regaddr, bits, cpus, feat.def.iosname)?;
        Ok(raws
            .into_iter()
            .map(|(cpu, raw)| {
                let val = if feat.def.fname == "energy_units" && silvermont {
                    (2f64).powi(raw as i32) / 1_000_000.0
                } else {
                    1.0 / (2f64).powi(raw as i32)
                };
                (cpu, FeatureValue::Float(val))
            })
            .collect())
    }

    /// Read a feature on the given CPUs, translating raw bits to user
    /// values.
    pub fn read_feature(&self, fname: &str, cpus: Option<&[u32]>) -> Result<Vec<(u32, FeatureValue)>> {
        self.validate_feature_supported(fname, cpus)?;
        let feat = self.feature(fname)?;

        match feat.def.hook {
            FeatureHook::RaplUnits => return self.read_rapl_units(feat, cpus),
            FeatureHook::None => {}
        }

        let bits = feat.def.bits.ok_or_else(|| {
            Error::BadValue(format!(
                "feature '{fname}' of {} has no bit range on this platform",
                self.regname
            ))
        })?;

        let raws =
            self.msr
                .borrow_mut()
                .read_bits(self.regaddr, bits, cpus, feat.def.iosname)?;
        raws.into_iter()
            .map(|(cpu, raw)| Ok((cpu, self.translate_raw(feat, raw)?)))
            .collect()
    }

    /// Read a feature on one CPU.
    pub fn read_cpu_feature(&self, fname: &str, cpu: u32) -> Result<FeatureValue> {
        Ok(self.read_feature(fname, Some(&[cpu]))?.remove(0).1)
    }

    /// Read an integer feature on the given CPUs.
    pub fn read_feature_int(&self, fname: &str, cpus: Option<&[u32]>) -> Result<Vec<(u32, u64)>> {
        self.read_feature(fname, cpus)?
            .into_iter()
            .map(|(cpu, val)| match val {
                FeatureValue::Int(val) => Ok((cpu, val)),
                other => Err(Error::BadValue(format!(
                    "feature '{fname}' of {} yielded non-integer value '{other}'",
                    self.regname
                ))),
            })
            .collect()
    }

    /// Check whether a boolean feature is enabled on the given CPUs.
    pub fn is_feature_enabled(&self, fname: &str, cpus: Option<&[u32]>) -> Result<Vec<(u32, bool)>> {
        self.validate_feature_supported(fname, cpus)?;
        let feat = self.feature(fname)?;
        if feat.def.ftype != FeatureType::Bool {
            return Err(Error::BadValue(format!(
                "feature '{fname}' is not boolean, use 'read_feature()' instead"
            )));
        }

        Ok(self
            .read_feature(fname, cpus)?
            .into_iter()
            .map(|(cpu, val)| {
                let enabled = matches!(&val, FeatureValue::Str(s) if s == "on" || s == "enabled");
                (cpu, enabled)
            })
            .collect())
    }

    pub fn is_cpu_feature_enabled(&self, fname: &str, cpu: u32) -> Result<bool> {
        Ok(self.is_feature_enabled(fname, Some(&[cpu]))?.remove(0).1)
    }

    fn normalize_value(&self, feat: &Feature, val: &FeatureValue) -> Result<u64> {
        if feat.def.vals.is_empty() && feat.def.fvals.is_empty() {
            let raw = match val {
                FeatureValue::Int(raw) => *raw,
                FeatureValue::Str(text) => text.trim().parse::<u64>().map_err(|_| {
                    Error::BadValue(format!(
                        "bad value '{text}' for the '{}' feature: expected an integer",
                        feat.def.name
                    ))
                })?,
                other => {
                    return Err(Error::BadValue(format!(
                        "bad value '{other}' for the '{}' feature: expected an integer",
                        feat.def.name
                    )))
                }
            };

            if let Some(bits) = feat.def.bits {
                if raw > bits_max(bits) {
                    return Err(Error::BadValue(format!(
                        "value {raw:#x} does not fit into {} ({})",
                        self.msr_bits_str(feat.def.fname)?,
                        feat.def.name
                    )));
                }
            }
            return Ok(raw);
        }

        // Enumerated feature: translate the symbol. Booleans additionally
        // accept true/false.
        let symbol = match val {
            FeatureValue::Bool(true) if feat.def.ftype == FeatureType::Bool => "on".to_string(),
            FeatureValue::Bool(false) if feat.def.ftype == FeatureType::Bool => "off".to_string(),
            other => other.to_string(),
        };

        for (known, code) in &feat.def.vals {
            if *known == symbol {
                return Ok(*code);
            }
        }
        if let Some(code) = feat.vals_nocase.get(&symbol.to_lowercase()) {
            return Ok(*code);
        }

        let known = feat
            .def
            .vals
            .iter()
            .map(|(symbol, _)| *symbol)
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::BadValue(format!(
            "bad value '{val}' for the '{}' feature, use one of: {known}",
            feat.def.name
        )))
    }

    /// Write a feature value on the given CPUs. Accepts a raw integer
    /// (validated against the bit width) or a known symbol (case-insensitive
    /// for string and boolean features).
    pub fn write_feature(&self, fname: &str, val: &FeatureValue, cpus: Option<&[u32]>) -> Result<()> {
        self.validate_feature_supported(fname, cpus)?;
        let feat = self.feature(fname)?;

        if !feat.def.writable {
            return Err(Error::PermissionDenied(format!(
                "feature '{}' can not be modified{}, it is read-only",
                feat.def.name,
                self.msr.borrow().executor().hostmsg()
            )));
        }

        let raw = self.normalize_value(feat, val)?;
        let bits = feat.def.bits.ok_or_else(|| {
            Error::BadValue(format!(
                "feature '{fname}' of {} has no bit range on this platform",
                self.regname
            ))
        })?;

        self.msr
            .borrow_mut()
            .write_bits(self.regaddr, bits, raw, cpus, feat.def.iosname, false)
    }

    pub fn write_cpu_feature(&self, fname: &str, val: &FeatureValue, cpu: u32) -> Result<()> {
        self.write_feature(fname, val, Some(&[cpu]))
    }

    /// Enable or disable a boolean feature. Accepts `true`/`false`,
    /// `"on"`/`"off"`, `"enable"`/`"disable"` (case-insensitive).
    pub fn enable_feature(&self, fname: &str, enable: &FeatureValue, cpus: Option<&[u32]>) -> Result<()> {
        self.validate_feature_supported(fname, cpus)?;
        let feat = self.feature(fname)?;
        if feat.def.ftype != FeatureType::Bool {
            return Err(Error::BadValue(format!(
                "feature '{}' is not boolean, use 'write_feature()' instead",
                feat.def.name
            )));
        }

        let symbol = match enable {
            FeatureValue::Bool(true) => "on",
            FeatureValue::Bool(false) => "off",
            FeatureValue::Str(text) => match text.to_lowercase().as_str() {
                "on" | "enable" => "on",
                "off" | "disable" => "off",
                _ => {
                    return Err(Error::BadValue(format!(
                        "bad value '{text}' for a boolean feature '{}', use: \
                         true/false, 'on'/'off', 'enable'/'disable'",
                        feat.def.name
                    )))
                }
            },
            other => {
                return Err(Error::BadValue(format!(
                    "bad value '{other}' for a boolean feature '{}', use: \
                     true/false, 'on'/'off', 'enable'/'disable'",
                    feat.def.name
                )))
            }
        };

        self.write_feature(fname, &FeatureValue::Str(symbol.to_string()), cpus)
    }

    pub fn enable_cpu_feature(&self, fname: &str, enable: &FeatureValue, cpu: u32) -> Result<()> {
        self.enable_feature(fname, enable, Some(&[cpu]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::testing;
    use base::EmulExecutor;
    use base::Executor;

    use crate::regs;

    fn setup(vfm: u32, flags: &[&str], hwp_on: bool) -> (Rc<CpuInfo>, Rc<RefCell<MsrEngine>>) {
        let exec = Rc::new(EmulExecutor::new());
        for cpu in 0..16u32 {
            exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
            if hwp_on {
                exec.write_bytes_at(
                    std::path::Path::new(&format!("/dev/cpu/{cpu}/msr")),
                    regs::pm_enable::MSR_PM_ENABLE as u64,
                    &1u64.to_le_bytes(),
                )
                .unwrap();
            }
        }
        let cpuinfo = Rc::new(testing::cpu_info_with_flags(vfm, flags));
        let msr = Rc::new(RefCell::new(MsrEngine::new(
            cpuinfo.clone(),
            exec as Rc<dyn Executor>,
            true,
        )));
        (cpuinfo, msr)
    }

    #[test]
    fn enum_round_trip_with_case_folding() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &[], false);
        let fmsr = regs::pkg_cstate_config::new(&cpuinfo, &msr).unwrap();

        fmsr.write_cpu_feature("pkg_cstate_limit", &FeatureValue::from("pc6"), 0)
            .unwrap();
        assert_eq!(
            fmsr.read_cpu_feature("pkg_cstate_limit", 0).unwrap(),
            FeatureValue::Str("PC6".to_string())
        );

        // Raw code 2 maps back to PC6 on Granite Rapids.
        let raw = msr
            .borrow_mut()
            .read_cpu_bits(regs::pkg_cstate_config::MSR_PKG_CST_CONFIG_CONTROL, (2, 0), 0, Scope::Cpu)
            .unwrap();
        assert_eq!(raw, 2);
    }

    #[test]
    fn unknown_symbol_lists_accepted_values() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &[], false);
        let fmsr = regs::pkg_cstate_config::new(&cpuinfo, &msr).unwrap();

        let err = fmsr
            .write_cpu_feature("pkg_cstate_limit", &FeatureValue::from("PC9"), 0)
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::BadValue(_)));
        assert!(msg.contains("PC0"));
        assert!(msg.contains("unlimited"));
    }

    #[test]
    fn read_only_feature_refuses_writes() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &[], false);
        let fmsr = regs::platform_info::new(&cpuinfo, &msr).unwrap();

        let err = fmsr
            .write_cpu_feature("max_non_turbo_ratio", &FeatureValue::Int(10), 0)
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn msr_bits_str_format() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &[], false);
        let fmsr = regs::platform_info::new(&cpuinfo, &msr).unwrap();
        assert_eq!(
            fmsr.msr_bits_str("min_oper_ratio").unwrap(),
            "MSR_PLATFORM_INFO 0xce bits 55:48"
        );

        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &["hwp", "hwp_pkg_req"], true);
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();
        assert_eq!(
            fmsr.msr_bits_str("pkg_control").unwrap(),
            "MSR_HWP_REQUEST 0x774 bit 42"
        );
    }

    #[test]
    fn value_must_fit_bit_width() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &["hwp"], true);
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();

        // Max representable in 8 bits succeeds, one more fails before I/O.
        fmsr.write_cpu_feature("max_perf", &FeatureValue::Int(0xff), 0).unwrap();
        let err = fmsr
            .write_cpu_feature("max_perf", &FeatureValue::Int(0x100), 0)
            .unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
    }

    #[test]
    fn missing_cpuflag_makes_feature_unsupported() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &["hwp"], true);
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();

        // "epp" requires the hwp_epp flag which the CPUs do not have.
        assert!(!fmsr.is_cpu_feature_supported("epp", 0));
        let err = fmsr.read_cpu_feature("epp", 0).unwrap_err();
        assert!(err.is_not_supported());
        // "max_perf" only requires hwp.
        assert!(fmsr.is_cpu_feature_supported("max_perf", 0));
    }

    #[test]
    fn hwp_gate_masks_features_when_hwp_disabled() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &["hwp", "hwp_epp"], false);
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();
        assert!(!fmsr.is_cpu_feature_supported("max_perf", 0));
        assert!(!fmsr.is_cpu_feature_supported("epp", 0));
    }

    #[test]
    fn unsupported_vendor_or_platform() {
        // Unlisted VFM: MSR_PLATFORM_INFO features are all VFM-gated, so
        // construction fails.
        let (cpuinfo, msr) = setup(cpumodel::vfm(cpumodel::VENDOR_INTEL, 6, 0x01), &[], false);
        let err = regs::platform_info::new(&cpuinfo, &msr).err().unwrap();
        assert!(err.is_not_supported());

        let (cpuinfo, msr) = setup(cpumodel::vfm(cpumodel::VENDOR_AMD, 25, 1), &[], false);
        let err = regs::platform_info::new(&cpuinfo, &msr).err().unwrap();
        assert!(err.is_not_supported());
    }

    #[test]
    fn rapl_units_are_computed() {
        let (cpuinfo, msr) = setup(cpumodel::GRANITERAPIDS_X, &[], false);
        // power units 0b0011 -> 1/8 W, energy units 0b01110 -> 2^-14 J.
        let regval = (0b0011u64) | (0b01110u64 << 8) | (0b1010u64 << 16);
        msr.borrow_mut()
            .write(regs::rapl_power_unit::RAPL_POWER_UNIT, regval, None, Scope::Package, false)
            .unwrap();

        let fmsr = regs::rapl_power_unit::new(&cpuinfo, &msr).unwrap();
        match fmsr.read_cpu_feature("power_units", 0).unwrap() {
            FeatureValue::Float(val) => assert!((val - 0.125).abs() < 1e-9),
            other => panic!("unexpected value {other}"),
        }
        match fmsr.read_cpu_feature("energy_units", 0).unwrap() {
            FeatureValue::Float(val) => assert!((val - 1.0 / 16384.0).abs() < 1e-12),
            other => panic!("unexpected value {other}"),
        }
    }

    #[test]
    fn enable_feature_accepts_on_off_enable_disable() {
        let (cpuinfo, msr) = setup(
            cpumodel::GRANITERAPIDS_X,
            &["hwp", "hwp_epp", "hwp_pkg_req"],
            true,
        );
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();

        fmsr.enable_cpu_feature("pkg_control", &FeatureValue::from("Enable"), 0).unwrap();
        assert!(fmsr.is_cpu_feature_enabled("pkg_control", 0).unwrap());
        fmsr.enable_cpu_feature("pkg_control", &FeatureValue::Bool(false), 0).unwrap();
        assert!(!fmsr.is_cpu_feature_enabled("pkg_control", 0).unwrap());

        let err = fmsr
            .enable_cpu_feature("pkg_control", &FeatureValue::from("maybe"), 0)
            .unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
    }

    #[test]
    fn pkg_control_helpers() {
        let (cpuinfo, msr) = setup(
            cpumodel::GRANITERAPIDS_X,
            &["hwp", "hwp_epp", "hwp_pkg_req"],
            true,
        );
        let fmsr = regs::hwp_request::new(&cpuinfo, &msr).unwrap();

        // Package control off: per-CPU controlled.
        assert!(!regs::hwp_request::is_cpu_feature_pkg_controlled(&fmsr, "max_perf", 0).unwrap());

        fmsr.enable_cpu_feature("pkg_control", &FeatureValue::Bool(true), 0).unwrap();
        assert!(regs::hwp_request::is_cpu_feature_pkg_controlled(&fmsr, "max_perf", 0).unwrap());

        // Setting the valid bit overrides package control for the field.
        regs::hwp_request::disable_cpu_feature_pkg_control(&fmsr, "max_perf", 0).unwrap();
        assert!(!regs::hwp_request::is_cpu_feature_pkg_controlled(&fmsr, "max_perf", 0).unwrap());
    }
}
