// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x774 (MSR_HWP_REQUEST): the per-CPU HWP frequency/EPP request.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;
use base::Scope;

use crate::regs::apply_hwp_gate;
use crate::FeatureDef;
use crate::FeatureType;
use crate::FeatureValue;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_HWP_REQUEST: u32 = 0x774;

fn bool_def(
    fname: &'static str,
    name: &'static str,
    help: &'static str,
    bit: u32,
    cpuflags: &'static [&'static str],
) -> FeatureDef {
    FeatureDef {
        ftype: FeatureType::Bool,
        sname: Scope::Cpu,
        iosname: Scope::Cpu,
        bits: Some((bit, bit)),
        cpuflags,
        vals: vec![("on", 1), ("off", 0)],
        ..FeatureDef::base(fname, name, help)
    }
}

/// Build the MSR_HWP_REQUEST feature table. Features are marked
/// unsupported on packages where HWP is disabled.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let defs = vec![
        FeatureDef {
            bits: Some((7, 0)),
            cpuflags: &["hwp"],
            ..FeatureDef::base(
                "min_perf",
                "Min. CPU performance",
                "The minimum desired CPU performance.",
            )
        },
        FeatureDef {
            bits: Some((15, 8)),
            cpuflags: &["hwp"],
            ..FeatureDef::base(
                "max_perf",
                "Max. CPU performance",
                "The maximum desired CPU performance.",
            )
        },
        FeatureDef {
            bits: Some((31, 24)),
            cpuflags: &["hwp", "hwp_epp"],
            ..FeatureDef::base(
                "epp",
                "Energy Performance Preference",
                "Energy Performance Preference is a hint to the CPU running in HWP mode about \
                 the power and performance preference. Value 0 indicates highest performance \
                 and value 255 indicates maximum energy savings.",
            )
        },
        bool_def(
            "pkg_control",
            "HWP is controlled by MSR_HWP_REQUEST_PKG",
            "When enabled, the CPU ignores this per-CPU MSR and instead uses the per-package \
             MSR 0x772 (MSR_HWP_REQUEST_PKG).",
            42,
            &["hwp", "hwp_pkg_req"],
        ),
        bool_def(
            "epp_valid",
            "EPP is controlled by MSR_HWP_REQUEST",
            "When set, the CPU reads the EPP value from the per-CPU MSR even if bit 42 \
             ('pkg_control') is set.",
            60,
            &["hwp", "hwp_epp"],
        ),
        bool_def(
            "max_perf_valid",
            "Max. performance is controlled by MSR_HWP_REQUEST",
            "When set, the CPU reads the maximum performance value from the per-CPU MSR even \
             if bit 42 ('pkg_control') is set.",
            62,
            &["hwp"],
        ),
        bool_def(
            "min_perf_valid",
            "Min. performance is controlled by MSR_HWP_REQUEST",
            "When set, the CPU reads the minimum performance value from the per-CPU MSR even \
             if bit 42 ('pkg_control') is set.",
            63,
            &["hwp"],
        ),
    ];

    let mut fmsr = FeaturedMsr::new(
        MSR_HWP_REQUEST,
        "MSR_HWP_REQUEST",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )?;
    apply_hwp_gate(&mut fmsr, cpuinfo, msr)?;
    Ok(fmsr)
}

/// Whether `fname` ("min_perf", "max_perf" or "epp") of `cpu` is governed by
/// the package-level MSR rather than the per-CPU one. Package control can be
/// overridden per field with the corresponding "valid" bit.
pub fn is_cpu_feature_pkg_controlled(fmsr: &FeaturedMsr, fname: &str, cpu: u32) -> Result<bool> {
    let pkg_control = match fmsr.is_cpu_feature_enabled("pkg_control", cpu) {
        Ok(enabled) => enabled,
        // No package control support: the feature is per-CPU.
        Err(err) if err.is_not_supported() => return Ok(false),
        Err(err) => return Err(err),
    };

    if !pkg_control {
        return Ok(false);
    }

    let valid = fmsr.is_cpu_feature_enabled(&format!("{fname}_valid"), cpu)?;
    Ok(!valid)
}

/// Route `fname` of `cpu` back to per-CPU control by setting its "valid"
/// bit. A no-op when package control is unsupported or off.
pub fn disable_cpu_feature_pkg_control(fmsr: &FeaturedMsr, fname: &str, cpu: u32) -> Result<()> {
    let pkg_control = match fmsr.is_cpu_feature_enabled("pkg_control", cpu) {
        Ok(enabled) => enabled,
        Err(err) if err.is_not_supported() => return Ok(()),
        Err(err) => return Err(err),
    };

    if pkg_control {
        fmsr.write_cpu_feature(&format!("{fname}_valid"), &FeatureValue::Str("on".to_string()), cpu)?;
    }
    Ok(())
}
