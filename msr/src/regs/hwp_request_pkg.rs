// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x772 (MSR_HWP_REQUEST_PKG): the package-level HWP request.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;

use crate::clx_ap_adjusted_scope;
use crate::regs::apply_hwp_gate;
use crate::FeatureDef;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_HWP_REQUEST_PKG: u32 = 0x772;

/// Build the MSR_HWP_REQUEST_PKG feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let sname = clx_ap_adjusted_scope(cpuinfo);

    let defs = vec![
        FeatureDef {
            sname,
            iosname: sname,
            bits: Some((7, 0)),
            cpuflags: &["hwp", "hwp_pkg_req"],
            ..FeatureDef::base(
                "min_perf",
                "Min. CPU performance",
                "The minimum desired CPU performance.",
            )
        },
        FeatureDef {
            sname,
            iosname: sname,
            bits: Some((15, 8)),
            cpuflags: &["hwp", "hwp_pkg_req"],
            ..FeatureDef::base(
                "max_perf",
                "Max. CPU performance",
                "The maximum desired CPU performance.",
            )
        },
        FeatureDef {
            sname,
            iosname: sname,
            bits: Some((31, 24)),
            cpuflags: &["hwp", "hwp_epp", "hwp_pkg_req"],
            ..FeatureDef::base(
                "epp",
                "Energy Performance Preference",
                "Energy Performance Preference is a hint to the CPU running in HWP mode about \
                 the power and performance preference. Value 0 indicates highest performance \
                 and value 255 indicates maximum energy savings.",
            )
        },
    ];

    let mut fmsr = FeaturedMsr::new(
        MSR_HWP_REQUEST_PKG,
        "MSR_HWP_REQUEST_PKG",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )?;
    apply_hwp_gate(&mut fmsr, cpuinfo, msr)?;
    Ok(fmsr)
}
