// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x1B0 (MSR_ENERGY_PERF_BIAS): the energy/performance bias hint.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;
use base::Scope;

use crate::FeatureDef;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_ENERGY_PERF_BIAS: u32 = 0x1B0;

/// Build the MSR_ENERGY_PERF_BIAS feature table. The "epb" feature has CPU
/// scope, except core scope on Silvermont and package scope on Westmere and
/// Sandy Bridge.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let vfm = cpuinfo.vfm();
    let sname = if cpumodel::GROUP_SILVERMONT.contains(&vfm) {
        Scope::Core
    } else if cpumodel::GROUP_WESTMERE.contains(&vfm) || cpumodel::GROUP_SANDYBRIDGE.contains(&vfm)
    {
        Scope::Package
    } else {
        Scope::Cpu
    };

    let defs = vec![FeatureDef {
        sname,
        iosname: sname,
        bits: Some((3, 0)),
        cpuflags: &["epb"],
        ..FeatureDef::base(
            "epb",
            "Energy Performance Bias",
            "Energy Performance Bias is a hint to the CPU about the power and performance \
             preference. Value 0 indicates highest performance and value 15 indicates maximum \
             energy savings.",
        )
    }];

    FeaturedMsr::new(
        MSR_ENERGY_PERF_BIAS,
        "MSR_ENERGY_PERF_BIAS",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
