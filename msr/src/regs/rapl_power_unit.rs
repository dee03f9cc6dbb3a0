// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x606 (RAPL_POWER_UNIT): scaling factors for the RAPL energy,
//! power, and time counters.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;

use crate::clx_ap_adjusted_scope;
use crate::FeatureDef;
use crate::FeatureHook;
use crate::FeatureType;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const RAPL_POWER_UNIT: u32 = 0x606;

fn rpu_vfms() -> Vec<u32> {
    [
        cpumodel::GROUP_GNR,
        cpumodel::GROUP_EMR,
        cpumodel::GROUP_METEORLAKE,
        cpumodel::GROUP_SPR,
        cpumodel::GROUP_RAPTORLAKE,
        cpumodel::GROUP_ALDERLAKE,
        cpumodel::GROUP_ROCKETLAKE,
        cpumodel::GROUP_TIGERLAKE,
        cpumodel::GROUP_ICELAKE,
        cpumodel::GROUP_COMETLAKE,
        cpumodel::GROUP_KABYLAKE,
        cpumodel::GROUP_CANNONLAKE,
        cpumodel::GROUP_SKYLAKE,
        cpumodel::GROUP_BROADWELL,
        cpumodel::GROUP_HASWELL,
        cpumodel::GROUP_IVYBRIDGE,
        cpumodel::GROUP_SANDYBRIDGE,
        cpumodel::GROUP_WESTMERE,
        cpumodel::GROUP_TREMONT,
        cpumodel::GROUP_GOLDMONT,
        cpumodel::GROUP_SILVERMONT,
        cpumodel::GROUP_PHI,
    ]
    .concat()
}

fn unit_def(
    fname: &'static str,
    name: &'static str,
    help: &'static str,
    bits: (u32, u32),
    cpuinfo: &CpuInfo,
) -> FeatureDef {
    FeatureDef {
        ftype: FeatureType::Float,
        sname: clx_ap_adjusted_scope(cpuinfo),
        iosname: clx_ap_adjusted_scope(cpuinfo),
        bits: Some(bits),
        writable: false,
        vfms: rpu_vfms(),
        hook: FeatureHook::RaplUnits,
        ..FeatureDef::base(fname, name, help)
    }
}

/// Build the RAPL_POWER_UNIT feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let defs = vec![
        unit_def(
            "power_units",
            "Power units",
            "Scaling factor for translating RAPL Power Units to Watts.",
            (3, 0),
            cpuinfo,
        ),
        unit_def(
            "energy_units",
            "Energy units",
            "Scaling factor for translating RAPL Energy Units to Joules.",
            (12, 8),
            cpuinfo,
        ),
        unit_def(
            "time_units",
            "Time units",
            "Scaling factor for translating RAPL Time Units to seconds.",
            (19, 16),
            cpuinfo,
        ),
    ];

    FeaturedMsr::new(
        RAPL_POWER_UNIT,
        "RAPL_POWER_UNIT",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
