// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x1AD (MSR_TURBO_RATIO_LIMIT): maximum turbo ratios.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;

use crate::clx_ap_adjusted_scope;
use crate::FeatureDef;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_TURBO_RATIO_LIMIT: u32 = 0x1AD;

// CPUs whose MSR encodes per-core-count turbo ratios; bits 7:0 hold the
// 1-active-core ratio.
fn core_turbo_vfms() -> Vec<u32> {
    let mut vfms = [
        cpumodel::GROUP_ARROWLAKE,
        cpumodel::GROUP_METEORLAKE,
        cpumodel::GROUP_RAPTORLAKE,
        cpumodel::GROUP_ALDERLAKE,
        cpumodel::GROUP_ROCKETLAKE,
        cpumodel::GROUP_TIGERLAKE,
        cpumodel::GROUP_LAKEFIELD,
        cpumodel::GROUP_ICL_CLIENT,
        cpumodel::GROUP_SKL_CLIENT,
        cpumodel::GROUP_COMETLAKE,
        cpumodel::GROUP_KABYLAKE,
        cpumodel::GROUP_CANNONLAKE,
        cpumodel::GROUP_BROADWELL,
        cpumodel::GROUP_HASWELL,
        cpumodel::GROUP_IVYBRIDGE,
        cpumodel::GROUP_SANDYBRIDGE,
    ]
    .concat();
    vfms.extend_from_slice(&[
        cpumodel::ATOM_SILVERMONT_D,
        cpumodel::NEHALEM,
        cpumodel::NEHALEM_G,
        cpumodel::NEHALEM_EP,
    ]);
    vfms
}

// CPUs whose MSR encodes turbo ratios for groups of cores; MSR 0x1AE holds
// the core counts of the groups. Bits 7:0 are the group-0 ratio.
fn group_turbo_vfms() -> Vec<u32> {
    let mut vfms = [
        cpumodel::GROUP_GNR,
        cpumodel::GROUP_CRESTMONT,
        cpumodel::GROUP_EMR,
        cpumodel::GROUP_SPR,
        cpumodel::GROUP_ICX,
        cpumodel::GROUP_SKX,
        cpumodel::GROUP_GOLDMONT,
    ]
    .concat();
    vfms.push(cpumodel::ATOM_TREMONT_D);
    vfms
}

/// Build the MSR_TURBO_RATIO_LIMIT feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let sname = clx_ap_adjusted_scope(cpuinfo);

    let defs = vec![
        FeatureDef {
            sname,
            iosname: sname,
            bits: Some((7, 0)),
            writable: false,
            vfms: core_turbo_vfms(),
            ..FeatureDef::base(
                "max_1c_turbo_ratio",
                "Max. 1 Core Turbo Ratio",
                "The ratio of maximum turbo frequency in case of 1 active core. This ratio \
                 multiplied by bus clock speed gives the maximum 1 core turbo frequency.",
            )
        },
        FeatureDef {
            sname,
            iosname: sname,
            bits: Some((7, 0)),
            writable: false,
            vfms: group_turbo_vfms(),
            ..FeatureDef::base(
                "max_g0_turbo_ratio",
                "Max. Group 0 cores Turbo Ratio",
                "The ratio of maximum turbo frequency when \"group 0\" count of cores is \
                 active. This ratio multiplied by bus clock speed gives the frequency. The \
                 count of cores in group 0 is provided by MSR 0x1AE.",
            )
        },
    ];

    FeaturedMsr::new(
        MSR_TURBO_RATIO_LIMIT,
        "MSR_TURBO_RATIO_LIMIT",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
