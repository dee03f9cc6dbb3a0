// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0xCE (MSR_PLATFORM_INFO), present on many Intel platforms.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;

use crate::clx_ap_adjusted_scope;
use crate::FeatureDef;
use crate::FeatureType;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_PLATFORM_INFO: u32 = 0xCE;

// CPUs supporting the "maximum efficiency ratio" feature.
fn efreq_vfms() -> Vec<u32> {
    [
        cpumodel::GROUP_GNR,
        cpumodel::GROUP_EMR,
        cpumodel::GROUP_ARROWLAKE,
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
        cpumodel::GROUP_NEHALEM,
        cpumodel::GROUP_DARKMONT,
        cpumodel::GROUP_CRESTMONT,
        cpumodel::GROUP_TREMONT,
        cpumodel::GROUP_GOLDMONT,
        cpumodel::GROUP_PHI,
    ]
    .concat()
}

// CPUs supporting the "minimum operating ratio" feature.
fn min_oper_ratio_vfms() -> Vec<u32> {
    let mut vfms = [
        cpumodel::GROUP_GNR,
        cpumodel::GROUP_EMR,
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
        cpumodel::GROUP_DARKMONT,
        cpumodel::GROUP_CRESTMONT,
        cpumodel::GROUP_TREMONT,
        cpumodel::GROUP_GOLDMONT,
        cpumodel::GROUP_PHI,
    ]
    .concat();
    vfms.push(cpumodel::IVYBRIDGE);
    vfms
}

// CPUs supporting the "maximum non-turbo ratio" feature.
fn basefreq_vfms() -> Vec<u32> {
    let mut vfms = efreq_vfms();
    vfms.extend_from_slice(cpumodel::GROUP_SILVERMONT);
    vfms.extend_from_slice(cpumodel::GROUP_AIRMONT);
    vfms
}

/// Build the MSR_PLATFORM_INFO feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let sname = clx_ap_adjusted_scope(cpuinfo);

    let defs = vec![
        FeatureDef {
            ftype: FeatureType::Int,
            sname,
            iosname: sname,
            bits: Some((15, 8)),
            writable: false,
            vfms: basefreq_vfms(),
            ..FeatureDef::base(
                "max_non_turbo_ratio",
                "Max. Non-Turbo Ratio",
                "The ratio of the maximum non-turbo frequency. This ratio multiplied by bus \
                 clock speed gives the base frequency.",
            )
        },
        FeatureDef {
            ftype: FeatureType::Int,
            sname,
            iosname: sname,
            bits: Some((47, 40)),
            writable: false,
            vfms: efreq_vfms(),
            ..FeatureDef::base(
                "max_eff_ratio",
                "Max. Efficiency Ratio",
                "The maximum efficiency CPU ratio. This ratio multiplied by bus clock speed \
                 gives the efficiency CPU frequency (Pn).",
            )
        },
        FeatureDef {
            ftype: FeatureType::Int,
            sname,
            iosname: sname,
            bits: Some((55, 48)),
            writable: false,
            vfms: min_oper_ratio_vfms(),
            ..FeatureDef::base(
                "min_oper_ratio",
                "Min. Operating Ratio",
                "The minimum operating CPU ratio. This ratio multiplied by bus clock speed \
                 gives the minimum operating CPU frequency (Pm).",
            )
        },
    ];

    FeaturedMsr::new(
        MSR_PLATFORM_INFO,
        "MSR_PLATFORM_INFO",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
