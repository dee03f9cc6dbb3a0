// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0xE2 (MSR_PKG_CST_CONFIG_CONTROL): package C-state limit and C1
//! demotion knobs.
//!
//! The SDM describes every possible package C-state for a model, but
//! platforms typically implement a subset (Xeons rarely go deeper than
//! PC6), so the limit value table is per-model.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;
use base::Scope;

use crate::clx_ap_adjusted_scope;
use crate::FeatureDef;
use crate::FeatureType;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_PKG_CST_CONFIG_CONTROL: u32 = 0xE2;

struct Limits {
    codes: &'static [(&'static str, u64)],
    bits: (u32, u32),
}

// Ice Lake, Granite Rapids, Sierra Forest, Clearwater Forest Xeons.
const ICX_LIMITS: Limits = Limits {
    codes: &[("PC0", 0), ("PC2", 1), ("PC6", 2), ("unlimited", 7)],
    bits: (2, 0),
};

// Emerald Rapids, Sapphire Rapids, Cascade Lake, Skylake Xeons, Xeon Phis.
const SKX_LIMITS: Limits = Limits {
    codes: &[("PC0", 0), ("PC2", 1), ("PC6", 2), ("PC6R", 3), ("unlimited", 7)],
    bits: (2, 0),
};

// Broadwell and Haswell Xeons.
const HSX_LIMITS: Limits = Limits {
    codes: &[("PC0", 0), ("PC2", 1), ("PC3", 2), ("PC6", 3), ("unlimited", 7)],
    bits: (2, 0),
};

// Ivy Bridge Xeon (Ivy Town).
const IVT_LIMITS: Limits = Limits {
    codes: &[("PC0", 0), ("PC2", 1), ("PC6", 2), ("PC6R", 3), ("unlimited", 7)],
    bits: (2, 0),
};

// Denverton SoC (Goldmont).
const DNV_LIMITS: Limits = Limits {
    codes: &[("PC2", 2), ("PC6", 3), ("unlimited", 0)],
    bits: (3, 0),
};

// Clients up to PC10.
const CLIENT_PC10_LIMITS: Limits = Limits {
    codes: &[
        ("PC0", 0),
        ("PC2", 1),
        ("PC3", 2),
        ("PC6", 3),
        ("PC7", 4),
        ("PC7S", 5),
        ("PC8", 6),
        ("PC9", 7),
        ("PC10", 8),
    ],
    bits: (3, 0),
};

// Clients up to PC7S.
const CLIENT_PC7S_LIMITS: Limits = Limits {
    codes: &[("PC0", 0), ("PC2", 1), ("PC3", 2), ("PC6", 3), ("PC7", 4), ("PC7S", 5)],
    bits: (3, 0),
};

fn limits(vfm: u32) -> Option<&'static Limits> {
    if cpumodel::GROUP_GNR.contains(&vfm)
        || cpumodel::GROUP_ICX.contains(&vfm)
        || cpumodel::GROUP_CRESTMONT.contains(&vfm)
        || cpumodel::GROUP_DARKMONT.contains(&vfm)
    {
        return Some(&ICX_LIMITS);
    }
    if cpumodel::GROUP_EMR.contains(&vfm)
        || cpumodel::GROUP_SPR.contains(&vfm)
        || vfm == cpumodel::SKYLAKE_X
        || cpumodel::GROUP_PHI.contains(&vfm)
    {
        return Some(&SKX_LIMITS);
    }
    if vfm == cpumodel::HASWELL_X || vfm == cpumodel::BROADWELL_X || vfm == cpumodel::BROADWELL_D {
        return Some(&HSX_LIMITS);
    }
    if vfm == cpumodel::IVYBRIDGE_X {
        return Some(&IVT_LIMITS);
    }
    if vfm == cpumodel::ATOM_GOLDMONT_D {
        return Some(&DNV_LIMITS);
    }
    if cpumodel::GROUP_ALDERLAKE.contains(&vfm)
        || cpumodel::GROUP_RAPTORLAKE.contains(&vfm)
        || cpumodel::GROUP_METEORLAKE.contains(&vfm)
        || cpumodel::GROUP_LUNARLAKE.contains(&vfm)
        || cpumodel::GROUP_TIGERLAKE.contains(&vfm)
        || cpumodel::GROUP_ICL_CLIENT.contains(&vfm)
        || cpumodel::GROUP_COMETLAKE.contains(&vfm)
        || cpumodel::GROUP_KABYLAKE.contains(&vfm)
        || cpumodel::GROUP_SKL_CLIENT.contains(&vfm)
        || vfm == cpumodel::CANNONLAKE_L
    {
        return Some(&CLIENT_PC10_LIMITS);
    }
    if cpumodel::GROUP_HASWELL.contains(&vfm)
        || vfm == cpumodel::BROADWELL
        || vfm == cpumodel::BROADWELL_G
        || vfm == cpumodel::IVYBRIDGE
        || cpumodel::GROUP_SANDYBRIDGE.contains(&vfm)
    {
        return Some(&CLIENT_PC7S_LIMITS);
    }
    None
}

/// Build the MSR_PKG_CST_CONFIG_CONTROL feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let vfm = cpuinfo.vfm();

    // The register copy is core-scoped on most platforms, module-scoped on
    // Silvermont/Airmont Atoms, and package-scoped on Xeon Phis.
    let iosname = if cpumodel::GROUP_SILVERMONT.contains(&vfm)
        || cpumodel::GROUP_AIRMONT.contains(&vfm)
    {
        Scope::Module
    } else if cpumodel::GROUP_PHI.contains(&vfm) {
        Scope::Package
    } else {
        Scope::Core
    };

    // The package C-state limit and its lock act package-wide regardless
    // of the I/O scope (die-wide on CLX-AP). C1 demotion/undemotion follow
    // the I/O scope, except on ICX/SPR/EMR Xeons where they also act
    // package-wide.
    let pkg_sname = clx_ap_adjusted_scope(cpuinfo);
    let c1_sname = if cpumodel::GROUP_EMR.contains(&vfm)
        || cpumodel::GROUP_SPR.contains(&vfm)
        || cpumodel::GROUP_ICX.contains(&vfm)
    {
        pkg_sname
    } else {
        iosname
    };

    let mut defs = Vec::new();

    if let Some(limits) = limits(vfm) {
        defs.push(FeatureDef {
            ftype: FeatureType::Str,
            sname: pkg_sname,
            iosname,
            bits: Some(limits.bits),
            vfms: vec![vfm],
            vals: limits.codes.to_vec(),
            ..FeatureDef::base(
                "pkg_cstate_limit",
                "Package C-state limit",
                "The deepest package C-state the platform is allowed to enter.",
            )
        });
    }

    defs.push(FeatureDef {
        ftype: FeatureType::Bool,
        sname: pkg_sname,
        iosname,
        bits: Some((15, 15)),
        writable: false,
        vals: vec![("on", 1), ("off", 0)],
        ..FeatureDef::base(
            "pkg_cstate_limit_lock",
            "Package C-state limit lock",
            "When set, the package C-state limit can not be modified until the next reset.",
        )
    });

    defs.push(FeatureDef {
        ftype: FeatureType::Bool,
        sname: c1_sname,
        iosname,
        bits: Some((26, 26)),
        vals: vec![("on", 1), ("off", 0)],
        ..FeatureDef::base(
            "c1_demotion",
            "C1 demotion",
            "When enabled, the CPU may demote deep C-state requests to C1.",
        )
    });

    defs.push(FeatureDef {
        ftype: FeatureType::Bool,
        sname: c1_sname,
        iosname,
        bits: Some((28, 28)),
        vals: vec![("on", 1), ("off", 0)],
        ..FeatureDef::base(
            "c1_undemotion",
            "C1 undemotion",
            "When enabled, the CPU may undo a C1 demotion and enter the deep C-state after \
             all.",
        )
    });

    FeaturedMsr::new(
        MSR_PKG_CST_CONFIG_CONTROL,
        "MSR_PKG_CST_CONFIG_CONTROL",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
