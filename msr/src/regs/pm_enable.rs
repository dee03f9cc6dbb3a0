// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x770 (MSR_PM_ENABLE), the architectural HWP enable register.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;

use crate::clx_ap_adjusted_scope;
use crate::FeatureDef;
use crate::FeatureType;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_PM_ENABLE: u32 = 0x770;

/// The "hwp" feature bit range, needed by other registers' HWP gating.
pub const HWP_BITS: (u32, u32) = (0, 0);

/// Build the MSR_PM_ENABLE feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let sname = clx_ap_adjusted_scope(cpuinfo);

    let defs = vec![FeatureDef {
        ftype: FeatureType::Bool,
        sname,
        iosname: sname,
        bits: Some(HWP_BITS),
        cpuflags: &["hwp"],
        vals: vec![("on", 1), ("off", 0)],
        ..FeatureDef::base(
            "hwp",
            "Hardware Power Management enabled",
            "When hardware power management is enabled, the platform autonomously scales CPU \
             frequency depending on the load.",
        )
    }];

    FeaturedMsr::new(
        MSR_PM_ENABLE,
        "MSR_PM_ENABLE",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )
}
