// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0xCD (MSR_FSB_FREQ): the encoded bus clock speed on older Intel
//! platforms. Modern platforms do not implement it and use a fixed 100 MHz
//! bus clock.

use std::cell::RefCell;
use std::rc::Rc;

use base::cpumodel;
use base::CpuInfo;
use base::Result;
use base::Scope;

use crate::FeatureDef;
use crate::FeatureType;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_FSB_FREQ: u32 = 0xCD;

// Per-model bus clock code tables: (megahertz, code) plus the bit range
// holding the code.

const CORE2_FSB_CODES: &[(f64, u64)] = &[
    (100.00, 0b101),
    (133.33, 0b001),
    (166.67, 0b011),
    (200.00, 0b010),
    (266.67, 0b000),
    (333.33, 0b100),
    (400.00, 0b110),
];

const OLD_ATOM_FSB_CODES: &[(f64, u64)] = &[
    (83.00, 0b111),
    (100.00, 0b101),
    (133.33, 0b001),
    (166.67, 0b011),
];

const SILVERMONT_FSB_CODES: &[(f64, u64)] = &[
    (80.0, 0b100),
    (83.3, 0b000),
    (100.0, 0b001),
    (133.3, 0b010),
    (116.7, 0b011),
];

const AIRMONT_FSB_CODES: &[(f64, u64)] = &[
    (83.3, 0b0000),
    (100.0, 0b0001),
    (133.3, 0b0010),
    (116.7, 0b0011),
    (80.0, 0b0100),
    (93.3, 0b0101),
    (90.0, 0b0110),
    (88.9, 0b0111),
    (87.5, 0b1000),
];

fn fsb_codes(vfm: u32) -> Option<(&'static [(f64, u64)], (u32, u32))> {
    match vfm {
        v if v == cpumodel::CORE2_MEROM => Some((CORE2_FSB_CODES, (2, 0))),
        v if v == cpumodel::ATOM_BONNELL
            || v == cpumodel::ATOM_BONNELL_MID
            || v == cpumodel::ATOM_SALTWELL
            || v == cpumodel::ATOM_SALTWELL_MID
            || v == cpumodel::ATOM_SALTWELL_TABLET =>
        {
            Some((OLD_ATOM_FSB_CODES, (2, 0)))
        }
        v if cpumodel::GROUP_SILVERMONT.contains(&v) => Some((SILVERMONT_FSB_CODES, (2, 0))),
        v if v == cpumodel::ATOM_AIRMONT => Some((AIRMONT_FSB_CODES, (3, 0))),
        _ => None,
    }
}

fn supported_vfms() -> Vec<u32> {
    let mut vfms = vec![
        cpumodel::CORE2_MEROM,
        cpumodel::ATOM_BONNELL,
        cpumodel::ATOM_BONNELL_MID,
        cpumodel::ATOM_SALTWELL,
        cpumodel::ATOM_SALTWELL_MID,
        cpumodel::ATOM_SALTWELL_TABLET,
        cpumodel::ATOM_AIRMONT,
    ];
    vfms.extend_from_slice(cpumodel::GROUP_SILVERMONT);
    vfms
}

/// Build the MSR_FSB_FREQ feature table. The "fsb" feature is module-scoped
/// on Silvermont/Airmont and core-scoped elsewhere.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let vfm = cpuinfo.vfm();
    let sname = if cpumodel::GROUP_SILVERMONT.contains(&vfm) || vfm == cpumodel::ATOM_AIRMONT {
        Scope::Module
    } else {
        Scope::Core
    };

    let mut def = FeatureDef {
        ftype: FeatureType::Float,
        sname,
        iosname: sname,
        writable: false,
        vfms: supported_vfms(),
        ..FeatureDef::base(
            "fsb",
            "Bus clock speed (megahertz)",
            "Platform bus clock speed (FSB) in megahertz.",
        )
    };

    if let Some((codes, bits)) = fsb_codes(vfm) {
        def.bits = Some(bits);
        def.fvals = codes.to_vec();
    }

    FeaturedMsr::new(MSR_FSB_FREQ, "MSR_FSB_FREQ", vec![def], cpuinfo.clone(), msr.clone())
}
