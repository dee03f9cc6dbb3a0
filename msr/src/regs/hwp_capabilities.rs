// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSR 0x771 (MSR_HWP_CAPABILITIES): the HWP performance level ladder.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;

use crate::regs::apply_hwp_gate;
use crate::FeatureDef;
use crate::FeaturedMsr;
use crate::MsrEngine;

pub const MSR_HWP_CAPABILITIES: u32 = 0x771;

fn perf_def(fname: &'static str, name: &'static str, help: &'static str, bits: (u32, u32)) -> FeatureDef {
    FeatureDef {
        bits: Some(bits),
        writable: false,
        cpuflags: &["hwp"],
        ..FeatureDef::base(fname, name, help)
    }
}

/// Build the MSR_HWP_CAPABILITIES feature table.
pub fn new(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>) -> Result<FeaturedMsr> {
    let defs = vec![
        perf_def(
            "highest_perf",
            "Highest CPU performance level",
            "The highest CPU HWP performance level.",
            (7, 0),
        ),
        perf_def(
            "guaranteed_perf",
            "Guaranteed CPU performance level",
            "The guaranteed CPU HWP performance level.",
            (15, 8),
        ),
        perf_def(
            "efficient_perf",
            "Most efficient CPU performance",
            "The most efficient CPU HWP performance level.",
            (23, 16),
        ),
        perf_def(
            "lowest_perf",
            "Lowest CPU performance",
            "The lowest CPU HWP performance level.",
            (31, 24),
        ),
    ];

    let mut fmsr = FeaturedMsr::new(
        MSR_HWP_CAPABILITIES,
        "MSR_HWP_CAPABILITIES",
        defs,
        cpuinfo.clone(),
        msr.clone(),
    )?;
    apply_hwp_gate(&mut fmsr, cpuinfo, msr)?;
    Ok(fmsr)
}
