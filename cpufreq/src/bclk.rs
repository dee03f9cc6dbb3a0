// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bus clock (FSB) speed discovery.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Error;
use base::Result;
use msr::regs;
use msr::FeatureValue;
use msr::MsrEngine;

/// The bus clock speed of `cpu` in Hz: decoded from `MSR_FSB_FREQ` on the
/// platforms that implement it, 100 MHz on every other Intel platform.
pub fn get_bclk(cpuinfo: &Rc<CpuInfo>, msr: &Rc<RefCell<MsrEngine>>, cpu: u32) -> Result<u64> {
    let fsbfreq = match regs::fsb_freq::new(cpuinfo, msr) {
        Ok(fsbfreq) => fsbfreq,
        Err(err) if err.is_not_supported() => {
            if !cpuinfo.is_intel() {
                return Err(err);
            }
            return Ok(100_000_000);
        }
        Err(err) => return Err(err),
    };

    match fsbfreq.read_cpu_feature("fsb", cpu)? {
        FeatureValue::Float(mhz) => Ok((mhz * 1_000_000.0).round() as u64),
        other => Err(Error::BadValue(format!(
            "unexpected bus clock value '{other}' for CPU {cpu}"
        ))),
    }
}
