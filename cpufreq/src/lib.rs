// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU frequency control through the mechanisms Linux exposes: the
//! "cpufreq" sysfs subsystem, ACPI CPPC sysfs nodes, and direct
//! `MSR_HWP_REQUEST` programming. Frequencies are hertz everywhere in this
//! crate; conversion from the kernel's kHz (cpufreq) and MHz (CPPC) units
//! happens at the boundary.

pub mod bclk;
mod cppc;
mod hwp;
mod msr_freq;
mod sysfs;
mod uncore;

pub use cppc::CppcSysfs;
pub use hwp::HwpMsr;
pub use msr_freq::CpuFreqMsr;
pub use sysfs::CpuFreqSysfs;
pub use sysfs::IntelPstateMode;
pub use uncore::UncoreFreqSysfs;
