// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! pmctl: inspection and control of CPU power-management knobs on Intel
//! platforms, through the kernel's MSR character devices, the cpufreq and
//! ACPI CPPC sysfs surfaces, and the TPMI debugfs interface.
//!
//! The crates compose bottom-up: `base` (I/O and topology), `msr` (the
//! cached MSR engine and featured registers), `tpmi` (spec-file-driven
//! TPMI decoding), `cpufreq` (frequency mechanisms), and this crate's
//! `PStates` orchestrator, which maps named properties onto whichever
//! mechanism the platform supports.

mod noncomp;
mod pstates;

pub use noncomp::AgentType;
pub use noncomp::NonCompDieInfo;
pub use noncomp::NonCompDies;
pub use pstates::Mechanism;
pub use pstates::PStates;
pub use pstates::PropertyDef;
pub use pstates::PropertyValue;
