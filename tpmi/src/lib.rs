// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TPMI (Topology Aware Register and PM Capsule Interface) register access.
//!
//! TPMI is a memory-mapped power-management register interface on Intel
//! Xeons, surfaced by the kernel through debugfs as per-PCI-device
//! directories holding a textual `mem_dump` file per feature. Register
//! layouts are platform-dependent and described by YAML spec files shipped
//! with the tool; this crate pairs the two to give named register and
//! bit-field access.

mod engine;
mod spec;

pub use engine::TpmiEngine;
pub use engine::UFS_FEATURE;
pub use engine::UFS_HEADER_REGNAMES;
pub use spec::get_features;
pub use spec::BitField;
pub use spec::Fdict;
pub use spec::Register;
pub use spec::SpecDirInfo;
pub use spec::SpecFileInfo;
pub use spec::SPECS_PATH_ENVVAR;
