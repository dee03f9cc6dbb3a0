// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Foundation crate for the power-management control stack: the error
//! taxonomy shared by every subsystem, the `Executor` file/command I/O
//! abstraction, the read-only CPU topology handle, CPU model tables, and
//! cached sysfs access.

mod cpuinfo;
mod error;
mod exec;
mod sysfs;

pub mod cpumodel;
pub mod fmt;

pub use cpuinfo::testing;
pub use cpuinfo::CpuInfo;
pub use cpuinfo::CpuTopologyEntry;
pub use cpuinfo::HybridCpus;
pub use cpuinfo::HybridKind;
pub use cpuinfo::Scope;
pub use error::Error;
pub use error::Result;
pub use exec::DirEntryInfo;
pub use exec::EmulExecutor;
pub use exec::Executor;
pub use exec::LocalExecutor;
pub use exec::RunResult;
pub use sysfs::SysfsIo;
