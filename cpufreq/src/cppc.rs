// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU frequency and performance limits from ACPI CPPC sysfs nodes
//! (`/sys/devices/system/cpu/cpu<N>/acpi_cppc/`).

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use base::Error;
use base::Result;
use base::SysfsIo;
use log::debug;

const SYSFS_BASE: &str = "/sys/devices/system/cpu";

/// Read-only access to the ACPI CPPC sysfs files. Frequencies are MHz in
/// sysfs and hertz here.
pub struct CppcSysfs {
    sysfs: Rc<RefCell<SysfsIo>>,
    base: PathBuf,
}

impl CppcSysfs {
    pub fn new(sysfs: Rc<RefCell<SysfsIo>>) -> CppcSysfs {
        CppcSysfs {
            sysfs,
            base: PathBuf::from(SYSFS_BASE),
        }
    }

    fn read_cppc_file(&self, cpu: u32, fname: &str, what: &str) -> Result<u64> {
        let path = self.base.join(format!("cpu{cpu}")).join("acpi_cppc").join(fname);

        let read_result = self.sysfs.borrow_mut().read_int(&path, what);
        let val = match read_result {
            Ok(val) => val,
            Err(err) => {
                // On some platforms reading CPPC files always fails; treat
                // that the same as the file being absent.
                debug!("ACPI CPPC sysfs file '{}' is not readable", path.display());
                return Err(Error::NotSupported(err.to_string()));
            }
        };

        if val == 0 {
            debug!("ACPI CPPC sysfs file '{}' contains 0", path.display());
            return Err(Error::NotSupported(format!(
                "read '0' for {what} from '{}'",
                path.display()
            )));
        }
        Ok(val)
    }

    fn read_freq_mhz(&self, cpus: &[u32], fname: &str, what: &str) -> Result<Vec<(u32, u64)>> {
        cpus.iter()
            .map(|&cpu| {
                let mhz = self.read_cppc_file(cpu, fname, &format!("{what} for CPU {cpu}"))?;
                Ok((cpu, mhz * 1_000_000))
            })
            .collect()
    }

    fn read_perf(&self, cpus: &[u32], fname: &str, what: &str) -> Result<Vec<(u32, u64)>> {
        cpus.iter()
            .map(|&cpu| {
                let val = self.read_cppc_file(cpu, fname, &format!("{what} for CPU {cpu}"))?;
                Ok((cpu, val))
            })
            .collect()
    }

    /// `lowest_freq`, Hz.
    pub fn get_min_freq_limit(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_freq_mhz(cpus, "lowest_freq", "min. CPU frequency limit")
    }

    /// `highest_freq`, Hz.
    pub fn get_max_freq_limit(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_freq_mhz(cpus, "highest_freq", "max. CPU frequency limit")
    }

    /// `nominal_freq` (the base frequency), Hz.
    pub fn get_base_freq(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_freq_mhz(cpus, "nominal_freq", "base CPU frequency")
    }

    /// `lowest_perf`.
    pub fn get_lowest_perf(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_perf(cpus, "lowest_perf", "lowest CPU performance")
    }

    /// `lowest_nonlinear_perf`.
    pub fn get_lowest_nonlinear_perf(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_perf(cpus, "lowest_nonlinear_perf", "lowest non-linear CPU performance")
    }

    /// `nominal_perf` (the base performance).
    pub fn get_base_perf(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_perf(cpus, "nominal_perf", "base CPU performance")
    }

    /// `highest_perf`.
    pub fn get_highest_perf(&self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_perf(cpus, "highest_perf", "highest CPU performance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::EmulExecutor;
    use base::Executor;

    fn cppc_with(files: &[(&str, &str)]) -> CppcSysfs {
        let exec = Rc::new(EmulExecutor::new());
        for (path, data) in files {
            exec.add_file(*path, data);
        }
        let sysfs = Rc::new(RefCell::new(SysfsIo::new(exec as Rc<dyn Executor>, true)));
        CppcSysfs::new(sysfs)
    }

    #[test]
    fn frequencies_convert_mhz_to_hz() {
        let cppc = cppc_with(&[
            ("/sys/devices/system/cpu/cpu0/acpi_cppc/nominal_freq", "2000\n"),
            ("/sys/devices/system/cpu/cpu0/acpi_cppc/highest_perf", "35\n"),
        ]);
        assert_eq!(cppc.get_base_freq(&[0]).unwrap(), vec![(0, 2_000_000_000)]);
        assert_eq!(cppc.get_highest_perf(&[0]).unwrap(), vec![(0, 35)]);
    }

    #[test]
    fn zero_and_missing_degrade_to_not_supported() {
        let cppc = cppc_with(&[(
            "/sys/devices/system/cpu/cpu0/acpi_cppc/lowest_freq",
            "0",
        )]);
        assert!(cppc.get_min_freq_limit(&[0]).unwrap_err().is_not_supported());
        assert!(cppc.get_max_freq_limit(&[0]).unwrap_err().is_not_supported());
    }
}
