// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Uncore frequency limits via the `intel_uncore_frequency` sysfs driver.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use base::Error;
use base::Result;
use base::SysfsIo;

const UNCORE_BASE: &str = "/sys/devices/system/cpu/intel_uncore_frequency";

/// Per-(package, die) uncore frequency limits. Values are hertz; sysfs
/// uses kHz.
pub struct UncoreFreqSysfs {
    sysfs: Rc<RefCell<SysfsIo>>,
    base: PathBuf,
}

impl UncoreFreqSysfs {
    pub fn new(sysfs: Rc<RefCell<SysfsIo>>) -> UncoreFreqSysfs {
        UncoreFreqSysfs {
            sysfs,
            base: PathBuf::from(UNCORE_BASE),
        }
    }

    fn die_path(&self, package: u32, die: u32, fname: &str) -> Result<PathBuf> {
        if !self.sysfs.borrow().executor().exists(&self.base) {
            return Err(Error::NotSupported(format!(
                "uncore frequency operations are not supported{}: no '{}' (the \
                 'intel_uncore_frequency' driver is missing or not loaded)",
                self.sysfs.borrow().executor().hostmsg(),
                self.base.display()
            )));
        }
        Ok(self
            .base
            .join(format!("package_{package:02}_die_{die:02}"))
            .join(fname))
    }

    fn read_khz(&self, package: u32, die: u32, fname: &str, what: &str) -> Result<u64> {
        let path = self.die_path(package, die, fname)?;
        let khz = self.sysfs.borrow_mut().read_int(
            &path,
            &format!("{what} for package {package} die {die}"),
        )?;
        Ok(khz * 1000)
    }

    fn write_khz(&self, freq: u64, package: u32, die: u32, fname: &str, what: &str) -> Result<()> {
        let path = self.die_path(package, die, fname)?;
        self.sysfs.borrow_mut().write_int(
            &path,
            freq / 1000,
            &format!("{what} for package {package} die {die}"),
        )
    }

    /// Minimum uncore frequency, Hz.
    pub fn get_min_freq(&self, package: u32, die: u32) -> Result<u64> {
        self.read_khz(package, die, "min_freq_khz", "min. uncore frequency")
    }

    /// Maximum uncore frequency, Hz.
    pub fn get_max_freq(&self, package: u32, die: u32) -> Result<u64> {
        self.read_khz(package, die, "max_freq_khz", "max. uncore frequency")
    }

    /// The minimum uncore frequency limit the BIOS programmed, Hz.
    pub fn get_initial_min_freq(&self, package: u32, die: u32) -> Result<u64> {
        self.read_khz(package, die, "initial_min_freq_khz", "initial min. uncore frequency")
    }

    /// The maximum uncore frequency limit the BIOS programmed, Hz.
    pub fn get_initial_max_freq(&self, package: u32, die: u32) -> Result<u64> {
        self.read_khz(package, die, "initial_max_freq_khz", "initial max. uncore frequency")
    }

    /// Set the minimum uncore frequency, Hz.
    pub fn set_min_freq(&self, freq: u64, package: u32, die: u32) -> Result<()> {
        self.write_khz(freq, package, die, "min_freq_khz", "min. uncore frequency")
    }

    /// Set the maximum uncore frequency, Hz.
    pub fn set_max_freq(&self, freq: u64, package: u32, die: u32) -> Result<()> {
        self.write_khz(freq, package, die, "max_freq_khz", "max. uncore frequency")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::EmulExecutor;
    use base::Executor;

    fn uncore_with(files: &[(&str, &str)]) -> UncoreFreqSysfs {
        let exec = Rc::new(EmulExecutor::new());
        for (path, data) in files {
            exec.add_file(*path, data);
        }
        let sysfs = Rc::new(RefCell::new(SysfsIo::new(exec as Rc<dyn Executor>, true)));
        UncoreFreqSysfs::new(sysfs)
    }

    #[test]
    fn reads_and_writes_khz() {
        let uncore = uncore_with(&[
            (
                "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_01/min_freq_khz",
                "800000",
            ),
            (
                "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_01/max_freq_khz",
                "2400000",
            ),
        ]);
        assert_eq!(uncore.get_min_freq(0, 1).unwrap(), 800_000_000);
        assert_eq!(uncore.get_max_freq(0, 1).unwrap(), 2_400_000_000);

        uncore.set_max_freq(2_000_000_000, 0, 1).unwrap();
        assert_eq!(uncore.get_max_freq(0, 1).unwrap(), 2_000_000_000);
    }

    #[test]
    fn missing_driver_is_not_supported() {
        let uncore = uncore_with(&[]);
        assert!(uncore.get_min_freq(0, 0).unwrap_err().is_not_supported());
    }
}
