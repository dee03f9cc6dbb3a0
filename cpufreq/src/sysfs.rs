// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU frequency control via the Linux "cpufreq" sysfs subsystem.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use base::CpuInfo;
use base::Error;
use base::Result;
use base::SysfsIo;
use log::warn;
use msr::regs::pm_enable;
use msr::MsrEngine;

const SYSFS_BASE: &str = "/sys/devices/system/cpu";

// On HWP systems frequency writes propagate asynchronously; the read-back
// verification retries a couple of times.
const VERIFY_RETRIES: u32 = 2;
const VERIFY_SLEEP: Duration = Duration::from_millis(100);

/// The `intel_pstate` driver operation mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntelPstateMode {
    Active,
    Passive,
    Off,
}

impl IntelPstateMode {
    pub fn from_str(mode: &str) -> Result<IntelPstateMode> {
        match mode {
            "active" => Ok(IntelPstateMode::Active),
            "passive" => Ok(IntelPstateMode::Passive),
            "off" => Ok(IntelPstateMode::Off),
            _ => Err(Error::BadValue(format!(
                "bad 'intel_pstate' mode '{mode}', use one of: active, passive, off"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IntelPstateMode::Active => "active",
            IntelPstateMode::Passive => "passive",
            IntelPstateMode::Off => "off",
        }
    }
}

impl fmt::Display for IntelPstateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access to `/sys/devices/system/cpu/cpu<N>/cpufreq/*` and the
/// driver-global knobs. Callers are responsible for passing valid, online
/// CPU numbers.
pub struct CpuFreqSysfs {
    cpuinfo: Rc<CpuInfo>,
    sysfs: Rc<RefCell<SysfsIo>>,
    msr: Rc<RefCell<MsrEngine>>,
    base: PathBuf,
    verify: bool,
    ecores_bug_checked: bool,
}

impl CpuFreqSysfs {
    /// `verify` enables read-back verification of frequency writes (with
    /// HWP-aware retries).
    pub fn new(
        cpuinfo: Rc<CpuInfo>,
        sysfs: Rc<RefCell<SysfsIo>>,
        msr: Rc<RefCell<MsrEngine>>,
        verify: bool,
    ) -> CpuFreqSysfs {
        CpuFreqSysfs {
            cpuinfo,
            sysfs,
            msr,
            base: PathBuf::from(SYSFS_BASE),
            verify,
            ecores_bug_checked: false,
        }
    }

    fn policy_path(&self, cpu: u32, fname: &str) -> PathBuf {
        self.base.join(format!("cpu{cpu}")).join("cpufreq").join(fname)
    }

    fn kernel_version(&self) -> Option<(u32, u32)> {
        let text = self
            .sysfs
            .borrow()
            .executor()
            .read(Path::new("/proc/sys/kernel/osrelease"))
            .ok()?;
        let mut parts = text.trim().split(|c| c == '.' || c == '-');
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = parts.next()?.parse::<u32>().ok()?;
        Some((major, minor))
    }

    /// Kernels prior to v6.5 report wrong sysfs frequencies on hybrid
    /// systems whose E-cores are all disabled (fixed by kernel commit
    /// 0fcfc9e51990). Warn once when the target looks affected.
    fn warn_no_ecores_bug(&mut self) {
        if self.ecores_bug_checked || !self.cpuinfo.is_hybrid() {
            return;
        }

        if let Some(hybrid) = self.cpuinfo.hybrid_cpus() {
            if !hybrid.pcores.is_empty() || !hybrid.ecores.is_empty() {
                self.ecores_bug_checked = true;
                return;
            }
        }

        // E-cores may exist but be offline; avoid a false positive.
        if !self.cpuinfo.offline_cpus().is_empty() {
            return;
        }

        let Some((major, minor)) = self.kernel_version() else {
            self.ecores_bug_checked = true;
            return;
        };
        if (major, minor) >= (6, 5) {
            self.ecores_bug_checked = true;
            return;
        }

        self.ecores_bug_checked = true;
        warn!(
            "kernel version{} is {major}.{minor}, and the processor is hybrid with no E-cores \
             or all E-cores disabled. Kernel versions prior to 6.5 report incorrect sysfs CPU \
             frequencies on such systems (fixed by commit 0fcfc9e51990)",
            self.sysfs.borrow().executor().hostmsg()
        );
    }

    fn read_khz_file(&mut self, cpus: &[u32], fname: &str, what: &str) -> Result<Vec<(u32, u64)>> {
        self.warn_no_ecores_bug();
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let path = self.policy_path(cpu, fname);
            let khz = self
                .sysfs
                .borrow_mut()
                .read_int(&path, &format!("{what} for CPU {cpu}"))?;
            result.push((cpu, khz * 1000));
        }
        Ok(result)
    }

    /// Minimum frequency (`scaling_min_freq`), Hz.
    pub fn get_min_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_khz_file(cpus, "scaling_min_freq", "min. CPU frequency")
    }

    /// Maximum frequency (`scaling_max_freq`), Hz.
    pub fn get_max_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_khz_file(cpus, "scaling_max_freq", "max. CPU frequency")
    }

    /// Current frequency (`scaling_cur_freq`), Hz.
    pub fn get_cur_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_khz_file(cpus, "scaling_cur_freq", "current CPU frequency")
    }

    /// Minimum frequency limit (`cpuinfo_min_freq`), Hz.
    pub fn get_min_freq_limit(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_khz_file(cpus, "cpuinfo_min_freq", "min. CPU frequency limit")
    }

    /// Maximum frequency limit (`cpuinfo_max_freq`), Hz.
    pub fn get_max_freq_limit(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        self.read_khz_file(cpus, "cpuinfo_max_freq", "max. CPU frequency limit")
    }

    fn set_freq(&mut self, freq: u64, fname: &str, what: &str, cpus: &[u32]) -> Result<()> {
        self.warn_no_ecores_bug();

        for &cpu in cpus {
            let path = self.policy_path(cpu, fname);
            if !self.verify {
                self.sysfs.borrow_mut().write_int(&path, freq / 1000, what)?;
                continue;
            }

            // On Intel systems with HWP enabled the change may not land
            // immediately; retry the verification with small sleeps.
            let (retries, sleep) = if self.cpuinfo.is_intel()
                && self
                    .cpuinfo
                    .cpu_flags(cpu)
                    .map(|flags| flags.contains("hwp"))
                    .unwrap_or(false)
            {
                (VERIFY_RETRIES, VERIFY_SLEEP)
            } else {
                (0, Duration::ZERO)
            };

            self.sysfs
                .borrow_mut()
                .write_verify_int(&path, freq / 1000, what, retries, sleep)
                .map_err(|err| match err {
                    // kHz in the file, Hz at this layer: rescale the
                    // structured payload along with the message.
                    Error::VerifyFailed {
                        msg,
                        expected,
                        actual,
                        path,
                        ..
                    } => Error::VerifyFailed {
                        msg,
                        cpu: Some(cpu),
                        expected: expected * 1000,
                        actual: actual.saturating_mul(1000),
                        path,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Set the minimum frequency, Hz.
    pub fn set_min_freq(&mut self, freq: u64, cpus: &[u32]) -> Result<()> {
        self.set_freq(freq, "scaling_min_freq", "min. CPU frequency", cpus)
    }

    /// Set the maximum frequency, Hz.
    pub fn set_max_freq(&mut self, freq: u64, cpus: &[u32]) -> Result<()> {
        self.set_freq(freq, "scaling_max_freq", "max. CPU frequency", cpus)
    }

    /// The frequencies the driver accepts (`scaling_available_frequencies`,
    /// provided by acpi-cpufreq but not intel_pstate), Hz, ascending.
    pub fn get_available_frequencies(&mut self, cpus: &[u32]) -> Result<Vec<(u32, Vec<u64>)>> {
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let path = self.policy_path(cpu, "scaling_available_frequencies");
            let text = self
                .sysfs
                .borrow_mut()
                .read(&path, "available CPU frequencies")?;

            let mut freqs = Vec::new();
            for token in text.split_whitespace() {
                let khz = token.parse::<u64>().map_err(|_| {
                    Error::BadValue(format!(
                        "bad contents of file '{}': expected integer kHz values, got '{token}'",
                        path.display()
                    ))
                })?;
                freqs.push(khz * 1000);
            }
            freqs.sort_unstable();
            result.push((cpu, freqs));
        }
        Ok(result)
    }

    /// Base frequency, Hz: the intel_pstate `base_frequency` attribute,
    /// falling back to `bios_limit`.
    pub fn get_base_freq(&mut self, cpus: &[u32]) -> Result<Vec<(u32, u64)>> {
        match self.read_khz_file(cpus, "base_frequency", "base frequency") {
            Ok(result) => Ok(result),
            Err(err1) if err1.is_not_supported() => {
                match self.read_khz_file(cpus, "bios_limit", "base frequency") {
                    Ok(result) => Ok(result),
                    Err(err2) if err2.is_not_supported() => {
                        Err(Error::NotSupported(format!("{err1}\n{err2}")))
                    }
                    Err(err2) => Err(err2),
                }
            }
            Err(err1) => Err(err1),
        }
    }

    /// The Linux CPU frequency driver name. The intel_pstate driver calls
    /// itself "intel_cpufreq" in passive mode; both report as
    /// "intel_pstate" here.
    pub fn get_driver(&mut self, cpus: &[u32]) -> Result<Vec<(u32, String)>> {
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let path = self.policy_path(cpu, "scaling_driver");
            let read_result = self.sysfs.borrow_mut().read(&path, "CPU frequency driver name");
            let name = match read_result {
                Ok(name) => {
                    if name == "intel_cpufreq" {
                        "intel_pstate".to_string()
                    } else {
                        name
                    }
                }
                Err(err) if err.is_not_supported() => {
                    // With intel_pstate in "off" mode the 'scaling_driver'
                    // file does not exist, but the driver directory does.
                    let pstate_dir = self.base.join("intel_pstate");
                    if !self.sysfs.borrow().executor().exists(&pstate_dir) {
                        return Err(err);
                    }
                    "intel_pstate".to_string()
                }
                Err(err) => return Err(err),
            };
            result.push((cpu, name));
        }
        Ok(result)
    }

    /// The `intel_pstate` driver mode. Fails `NotSupported` when another
    /// driver is active.
    pub fn get_intel_pstate_mode(&mut self, cpus: &[u32]) -> Result<Vec<(u32, IntelPstateMode)>> {
        let path = self.base.join("intel_pstate").join("status");
        let mut result = Vec::with_capacity(cpus.len());
        for (cpu, driver) in self.get_driver(cpus)? {
            if driver != "intel_pstate" {
                return Err(Error::NotSupported(format!(
                    "failed to get 'intel_pstate' driver mode for CPU {cpu}{}: current driver \
                     is '{driver}'",
                    self.sysfs.borrow().executor().hostmsg()
                )));
            }
            let mode = self.sysfs.borrow_mut().read(&path, "'intel_pstate' driver mode")?;
            result.push((cpu, IntelPstateMode::from_str(&mode)?));
        }
        Ok(result)
    }

    fn hwp_enabled(&self, cpu: u32) -> Result<bool> {
        let pmenable = pm_enable::new(&self.cpuinfo, &self.msr)?;
        pmenable.is_cpu_feature_enabled("hwp", cpu)
    }

    /// Set the `intel_pstate` driver mode.
    pub fn set_intel_pstate_mode(&mut self, mode: IntelPstateMode, cpus: &[u32]) -> Result<()> {
        let path = self.base.join("intel_pstate").join("status");
        let what = "'intel_pstate' driver mode";

        for (cpu, driver) in self.get_driver(cpus)? {
            if driver != "intel_pstate" {
                return Err(Error::NotSupported(format!(
                    "failed to set 'intel_pstate' driver mode to '{mode}' for CPU {cpu}{}: \
                     current driver is '{driver}'",
                    self.sysfs.borrow().executor().hostmsg()
                )));
            }

            let curmode = self.get_intel_pstate_mode(&[cpu])?[0].1;
            let write_result = self.sysfs.borrow_mut().write(&path, mode.name(), what);
            if let Err(err) = write_result {
                if mode != IntelPstateMode::Off {
                    return Err(err);
                }
                if curmode == IntelPstateMode::Off {
                    // Writing "off" while already off errors out; ignore.
                    continue;
                }
                // Mode "off" only exists in non-HWP (legacy) operation.
                match self.hwp_enabled(cpu) {
                    Ok(true) => {
                        return Err(Error::NotSupported(format!(
                            "'intel_pstate' driver does not support \"off\" mode when hardware \
                             power management (HWP) is enabled:\n  {err}"
                        )))
                    }
                    _ => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Turbo on/off status. The knob location depends on the driver:
    /// `intel_pstate/no_turbo` (inverted) vs `cpufreq/boost`.
    pub fn get_turbo(&mut self, cpus: &[u32]) -> Result<Vec<(u32, bool)>> {
        let what = "turbo on/off status";
        let pstate_path = self.base.join("intel_pstate").join("no_turbo");
        let boost_path = self.base.join("cpufreq").join("boost");

        let mut result = Vec::with_capacity(cpus.len());
        for (cpu, driver) in self.get_driver(cpus)? {
            let enabled = match driver.as_str() {
                "intel_pstate" => {
                    let read_result = self.sysfs.borrow_mut().read_int(&pstate_path, what);
                    match read_result {
                        Ok(disabled) => disabled == 0,
                        Err(err) => {
                            let mode = self.get_intel_pstate_mode(&[cpu]).ok().map(|modes| modes[0].1);
                            if mode == Some(IntelPstateMode::Off) {
                                return Err(Error::NotSupported(format!(
                                    "turbo is not supported when the 'intel_pstate' driver is \
                                     in 'off' mode:\n  {err}"
                                )));
                            }
                            return Err(err);
                        }
                    }
                }
                "acpi-cpufreq" => self.sysfs.borrow_mut().read_int(&boost_path, what)? != 0,
                _ => {
                    return Err(Error::NotSupported(format!(
                        "can't check if turbo is enabled for CPU {cpu}{}: unsupported CPU \
                         frequency driver '{driver}'",
                        self.sysfs.borrow().executor().hostmsg()
                    )))
                }
            };
            result.push((cpu, enabled));
        }
        Ok(result)
    }

    /// Enable or disable turbo.
    pub fn set_turbo(&mut self, enable: bool, cpus: &[u32]) -> Result<()> {
        let what = "turbo on/off status";
        let pstate_path = self.base.join("intel_pstate").join("no_turbo");
        let boost_path = self.base.join("cpufreq").join("boost");

        for (cpu, driver) in self.get_driver(cpus)? {
            match driver.as_str() {
                "intel_pstate" => {
                    let val = u64::from(!enable);
                    let write_result = self.sysfs.borrow_mut().write_int(&pstate_path, val, what);
                    if let Err(err) = write_result {
                        let mode = self.get_intel_pstate_mode(&[cpu]).ok().map(|modes| modes[0].1);
                        if mode == Some(IntelPstateMode::Off) {
                            return Err(Error::NotSupported(format!(
                                "turbo is not supported when the 'intel_pstate' driver is in \
                                 'off' mode:\n  {err}"
                            )));
                        }
                        return Err(err);
                    }
                }
                "acpi-cpufreq" => {
                    self.sysfs.borrow_mut().write_int(&boost_path, u64::from(enable), what)?;
                }
                _ => {
                    let status = if enable { "on" } else { "off" };
                    return Err(Error::NotSupported(format!(
                        "failed to switch turbo {status} for CPU {cpu}{}: unsupported CPU \
                         frequency driver '{driver}'",
                        self.sysfs.borrow().executor().hostmsg()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Current frequency governor.
    pub fn get_governor(&mut self, cpus: &[u32]) -> Result<Vec<(u32, String)>> {
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let path = self.policy_path(cpu, "scaling_governor");
            let name = self.sysfs.borrow_mut().read(&path, "CPU frequency governor")?;
            result.push((cpu, name));
        }
        Ok(result)
    }

    /// Available frequency governors.
    pub fn get_available_governors(&mut self, cpus: &[u32]) -> Result<Vec<(u32, Vec<String>)>> {
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let path = self.policy_path(cpu, "scaling_available_governors");
            let names = self
                .sysfs
                .borrow_mut()
                .read(&path, "available CPU frequency governors")?;
            result.push((cpu, names.split_whitespace().map(str::to_string).collect()));
        }
        Ok(result)
    }

    /// Set the frequency governor. The name is validated against
    /// `scaling_available_governors`.
    pub fn set_governor(&mut self, governor: &str, cpus: &[u32]) -> Result<()> {
        for (cpu, governors) in self.get_available_governors(cpus)? {
            if !governors.iter().any(|name| name == governor) {
                return Err(Error::BadValue(format!(
                    "bad governor name '{governor}' for CPU {cpu}{}, use one of: {}",
                    self.sysfs.borrow().executor().hostmsg(),
                    governors.join(", ")
                )));
            }
            let path = self.policy_path(cpu, "scaling_governor");
            self.sysfs.borrow_mut().write(&path, governor, "CPU frequency governor")?;
        }
        Ok(())
    }
}
