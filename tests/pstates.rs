// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PStates orchestrator tests over an emulated Granite Rapids system.

use std::path::Path;
use std::rc::Rc;

use base::cpumodel;
use base::testing;
use base::DirEntryInfo;
use base::EmulExecutor;
use base::Error;
use base::Executor;
use base::Result;
use base::RunResult;
use msr::regs;
use pmctl::Mechanism;
use pmctl::PStates;
use pmctl::PropertyValue;

fn write_msr(exec: &EmulExecutor, cpu: u32, regaddr: u32, regval: u64) {
    exec.write_bytes_at(
        Path::new(&format!("/dev/cpu/{cpu}/msr")),
        regaddr as u64,
        &regval.to_le_bytes(),
    )
    .unwrap();
}

// An emulated Granite Rapids host with HWP on: HWP request min=800MHz
// max=2GHz, capabilities lowest=8/guaranteed=20/highest=35, platform info
// min_oper_ratio=8.
fn gnr_exec() -> Rc<EmulExecutor> {
    let exec = Rc::new(EmulExecutor::new());
    for cpu in 0..16u32 {
        exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        write_msr(&exec, cpu, regs::pm_enable::MSR_PM_ENABLE, 1);
        write_msr(
            &exec,
            cpu,
            regs::hwp_capabilities::MSR_HWP_CAPABILITIES,
            (8u64 << 24) | (12 << 16) | (20 << 8) | 35,
        );
        write_msr(&exec, cpu, regs::hwp_request::MSR_HWP_REQUEST, (20 << 8) | 8);
        write_msr(
            &exec,
            cpu,
            regs::platform_info::MSR_PLATFORM_INFO,
            (8u64 << 48) | (12u64 << 40) | (20 << 8),
        );
    }
    exec
}

fn pstates_with(exec: Rc<EmulExecutor>) -> PStates {
    let cpuinfo = Rc::new(testing::cpu_info_with_flags(
        cpumodel::GRANITERAPIDS_X,
        &["hwp", "hwp_epp", "epb"],
    ));
    PStates::new(cpuinfo, exec as Rc<dyn Executor>, true)
}

#[test]
fn sysfs_mechanism_preferred_for_frequencies() {
    let exec = gnr_exec();
    exec.add_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq", "1000000");
    let mut pstates = pstates_with(exec);

    assert_eq!(
        pstates.get_prop_cpus("min_freq", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(1_000_000_000))]
    );
}

#[test]
fn msr_mechanism_serves_when_sysfs_is_missing() {
    let mut pstates = pstates_with(gnr_exec());

    // No cpufreq sysfs files at all: min_freq falls through to the MSR.
    assert_eq!(
        pstates.get_prop_cpus("min_freq", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(800_000_000))]
    );
    // base_freq: sysfs -> cppc -> msr (guaranteed performance).
    assert_eq!(
        pstates.get_prop_cpus("base_freq", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(2_000_000_000))]
    );
    // Explicit mechanism restriction is honored.
    let err = pstates
        .get_prop_cpus("min_freq", Some(&[0]), Some(&[Mechanism::Sysfs]))
        .unwrap_err();
    assert!(err.is_not_supported());
}

#[test]
fn bus_clock_rotates_to_doc_mechanism() {
    let mut pstates = pstates_with(gnr_exec());
    // No MSR_FSB_FREQ on Granite Rapids: "msr" is unsupported and "doc"
    // reports the architectural 100MHz.
    assert_eq!(
        pstates.get_prop_cpus("bus_clock", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(100_000_000))]
    );
}

#[test]
fn hwp_and_perf_levels() {
    let mut pstates = pstates_with(gnr_exec());
    assert_eq!(
        pstates.get_prop_cpus("hwp", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Bool(true))]
    );
    assert_eq!(
        pstates.get_prop_cpus("hwp_highest_perf", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(35))]
    );
    assert_eq!(
        pstates.get_prop_cpus("max_turbo_freq", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(3_500_000_000))]
    );
}

#[test]
fn governor_round_trip() {
    let exec = gnr_exec();
    exec.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
        "powersave",
    );
    exec.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors",
        "performance powersave",
    );
    let mut pstates = pstates_with(exec);

    // Setting the current value is accepted and reads back unchanged.
    pstates
        .set_prop_cpus(
            "governor",
            &PropertyValue::Str("powersave".to_string()),
            Some(&[0]),
            None,
        )
        .unwrap();
    assert_eq!(
        pstates.get_prop_cpus("governor", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Str("powersave".to_string()))]
    );
}

#[test]
fn freq_order_violations_surface() {
    let mut pstates = pstates_with(gnr_exec());

    // Current max is 2GHz (MSR mechanism; no sysfs interface emulated).
    let err = pstates
        .set_prop_cpus("min_freq", &PropertyValue::Int(2_500_000_000), Some(&[0]), None)
        .unwrap_err();
    assert!(matches!(err, Error::BadOrder(_)));

    let err = pstates
        .set_prop_cpus("min_freq", &PropertyValue::Int(5_000_000_000), Some(&[0]), None)
        .unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)));

    pstates
        .set_prop_cpus("min_freq", &PropertyValue::Int(1_200_000_000), Some(&[0]), None)
        .unwrap();
    assert_eq!(
        pstates.get_prop_cpus("min_freq", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(1_200_000_000))]
    );
}

#[test]
fn epp_via_msr_and_read_only_props() {
    let mut pstates = pstates_with(gnr_exec());

    pstates
        .set_prop_cpus("epp", &PropertyValue::Int(128), Some(&[0]), None)
        .unwrap();
    assert_eq!(
        pstates.get_prop_cpus("epp", Some(&[0]), Some(&[Mechanism::Msr])).unwrap(),
        vec![(0, PropertyValue::Int(128))]
    );

    let err = pstates
        .set_prop_cpus("base_freq", &PropertyValue::Int(1), Some(&[0]), None)
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    assert!(pstates.get_prop_cpus("no_such_prop", None, None).is_err());
}

#[test]
fn epb_via_sysfs_then_msr() {
    let exec = gnr_exec();
    exec.add_file("/sys/devices/system/cpu/cpu0/power/energy_perf_bias", "6");
    let mut pstates = pstates_with(exec);

    assert_eq!(
        pstates.get_prop_cpus("epb", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(6))]
    );

    pstates
        .set_prop_cpus("epb", &PropertyValue::Int(15), Some(&[0]), None)
        .unwrap();
    assert_eq!(
        pstates.get_prop_cpus("epb", Some(&[0]), None).unwrap(),
        vec![(0, PropertyValue::Int(15))]
    );

    let err = pstates
        .set_prop_cpus("epb", &PropertyValue::Int(16), Some(&[0]), None)
        .unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));
}

// An executor that silently drops writes to one path, modeling a kernel
// that rejects the value.
struct PinnedFileExec {
    inner: Rc<EmulExecutor>,
    pinned_suffix: &'static str,
}

impl Executor for PinnedFileExec {
    fn read(&self, path: &Path) -> Result<String> {
        self.inner.read(path)
    }
    fn write(&self, path: &Path, data: &str) -> Result<()> {
        if path.to_string_lossy().ends_with(self.pinned_suffix) {
            return Ok(());
        }
        self.inner.write(path, data)
    }
    fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.read_bytes_at(path, pos, len)
    }
    fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()> {
        self.inner.write_bytes_at(path, pos, data)
    }
    fn lsdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        self.inner.lsdir(path)
    }
    fn run(&self, cmd: &str) -> Result<RunResult> {
        self.inner.run(cmd)
    }
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
    fn is_emulated(&self) -> bool {
        true
    }
    fn hostmsg(&self) -> &str {
        ""
    }
}

#[test]
fn freq_verify_mismatch_is_enriched_with_frequency_list() {
    let inner = gnr_exec();
    inner.add_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq", "1200000");
    inner.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_frequencies",
        "800000 1200000 2000000",
    );

    let exec = Rc::new(PinnedFileExec {
        inner,
        pinned_suffix: "scaling_min_freq",
    });
    let cpuinfo = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
    let mut pstates = PStates::new(cpuinfo, exec as Rc<dyn Executor>, true);

    // The kernel keeps 1.2GHz; 1GHz is not in the accepted list.
    let err = pstates
        .set_prop_cpus("min_freq", &PropertyValue::Int(1_000_000_000), Some(&[0]), None)
        .unwrap_err();
    match err {
        Error::VerifyFailed {
            msg,
            expected,
            actual,
            ..
        } => {
            assert_eq!(expected, 1_000_000_000);
            assert_eq!(actual, 1_200_000_000);
            assert!(msg.contains("use one of the following values"), "message: {msg}");
            assert!(msg.contains("800MHz"), "message: {msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// An executor that rejects writes to one path with an I/O error.
struct RejectingFileExec {
    inner: Rc<EmulExecutor>,
    rejected_suffix: &'static str,
}

impl Executor for RejectingFileExec {
    fn read(&self, path: &Path) -> Result<String> {
        self.inner.read(path)
    }
    fn write(&self, path: &Path, data: &str) -> Result<()> {
        if path.to_string_lossy().ends_with(self.rejected_suffix) {
            return Err(Error::Io("write refused by the kernel".to_string()));
        }
        self.inner.write(path, data)
    }
    fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.read_bytes_at(path, pos, len)
    }
    fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()> {
        self.inner.write_bytes_at(path, pos, data)
    }
    fn lsdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        self.inner.lsdir(path)
    }
    fn run(&self, cmd: &str) -> Result<RunResult> {
        self.inner.run(cmd)
    }
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
    fn is_emulated(&self) -> bool {
        true
    }
    fn hostmsg(&self) -> &str {
        ""
    }
}

#[test]
fn epp_set_failure_explains_performance_governor() {
    let inner = gnr_exec();
    inner.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/energy_performance_preference",
        "performance",
    );
    inner.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_driver",
        "intel_pstate",
    );
    inner.add_file("/sys/devices/system/cpu/intel_pstate/status", "active");
    inner.add_file(
        "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
        "performance",
    );

    let exec = Rc::new(RejectingFileExec {
        inner,
        rejected_suffix: "energy_performance_preference",
    });
    let cpuinfo = Rc::new(testing::cpu_info_with_flags(
        cpumodel::GRANITERAPIDS_X,
        &["hwp", "hwp_epp"],
    ));
    let mut pstates = PStates::new(cpuinfo, exec as Rc<dyn Executor>, true);

    let err = pstates
        .set_prop_cpus(
            "epp",
            &PropertyValue::Str("balance_power".to_string()),
            Some(&[0]),
            Some(&[Mechanism::Sysfs]),
        )
        .unwrap_err();
    assert!(
        err.to_string().contains("'performance' governor"),
        "message: {err}"
    );
}
