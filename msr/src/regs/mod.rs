// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-register feature tables. One module per MSR; each exposes the MSR
//! address constant and a constructor returning the `FeaturedMsr` with the
//! table resolved for the target CPU.

use std::cell::RefCell;
use std::rc::Rc;

use base::CpuInfo;
use base::Result;
use base::Scope;

use crate::FeaturedMsr;
use crate::MsrEngine;

pub mod energy_perf_bias;
pub mod fsb_freq;
pub mod hwp_capabilities;
pub mod hwp_request;
pub mod hwp_request_pkg;
pub mod pkg_cstate_config;
pub mod platform_info;
pub mod pm_enable;
pub mod rapl_power_unit;
pub mod turbo_ratio_limit;

/// The HWP MSRs exist whenever the CPU advertises the "hwp" flag, but their
/// contents are meaningless until `MSR_PM_ENABLE.hwp` is set. Mark every
/// hwp-flagged feature unsupported on packages where HWP is off. One CPU per
/// package is probed; HWP enablement is package-wide.
fn apply_hwp_gate(
    fmsr: &mut FeaturedMsr,
    cpuinfo: &Rc<CpuInfo>,
    msr: &Rc<RefCell<MsrEngine>>,
) -> Result<()> {
    let mut unsupported: Vec<u32> = Vec::new();

    for &package in cpuinfo.packages() {
        let cpus = cpuinfo.package_cpus(package)?;
        let probe = cpus[0];

        let has_flag = cpuinfo
            .cpu_flags(probe)
            .map(|flags| flags.contains("hwp"))
            .unwrap_or(false);
        if has_flag {
            let hwp_on = msr.borrow_mut().read_cpu_bits(
                pm_enable::MSR_PM_ENABLE,
                pm_enable::HWP_BITS,
                probe,
                Scope::Cpu,
            )?;
            if hwp_on != 0 {
                continue;
            }
        }

        unsupported.extend(cpus);
    }

    if unsupported.is_empty() {
        return Ok(());
    }

    for fname in fmsr.feature_names() {
        if fmsr.feature_def(fname)?.cpuflags.contains(&"hwp") {
            fmsr.mark_unsupported(fname, &unsupported)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::cpumodel;
    use base::testing;
    use base::EmulExecutor;
    use base::Executor;

    use crate::engine::bits_max;

    fn engine_for(vfm: u32, flags: &[&str]) -> (Rc<CpuInfo>, Rc<RefCell<MsrEngine>>) {
        let exec = Rc::new(EmulExecutor::new());
        for cpu in 0..16u32 {
            let mut msrdev = vec![0u8; 4096];
            msrdev[pm_enable::MSR_PM_ENABLE as usize] = 1;
            exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &msrdev);
        }
        let cpuinfo = Rc::new(testing::cpu_info_with_flags(vfm, flags));
        let msr = Rc::new(RefCell::new(MsrEngine::new(
            cpuinfo.clone(),
            exec as Rc<dyn Executor>,
            true,
        )));
        (cpuinfo, msr)
    }

    // Every enumerated value of every feature must be representable in the
    // feature's bit range.
    #[test]
    fn enumerated_values_fit_bit_ranges() {
        let (cpuinfo, msr) = engine_for(
            cpumodel::GRANITERAPIDS_X,
            &["hwp", "hwp_epp", "hwp_pkg_req", "epb"],
        );

        let tables = [
            platform_info::new(&cpuinfo, &msr).unwrap(),
            pm_enable::new(&cpuinfo, &msr).unwrap(),
            hwp_request::new(&cpuinfo, &msr).unwrap(),
            hwp_request_pkg::new(&cpuinfo, &msr).unwrap(),
            hwp_capabilities::new(&cpuinfo, &msr).unwrap(),
            turbo_ratio_limit::new(&cpuinfo, &msr).unwrap(),
            energy_perf_bias::new(&cpuinfo, &msr).unwrap(),
            rapl_power_unit::new(&cpuinfo, &msr).unwrap(),
            pkg_cstate_config::new(&cpuinfo, &msr).unwrap(),
        ];

        for fmsr in &tables {
            for fname in fmsr.feature_names() {
                let def = fmsr.feature_def(fname).unwrap();
                let Some(bits) = def.bits else {
                    continue;
                };
                let max = bits_max(bits);
                for (symbol, code) in &def.vals {
                    assert!(
                        *code <= max,
                        "{}: value '{symbol}' ({code:#x}) does not fit bits {}:{}",
                        fmsr.regname(),
                        bits.0,
                        bits.1
                    );
                }
                for (value, code) in &def.fvals {
                    assert!(
                        *code <= max,
                        "{}: value '{value}' ({code:#x}) does not fit bits {}:{}",
                        fmsr.regname(),
                        bits.0,
                        bits.1
                    );
                }
            }
        }
    }

    // Bit ranges must stay within the 64-bit register.
    #[test]
    fn bit_ranges_are_well_formed() {
        let (cpuinfo, msr) = engine_for(cpumodel::ATOM_SILVERMONT, &["hwp", "epb"]);

        let tables = [
            fsb_freq::new(&cpuinfo, &msr).unwrap(),
            energy_perf_bias::new(&cpuinfo, &msr).unwrap(),
        ];

        for fmsr in &tables {
            for fname in fmsr.feature_names() {
                let def = fmsr.feature_def(fname).unwrap();
                if let Some((msb, lsb)) = def.bits {
                    assert!(lsb <= msb && msb < 64, "{}/{fname}", fmsr.regname());
                }
            }
        }
    }

    #[test]
    fn scope_adjustments() {
        // Silvermont: FSB is module-scoped, EPB core-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::ATOM_SILVERMONT, &["epb"]);
        let fsb = fsb_freq::new(&cpuinfo, &msr).unwrap();
        assert_eq!(fsb.feature_def("fsb").unwrap().sname, Scope::Module);
        let epb = energy_perf_bias::new(&cpuinfo, &msr).unwrap();
        assert_eq!(epb.feature_def("epb").unwrap().sname, Scope::Core);

        // Granite Rapids: EPB is CPU-scoped, platform info package-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::GRANITERAPIDS_X, &["epb"]);
        let epb = energy_perf_bias::new(&cpuinfo, &msr).unwrap();
        assert_eq!(epb.feature_def("epb").unwrap().sname, Scope::Cpu);
        let platinfo = platform_info::new(&cpuinfo, &msr).unwrap();
        assert_eq!(
            platinfo.feature_def("max_non_turbo_ratio").unwrap().sname,
            Scope::Package
        );

        // Cascade Lake-AP (Skylake-X with two dies per package): package
        // MSRs behave as die-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::SKYLAKE_X, &[]);
        let platinfo = platform_info::new(&cpuinfo, &msr).unwrap();
        assert_eq!(
            platinfo.feature_def("max_non_turbo_ratio").unwrap().sname,
            Scope::Die
        );
    }

    #[test]
    fn pkg_cstate_scope_adjustments() {
        // Granite Rapids: the limit acts package-wide through a core-scoped
        // register copy; C1 demotion stays core-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::GRANITERAPIDS_X, &[]);
        let pcc = pkg_cstate_config::new(&cpuinfo, &msr).unwrap();
        let limit = pcc.feature_def("pkg_cstate_limit").unwrap();
        assert_eq!(limit.sname, Scope::Package);
        assert_eq!(limit.iosname, Scope::Core);
        let c1d = pcc.feature_def("c1_demotion").unwrap();
        assert_eq!(c1d.sname, Scope::Core);
        assert_eq!(c1d.iosname, Scope::Core);

        // Sapphire Rapids and Ice Lake Xeons: C1 demotion also acts
        // package-wide.
        for vfm in [cpumodel::SAPPHIRERAPIDS_X, cpumodel::ICELAKE_X] {
            let (cpuinfo, msr) = engine_for(vfm, &[]);
            let pcc = pkg_cstate_config::new(&cpuinfo, &msr).unwrap();
            let c1d = pcc.feature_def("c1_demotion").unwrap();
            assert_eq!(c1d.sname, Scope::Package);
            assert_eq!(c1d.iosname, Scope::Core);
            let c1u = pcc.feature_def("c1_undemotion").unwrap();
            assert_eq!(c1u.sname, Scope::Package);
        }

        // Silvermont: the register copy is module-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::ATOM_SILVERMONT, &[]);
        let pcc = pkg_cstate_config::new(&cpuinfo, &msr).unwrap();
        let c1d = pcc.feature_def("c1_demotion").unwrap();
        assert_eq!(c1d.sname, Scope::Module);
        assert_eq!(c1d.iosname, Scope::Module);

        // Xeon Phi: the register copy is package-scoped.
        let (cpuinfo, msr) = engine_for(cpumodel::XEON_PHI_KNL, &[]);
        let pcc = pkg_cstate_config::new(&cpuinfo, &msr).unwrap();
        let limit = pcc.feature_def("pkg_cstate_limit").unwrap();
        assert_eq!(limit.iosname, Scope::Package);
        let c1d = pcc.feature_def("c1_demotion").unwrap();
        assert_eq!(c1d.sname, Scope::Package);
        assert_eq!(c1d.iosname, Scope::Package);
    }
}
