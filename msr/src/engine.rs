// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw MSR read/write with write-through caching, scope optimization, and
//! transaction batching.
//!
//! MSRs are exposed by the kernel as per-CPU character devices
//! (`/dev/cpu/<n>/msr`) accepting little-endian 8-byte I/O at byte offset =
//! MSR address. Many MSRs are shared by a group of CPUs (a core, a die, a
//! package); reading one CPU of the group suffices for all of them, and the
//! cache exploits that.
//!
//! Not thread-safe: single-threaded use only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use base::CpuInfo;
use base::Error;
use base::Executor;
use base::Result;
use base::Scope;
use log::debug;

use crate::PerCpuCache;

/// MSR register width in bytes.
pub const REG_BYTES: usize = 8;

/// Extract an inclusive bit range from a register value. `bits` is
/// `(msb, lsb)` with `msb >= lsb`.
pub fn get_bits(regval: u64, bits: (u32, u32)) -> u64 {
    let (msb, lsb) = bits;
    debug_assert!(lsb <= msb && msb < 64);
    ((regval as u128 >> lsb) & ((1u128 << (msb - lsb + 1)) - 1)) as u64
}

/// Return `regval` with the inclusive bit range `bits` replaced by `val`.
pub fn set_bits(regval: u64, bits: (u32, u32), val: u64) -> u64 {
    let (msb, lsb) = bits;
    debug_assert!(lsb <= msb && msb < 64);
    let mask = bits_mask(bits);
    (regval & !mask) | ((val << lsb) & mask)
}

/// The mask covering the inclusive bit range `bits`.
pub fn bits_mask(bits: (u32, u32)) -> u64 {
    let (msb, lsb) = bits;
    (((1u128 << (msb + 1)) - 1) ^ ((1u128 << lsb) - 1)) as u64
}

/// The maximum value representable in the inclusive bit range `bits`.
pub fn bits_max(bits: (u32, u32)) -> u64 {
    let (msb, lsb) = bits;
    ((1u128 << (msb - lsb + 1)) - 1) as u64
}

#[derive(Clone, Copy, Debug)]
struct PendingWrite {
    regval: u64,
    verify: bool,
    iosname: Scope,
}

/// The MSR access engine.
pub struct MsrEngine {
    exec: Rc<dyn Executor>,
    cpuinfo: Rc<CpuInfo>,
    cache: PerCpuCache,
    enable_cache: bool,
    enable_scope: bool,
    // Transaction buffer plus its insertion order: the flush writes in the
    // order the writes were queued.
    tbuf: HashMap<(u32, u32), PendingWrite>,
    tbuf_order: Vec<(u32, u32)>,
    in_transaction: bool,
}

impl MsrEngine {
    /// Create an engine. With `enable_cache` the first read of an MSR
    /// fetches from hardware and subsequent reads hit the cache; writes
    /// update the cache and propagate immediately (write-through).
    pub fn new(cpuinfo: Rc<CpuInfo>, exec: Rc<dyn Executor>, enable_cache: bool) -> MsrEngine {
        // Captured dumps do not model MSR scope: with an emulated executor
        // every CPU gets its own I/O and the cache stays per-CPU.
        let enable_scope = !exec.is_emulated();
        let cache = PerCpuCache::new(cpuinfo.clone(), enable_cache, enable_scope);
        MsrEngine {
            exec,
            cpuinfo,
            cache,
            enable_cache,
            enable_scope,
            tbuf: HashMap::new(),
            tbuf_order: Vec::new(),
            in_transaction: false,
        }
    }

    pub fn cpuinfo(&self) -> &Rc<CpuInfo> {
        &self.cpuinfo
    }

    pub fn executor(&self) -> &Rc<dyn Executor> {
        &self.exec
    }

    fn msr_path(cpu: u32) -> PathBuf {
        PathBuf::from(format!("/dev/cpu/{cpu}/msr"))
    }

    fn hw_read(&self, regaddr: u32, cpu: u32) -> Result<u64> {
        let path = Self::msr_path(cpu);
        let bytes = self
            .exec
            .read_bytes_at(&path, regaddr as u64, REG_BYTES)
            .map_err(|err| annotate_msr_err(err, regaddr, cpu, &path))?;
        let mut buf = [0u8; REG_BYTES];
        buf.copy_from_slice(&bytes);
        let regval = u64::from_le_bytes(buf);
        debug!(
            "CPU{}: MSR {:#x}: read {:#x}{}",
            cpu,
            regaddr,
            regval,
            self.exec.hostmsg()
        );
        Ok(regval)
    }

    fn hw_write(&self, regaddr: u32, regval: u64, cpu: u32) -> Result<()> {
        let path = Self::msr_path(cpu);
        self.exec
            .write_bytes_at(&path, regaddr as u64, &regval.to_le_bytes())
            .map_err(|err| annotate_msr_err(err, regaddr, cpu, &path))?;
        debug!(
            "CPU{}: MSR {:#x}: wrote {:#x}{}",
            cpu,
            regaddr,
            regval,
            self.exec.hostmsg()
        );
        Ok(())
    }

    fn read_internal(&mut self, regaddr: u32, cpus: &[u32], iosname: Scope) -> Result<Vec<(u32, u64)>> {
        let mut result = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let regval = if self.cache.is_cached(regaddr, cpu) {
                self.cache.get(regaddr, cpu)?
            } else {
                let regval = self.hw_read(regaddr, cpu)?;
                // Scope-aware: the value is cached for all 'iosname'
                // siblings, so one hardware access serves the whole group.
                self.cache.add(regaddr, cpu, regval, iosname)?;
                regval
            };
            result.push((cpu, regval));
        }
        Ok(result)
    }

    /// Read an MSR on the given CPUs (all CPUs when `cpus` is `None`).
    /// Returns `(cpu, value)` pairs in the order of the request.
    pub fn read(
        &mut self,
        regaddr: u32,
        cpus: Option<&[u32]>,
        iosname: Scope,
    ) -> Result<Vec<(u32, u64)>> {
        let cpus = self.cpuinfo.normalize_cpus(cpus)?;
        self.read_internal(regaddr, &cpus, iosname)
    }

    /// Read an MSR on one CPU.
    pub fn read_cpu(&mut self, regaddr: u32, cpu: u32, iosname: Scope) -> Result<u64> {
        Ok(self.read(regaddr, Some(&[cpu]), iosname)?[0].1)
    }

    /// Read a bit range of an MSR on the given CPUs.
    pub fn read_bits(
        &mut self,
        regaddr: u32,
        bits: (u32, u32),
        cpus: Option<&[u32]>,
        iosname: Scope,
    ) -> Result<Vec<(u32, u64)>> {
        Ok(self
            .read(regaddr, cpus, iosname)?
            .into_iter()
            .map(|(cpu, regval)| (cpu, get_bits(regval, bits)))
            .collect())
    }

    /// Read a bit range of an MSR on one CPU.
    pub fn read_cpu_bits(&mut self, regaddr: u32, bits: (u32, u32), cpu: u32, iosname: Scope) -> Result<u64> {
        Ok(get_bits(self.read_cpu(regaddr, cpu, iosname)?, bits))
    }

    fn verify(&mut self, regaddr: u32, regval: u64, cpus: &[u32], iosname: Scope) -> Result<()> {
        for &cpu in cpus {
            self.cache.remove(regaddr, cpu, iosname)?;
        }

        for (cpu, actual) in self.read_internal(regaddr, cpus, iosname)? {
            if actual != regval {
                return Err(Error::VerifyFailed {
                    msg: format!(
                        "verification failed for MSR {:#x} on CPU {}{}: wrote {:#x}, read {:#x} back",
                        regaddr,
                        cpu,
                        self.exec.hostmsg(),
                        regval,
                        actual
                    ),
                    cpu: Some(cpu),
                    expected: regval,
                    actual,
                    path: Some(Self::msr_path(cpu)),
                });
            }
        }
        Ok(())
    }

    fn queue_write(
        &mut self,
        regaddr: u32,
        regval: u64,
        cpu: u32,
        verify: bool,
        iosname: Scope,
    ) -> Result<()> {
        if !self.enable_cache {
            return Err(Error::BadValue(
                "transactions support requires caching to be enabled".to_string(),
            ));
        }

        let key = (cpu, regaddr);
        if let Some(pending) = self.tbuf.get(&key) {
            // Re-queued writes may only update the value. Conflicting scope
            // or verification flags for the same (cpu, MSR) pair indicate a
            // caller bug.
            if pending.iosname != iosname {
                return Err(Error::BadValue(format!(
                    "BUG: inconsistent I/O scope for MSR {:#x}: old '{}', new '{}'",
                    regaddr, pending.iosname, iosname
                )));
            }
            if pending.verify != verify {
                return Err(Error::BadValue(format!(
                    "BUG: inconsistent verification flag for MSR {:#x}",
                    regaddr
                )));
            }
        } else {
            self.tbuf_order.push(key);
        }
        self.tbuf.insert(
            key,
            PendingWrite {
                regval,
                verify,
                iosname,
            },
        );
        Ok(())
    }

    fn write_internal(
        &mut self,
        regaddr: u32,
        regval: u64,
        cpus: &[u32],
        iosname: Scope,
        verify: bool,
    ) -> Result<()> {
        // CPUs whose cached value already equals the desired value need no
        // I/O at all.
        let mut todo = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            if self.cache.is_cached(regaddr, cpu) && self.cache.get(regaddr, cpu)? == regval {
                continue;
            }
            todo.push(cpu);
        }

        for &cpu in &todo {
            self.cache.remove(regaddr, cpu, iosname)?;
        }

        // After the removal above, 'is_cached' returns false for every CPU
        // not yet covered by a scope-aware 'add' below, so each sibling
        // group gets exactly one hardware write.
        for &cpu in &todo {
            if self.cache.is_cached(regaddr, cpu) {
                continue;
            }

            if self.in_transaction {
                self.queue_write(regaddr, regval, cpu, verify, iosname)?;
            } else {
                self.hw_write(regaddr, regval, cpu)?;
            }

            self.cache.add(regaddr, cpu, regval, iosname)?;
        }

        // Within a transaction the verification happens after the flush.
        if verify && !self.in_transaction {
            self.verify(regaddr, regval, cpus, iosname)?;
        }
        Ok(())
    }

    /// Write `regval` to an MSR on the given CPUs. With `verify`, read the
    /// value back and fail `VerifyFailed` on a mismatch.
    pub fn write(
        &mut self,
        regaddr: u32,
        regval: u64,
        cpus: Option<&[u32]>,
        iosname: Scope,
        verify: bool,
    ) -> Result<()> {
        let cpus = self.cpuinfo.normalize_cpus(cpus)?;
        self.write_internal(regaddr, regval, &cpus, iosname, verify)
    }

    /// Write `regval` to an MSR on one CPU.
    pub fn write_cpu(&mut self, regaddr: u32, regval: u64, cpu: u32, iosname: Scope, verify: bool) -> Result<()> {
        self.write(regaddr, regval, Some(&[cpu]), iosname, verify)
    }

    /// Read-modify-write a bit range of an MSR on the given CPUs. CPUs whose
    /// register already holds the requested bits are skipped.
    pub fn write_bits(
        &mut self,
        regaddr: u32,
        bits: (u32, u32),
        val: u64,
        cpus: Option<&[u32]>,
        iosname: Scope,
        verify: bool,
    ) -> Result<()> {
        if val > bits_max(bits) {
            return Err(Error::BadValue(format!(
                "value {:#x} does not fit in bits {}:{} of MSR {:#x}",
                val, bits.0, bits.1, regaddr
            )));
        }

        // Group CPUs by the new register value so each value is written
        // with a single multi-CPU operation.
        let mut regvals: Vec<(u64, Vec<u32>)> = Vec::new();
        for (cpu, regval) in self.read(regaddr, cpus, iosname)? {
            let new_regval = set_bits(regval, bits, val);
            if new_regval == regval {
                debug!("CPU{}: MSR {:#x}: no change, skipping write", cpu, regaddr);
                continue;
            }
            match regvals.iter_mut().find(|(v, _)| *v == new_regval) {
                Some((_, group)) => group.push(cpu),
                None => regvals.push((new_regval, vec![cpu])),
            }
        }

        for (regval, group) in regvals {
            self.write_internal(regaddr, regval, &group, iosname, verify)
                .map_err(|err| {
                    let msg = format!(
                        "failed to set bits {}:{} of MSR {:#x} to {:#x} on CPUs {}{}:\n  {}",
                        bits.0,
                        bits.1,
                        regaddr,
                        val,
                        self.cpuinfo.cpus_str(&group),
                        self.exec.hostmsg(),
                        err
                    );
                    err.with_msg(msg)
                })?;
        }
        Ok(())
    }

    /// Read-modify-write a bit range of an MSR on one CPU.
    pub fn write_cpu_bits(
        &mut self,
        regaddr: u32,
        bits: (u32, u32),
        val: u64,
        cpu: u32,
        iosname: Scope,
        verify: bool,
    ) -> Result<()> {
        self.write_bits(regaddr, bits, val, Some(&[cpu]), iosname, verify)
    }

    /// Begin a transaction: until the commit, writes are buffered and
    /// multiple writes to the same `(CPU, MSR)` pair are merged. The cache
    /// is still updated immediately, so reads inside the transaction see
    /// the queued values. Transactions are an I/O optimization only; they
    /// provide no atomicity or rollback.
    pub fn start_transaction(&mut self) -> Result<()> {
        if !self.enable_cache {
            debug!("transactions support requires caching to be enabled");
            return Ok(());
        }
        if self.in_transaction {
            return Err(Error::BadValue(
                "cannot start a new transaction: a transaction is already in progress".to_string(),
            ));
        }
        self.in_transaction = true;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn flush_local(&mut self) -> Result<()> {
        for &(cpu, regaddr) in &self.tbuf_order {
            let pending = self.tbuf[&(cpu, regaddr)];
            self.hw_write(regaddr, pending.regval, cpu).map_err(|err| {
                let msg = format!(
                    "failed to write {:#x} to MSR {:#x} of CPU {}{}:\n  {}",
                    pending.regval,
                    regaddr,
                    cpu,
                    self.exec.hostmsg(),
                    err
                );
                err.with_msg(msg)
            })?;
        }
        Ok(())
    }

    /// Build the one-shot shell script performing all the buffered writes:
    /// for a remote host the flush must be a single remote execution rather
    /// than one round trip per write.
    fn flush_script(&self) -> String {
        let mut script = String::from("set -e\n");
        for &(cpu, regaddr) in &self.tbuf_order {
            let pending = self.tbuf[&(cpu, regaddr)];
            let mut escaped = String::new();
            for byte in pending.regval.to_le_bytes() {
                escaped.push_str(&format!("\\{byte:03o}"));
            }
            script.push_str(&format!(
                "printf '{escaped}' | dd of=/dev/cpu/{cpu}/msr bs=8 count=1 seek={regaddr} \
                 oflag=seek_bytes conv=notrunc status=none\n"
            ));
        }
        script
    }

    fn flush_remote(&mut self) -> Result<()> {
        let script = self.flush_script();
        let result = self.exec.run(&script)?;
        if result.exitcode != 0 {
            return Err(Error::Io(format!(
                "MSR transaction flush failed{} with exit code {}:\n{}",
                self.exec.hostmsg(),
                result.exitcode,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Flush the transaction buffer to the MSRs. Returns `true` when there
    /// was data to flush. Writes requesting verification are verified after
    /// all writes complete, grouped by `(value, address)`.
    pub fn flush_transaction(&mut self) -> Result<bool> {
        if !self.enable_cache || !self.in_transaction || self.tbuf.is_empty() {
            return Ok(false);
        }

        debug!("flushing the MSR transaction buffer");

        if self.exec.is_remote() {
            self.flush_remote()?;
        } else {
            self.flush_local()?;
        }

        // Group the verification reads: one pass per distinct
        // (value, address) pair over the CPUs that got it.
        let mut verify_groups: Vec<((u64, u32), Vec<u32>, Scope)> = Vec::new();
        for &(cpu, regaddr) in &self.tbuf_order {
            let pending = self.tbuf[&(cpu, regaddr)];
            if !pending.verify {
                continue;
            }
            let key = (pending.regval, regaddr);
            match verify_groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, cpus, _)) => cpus.push(cpu),
                None => verify_groups.push((key, vec![cpu], pending.iosname)),
            }
        }

        self.tbuf.clear();
        self.tbuf_order.clear();

        for ((regval, regaddr), cpus, iosname) in verify_groups {
            self.verify(regaddr, regval, &cpus, iosname)?;
        }

        Ok(true)
    }

    /// Flush and close the transaction.
    pub fn commit_transaction(&mut self) -> Result<()> {
        if !self.enable_cache {
            debug!("transactions support requires caching to be enabled");
            return Ok(());
        }
        if !self.in_transaction {
            return Err(Error::BadValue(
                "cannot commit transaction: no transaction is currently in progress".to_string(),
            ));
        }
        let flushed = self.flush_transaction()?;
        self.in_transaction = false;
        if flushed {
            debug!("MSR transaction has been committed");
        } else {
            debug!("MSR transaction has been committed, but it was empty");
        }
        Ok(())
    }

    /// Whether the cache holds a value for `(regaddr, cpu)`. Exposed for
    /// the featured-MSR layer and for tests.
    pub fn is_cached(&self, regaddr: u32, cpu: u32) -> bool {
        self.cache.is_cached(regaddr, cpu)
    }

    pub fn scope_enabled(&self) -> bool {
        self.enable_scope
    }
}

fn annotate_msr_err(err: Error, regaddr: u32, cpu: u32, path: &std::path::Path) -> Error {
    if err.is_not_found() {
        return Error::NotSupported(format!(
            "'{}' does not exist: the MSR driver is not loaded (try 'modprobe msr')",
            path.display()
        ));
    }
    let msg = format!(
        "failed to access MSR {:#x} of CPU {} (file '{}'): {}",
        regaddr,
        cpu,
        path.display(),
        err
    );
    err.with_msg(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::cpumodel;
    use base::testing;
    use base::EmulExecutor;

    // The engine under test against an in-memory MSR device per CPU. The
    // emulated executor disables scope optimization, so a scope-aware
    // variant backs the fan-out tests separately (see cache tests).
    fn engine_with_msrs(init: &[(u32, u32, u64)]) -> (Rc<EmulExecutor>, MsrEngine) {
        let exec = Rc::new(EmulExecutor::new());
        for cpu in 0..16u32 {
            exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        }
        for &(cpu, regaddr, regval) in init {
            exec.write_bytes_at(
                std::path::Path::new(&format!("/dev/cpu/{cpu}/msr")),
                regaddr as u64,
                &regval.to_le_bytes(),
            )
            .unwrap();
        }
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let engine = MsrEngine::new(info, exec.clone() as Rc<dyn Executor>, true);
        (exec, engine)
    }

    #[test]
    fn bit_helpers_round_trip() {
        let cases = [(7u32, 0u32), (15, 8), (42, 42), (63, 0), (63, 48), (55, 48)];
        for (msb, lsb) in cases {
            let width = msb - lsb + 1;
            let vals = [0u64, 1, bits_max((msb, lsb)), bits_max((msb, lsb)) / 2];
            for val in vals {
                let regval = set_bits(0xdead_beef_cafe_f00d, (msb, lsb), val);
                assert_eq!(get_bits(regval, (msb, lsb)), val, "bits {msb}:{lsb} width {width}");
                // Bits outside the range are untouched.
                let mask = bits_mask((msb, lsb));
                assert_eq!(regval & !mask, 0xdead_beef_cafe_f00d & !mask);
            }
        }
    }

    #[test]
    fn read_and_cache() {
        let (exec, mut engine) = engine_with_msrs(&[(0, 0xCE, 0x8008), (1, 0xCE, 0x8008)]);
        assert_eq!(engine.read_cpu(0xCE, 0, Scope::Package).unwrap(), 0x8008);

        // Mutate the device behind the engine's back: the cached value must
        // win on the second read.
        exec.write_bytes_at(
            std::path::Path::new("/dev/cpu/0/msr"),
            0xCE,
            &0u64.to_le_bytes(),
        )
        .unwrap();
        assert_eq!(engine.read_cpu(0xCE, 0, Scope::Package).unwrap(), 0x8008);
    }

    #[test]
    fn write_is_visible_to_read_without_hardware_access() {
        let (exec, mut engine) = engine_with_msrs(&[]);
        engine.write_cpu(0x774, 0x1234, 3, Scope::Cpu, false).unwrap();
        assert!(engine.is_cached(0x774, 3));

        // Clobber the device: a cache hit must still return the written
        // value.
        exec.write_bytes_at(
            std::path::Path::new("/dev/cpu/3/msr"),
            0x774,
            &0xffu64.to_le_bytes(),
        )
        .unwrap();
        assert_eq!(engine.read_cpu(0x774, 3, Scope::Cpu).unwrap(), 0x1234);
    }

    #[test]
    fn write_bits_patches_only_the_range() {
        let (_, mut engine) = engine_with_msrs(&[(0, 0x774, 0xff00_0000_0000_00aa)]);
        engine
            .write_cpu_bits(0x774, (15, 8), 0x55, 0, Scope::Cpu, false)
            .unwrap();
        assert_eq!(engine.read_cpu(0x774, 0, Scope::Cpu).unwrap(), 0xff00_0000_0000_55aa);
    }

    #[test]
    fn write_bits_rejects_oversized_value_before_io() {
        let (exec, mut engine) = engine_with_msrs(&[]);
        let err = engine
            .write_cpu_bits(0x774, (15, 8), 0x100, 0, Scope::Cpu, false)
            .unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
        // Nothing was read or written.
        let bytes = exec.file_bytes(std::path::Path::new("/dev/cpu/0/msr")).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    // An executor that silently drops MSR writes, modeling a locked
    // register. Delegates everything else to an inner emulated executor.
    struct LockedMsrExec(EmulExecutor);

    impl Executor for LockedMsrExec {
        fn read(&self, path: &std::path::Path) -> Result<String> {
            self.0.read(path)
        }
        fn write(&self, path: &std::path::Path, data: &str) -> Result<()> {
            self.0.write(path, data)
        }
        fn read_bytes_at(&self, path: &std::path::Path, pos: u64, len: usize) -> Result<Vec<u8>> {
            self.0.read_bytes_at(path, pos, len)
        }
        fn write_bytes_at(&self, _path: &std::path::Path, _pos: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn lsdir(&self, path: &std::path::Path) -> Result<Vec<base::DirEntryInfo>> {
            self.0.lsdir(path)
        }
        fn run(&self, cmd: &str) -> Result<base::RunResult> {
            self.0.run(cmd)
        }
        fn exists(&self, path: &std::path::Path) -> bool {
            self.0.exists(path)
        }
        fn is_emulated(&self) -> bool {
            true
        }
        fn hostmsg(&self) -> &str {
            ""
        }
    }

    #[test]
    fn verified_write_succeeds_when_hardware_accepts() {
        let (_, mut engine) = engine_with_msrs(&[]);
        engine.write_cpu(0xE2, 0x7, 0, Scope::Cpu, true).unwrap();
        assert_eq!(engine.read_cpu(0xE2, 0, Scope::Cpu).unwrap(), 0x7);
    }

    #[test]
    fn verify_reports_mismatch() {
        let inner = EmulExecutor::new();
        for cpu in 0..16u32 {
            inner.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        }
        let exec = Rc::new(LockedMsrExec(inner));
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let mut engine = MsrEngine::new(info, exec as Rc<dyn Executor>, true);

        let err = engine.write_cpu(0xE2, 0x7, 0, Scope::Cpu, true).unwrap_err();
        match err {
            Error::VerifyFailed {
                cpu,
                expected,
                actual,
                ..
            } => {
                assert_eq!(cpu, Some(0));
                assert_eq!(expected, 0x7);
                assert_eq!(actual, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // A non-emulated in-memory executor counting hardware reads, for the
    // scope optimization tests.
    struct CountingExec {
        inner: EmulExecutor,
        reads: std::cell::Cell<u32>,
        writes: std::cell::Cell<u32>,
    }

    impl Executor for CountingExec {
        fn read(&self, path: &std::path::Path) -> Result<String> {
            self.inner.read(path)
        }
        fn write(&self, path: &std::path::Path, data: &str) -> Result<()> {
            self.inner.write(path, data)
        }
        fn read_bytes_at(&self, path: &std::path::Path, pos: u64, len: usize) -> Result<Vec<u8>> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read_bytes_at(path, pos, len)
        }
        fn write_bytes_at(&self, path: &std::path::Path, pos: u64, data: &[u8]) -> Result<()> {
            self.writes.set(self.writes.get() + 1);
            self.inner.write_bytes_at(path, pos, data)
        }
        fn lsdir(&self, path: &std::path::Path) -> Result<Vec<base::DirEntryInfo>> {
            self.inner.lsdir(path)
        }
        fn run(&self, cmd: &str) -> Result<base::RunResult> {
            self.inner.run(cmd)
        }
        fn exists(&self, path: &std::path::Path) -> bool {
            self.inner.exists(path)
        }
        fn hostmsg(&self) -> &str {
            ""
        }
    }

    fn counting_engine() -> (Rc<CountingExec>, MsrEngine) {
        let inner = EmulExecutor::new();
        for cpu in 0..16u32 {
            inner.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        }
        let exec = Rc::new(CountingExec {
            inner,
            reads: std::cell::Cell::new(0),
            writes: std::cell::Cell::new(0),
        });
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let engine = MsrEngine::new(info, exec.clone() as Rc<dyn Executor>, true);
        (exec, engine)
    }

    #[test]
    fn package_scope_read_hits_hardware_once_per_package() {
        let (exec, mut engine) = counting_engine();
        assert!(engine.scope_enabled());

        let vals = engine.read(0xCE, None, Scope::Package).unwrap();
        assert_eq!(vals.len(), 16);
        // One read for package 0, one for package 1.
        assert_eq!(exec.reads.get(), 2);
    }

    #[test]
    fn package_scope_write_fans_out_cache_without_extra_io() {
        let (exec, mut engine) = counting_engine();

        engine.write(0xE2, 0x2, Some(&[0]), Scope::Package, false).unwrap();
        assert_eq!(exec.writes.get(), 1);

        // Every CPU of package 0 now reports the value from the cache.
        for cpu in 0..8 {
            assert_eq!(engine.read_cpu(0xE2, cpu, Scope::Package).unwrap(), 0x2);
        }
        assert_eq!(exec.reads.get(), 0);

        // Writing the whole package is absorbed by the cache check.
        engine.write(0xE2, 0x2, None, Scope::Package, false).unwrap();
        assert_eq!(exec.writes.get(), 2); // one more, for package 1 only
    }

    #[test]
    fn transaction_merges_and_flushes_in_order() {
        let (exec, mut engine) = engine_with_msrs(&[]);
        engine.start_transaction().unwrap();
        engine.write_cpu(0x774, 0x11, 0, Scope::Cpu, false).unwrap();
        engine.write_cpu(0x770, 0x1, 0, Scope::Cpu, false).unwrap();
        // Second write to the same (CPU, MSR) merges into the first slot.
        engine.write_cpu(0x774, 0x22, 0, Scope::Cpu, false).unwrap();

        // Reads inside the transaction see the queued value...
        assert_eq!(engine.read_cpu(0x774, 0, Scope::Cpu).unwrap(), 0x22);
        // ...but the hardware has not been touched yet.
        let bytes = exec
            .read_bytes_at(std::path::Path::new("/dev/cpu/0/msr"), 0x774, 8)
            .unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0);

        engine.commit_transaction().unwrap();
        let bytes = exec
            .read_bytes_at(std::path::Path::new("/dev/cpu/0/msr"), 0x774, 8)
            .unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x22);
        let bytes = exec
            .read_bytes_at(std::path::Path::new("/dev/cpu/0/msr"), 0x770, 8)
            .unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x1);
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let (_, mut engine) = engine_with_msrs(&[]);
        engine.start_transaction().unwrap();
        engine.commit_transaction().unwrap();
        assert!(!engine.in_transaction());
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let (_, mut engine) = engine_with_msrs(&[]);
        engine.start_transaction().unwrap();
        assert!(engine.start_transaction().is_err());
    }

    #[test]
    fn inconsistent_requeue_is_rejected() {
        let (_, mut engine) = engine_with_msrs(&[]);
        engine.start_transaction().unwrap();
        engine.write_cpu(0x774, 0x11, 0, Scope::Cpu, false).unwrap();
        let err = engine.write_cpu(0x774, 0x22, 0, Scope::Core, false).unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
    }

    #[test]
    fn remote_flush_is_one_execution() {
        let exec = Rc::new(EmulExecutor::new_remote());
        for cpu in 0..16u32 {
            exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        }
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let mut engine = MsrEngine::new(info, exec.clone() as Rc<dyn Executor>, true);

        engine.start_transaction().unwrap();
        engine.write_cpu(0x774, 0x11, 0, Scope::Cpu, false).unwrap();
        engine.write_cpu(0x774, 0x22, 1, Scope::Cpu, false).unwrap();
        engine.commit_transaction().unwrap();

        let log = exec.cmd_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("dd of=/dev/cpu/0/msr"));
        assert!(log[0].contains("dd of=/dev/cpu/1/msr"));
        assert!(log[0].contains(&format!("seek={}", 0x774)));
    }

    #[test]
    fn transactions_noop_without_cache() {
        let exec = Rc::new(EmulExecutor::new());
        for cpu in 0..16u32 {
            exec.add_file_bytes(format!("/dev/cpu/{cpu}/msr"), &[0u8; 4096]);
        }
        let info = Rc::new(testing::cpu_info_with_flags(cpumodel::GRANITERAPIDS_X, &[]));
        let mut engine = MsrEngine::new(info, exec.clone() as Rc<dyn Executor>, false);

        engine.start_transaction().unwrap();
        assert!(!engine.in_transaction());
        // Writes go straight to hardware.
        engine.write_cpu(0x774, 0x5, 0, Scope::Cpu, false).unwrap();
        let bytes = exec
            .read_bytes_at(std::path::Path::new("/dev/cpu/0/msr"), 0x774, 8)
            .unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x5);
        engine.commit_transaction().unwrap();
    }
}
