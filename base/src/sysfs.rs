// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cached typed access to sysfs nodes.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::Error;
use crate::Executor;
use crate::Result;

/// Thin typed wrapper over `Executor` file I/O with a path-keyed cache.
/// Sysfs values are small and re-read often; caching avoids the syscall (or
/// round trip, for remote hosts) on repeated reads. The cache is
/// write-through: a write invalidates the entry, a verify read re-populates
/// it.
pub struct SysfsIo {
    exec: Rc<dyn Executor>,
    enable_cache: bool,
    cache: HashMap<PathBuf, String>,
}

impl SysfsIo {
    pub fn new(exec: Rc<dyn Executor>, enable_cache: bool) -> SysfsIo {
        SysfsIo {
            exec,
            enable_cache,
            cache: HashMap::new(),
        }
    }

    pub fn executor(&self) -> &Rc<dyn Executor> {
        &self.exec
    }

    /// Read a sysfs file, trimming the trailing newline.
    pub fn read(&mut self, path: &Path, what: &str) -> Result<String> {
        if self.enable_cache {
            if let Some(val) = self.cache.get(path) {
                return Ok(val.clone());
            }
        }

        let val = self
            .exec
            .read(path)
            .map_err(|err| err_context(err, what))?
            .trim()
            .to_string();

        if self.enable_cache {
            self.cache.insert(path.to_path_buf(), val.clone());
        }
        Ok(val)
    }

    /// Read a sysfs file and parse it as a decimal integer.
    pub fn read_int(&mut self, path: &Path, what: &str) -> Result<u64> {
        let val = self.read(path, what)?;
        val.parse::<u64>().map_err(|_| {
            Error::BadValue(format!(
                "bad contents of '{}'{}: expected an integer for {}, got '{}'",
                path.display(),
                self.exec.hostmsg(),
                what,
                val
            ))
        })
    }

    /// Write a string to a sysfs file. The cache entry is dropped first so
    /// a failed write cannot leave a stale value behind.
    pub fn write(&mut self, path: &Path, data: &str, what: &str) -> Result<()> {
        self.cache.remove(path);
        self.exec
            .write(path, data)
            .map_err(|err| err_context(err, what))?;
        if self.enable_cache {
            self.cache.insert(path.to_path_buf(), data.trim().to_string());
        }
        Ok(())
    }

    /// Write an integer to a sysfs file.
    pub fn write_int(&mut self, path: &Path, val: u64, what: &str) -> Result<()> {
        self.write(path, &val.to_string(), what)
    }

    /// Write an integer and read it back. Retry `retries` times with `sleep`
    /// in between on a mismatch (HWP systems apply frequency writes
    /// asynchronously). A persistent mismatch fails `VerifyFailed` with the
    /// expected and actual values.
    pub fn write_verify_int(
        &mut self,
        path: &Path,
        val: u64,
        what: &str,
        retries: u32,
        sleep: Duration,
    ) -> Result<()> {
        self.cache.remove(path);
        self.exec
            .write(path, &val.to_string())
            .map_err(|err| err_context(err, what))?;

        let mut attempts = retries + 1;
        loop {
            // Bypass the cache: the whole point is to observe the kernel.
            let read_back = self
                .exec
                .read(path)
                .map_err(|err| err_context(err, what))?
                .trim()
                .to_string();
            let actual = read_back.parse::<u64>().unwrap_or(u64::MAX);

            if actual == val {
                if self.enable_cache {
                    self.cache.insert(path.to_path_buf(), read_back);
                }
                return Ok(());
            }

            attempts -= 1;
            if attempts == 0 {
                return Err(Error::VerifyFailed {
                    msg: format!(
                        "wrote '{}' to '{}'{}, but read '{}' back",
                        val,
                        path.display(),
                        self.exec.hostmsg(),
                        read_back
                    ),
                    cpu: None,
                    expected: val,
                    actual,
                    path: Some(path.to_path_buf()),
                });
            }
            debug!(
                "read '{}' back from '{}' instead of '{}', retrying",
                read_back,
                path.display(),
                val
            );
            if !sleep.is_zero() {
                thread::sleep(sleep);
            }
        }
    }

    /// Insert a value into the cache without touching the file. Used when a
    /// caller already validated a value it read through other means.
    pub fn cache_add(&mut self, path: &Path, val: &str) {
        if self.enable_cache {
            self.cache.insert(path.to_path_buf(), val.to_string());
        }
    }
}

// A missing sysfs node means the kernel does not provide the knob on this
// system: surface it as NotSupported so mechanism selection can fall
// through to an alternative.
fn err_context(err: Error, what: &str) -> Error {
    let msg = format!("failed to access {what}: {err}");
    if err.is_not_found() {
        return Error::NotSupported(msg);
    }
    err.with_msg(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmulExecutor;

    fn sysfs_with(files: &[(&str, &str)]) -> (Rc<EmulExecutor>, SysfsIo) {
        let exec = Rc::new(EmulExecutor::new());
        for (path, data) in files {
            exec.add_file(*path, data);
        }
        let sysfs = SysfsIo::new(exec.clone() as Rc<dyn Executor>, true);
        (exec, sysfs)
    }

    #[test]
    fn read_int_trims_and_parses() {
        let (_, mut sysfs) = sysfs_with(&[("/sys/f", "1200000\n")]);
        assert_eq!(sysfs.read_int(Path::new("/sys/f"), "freq").unwrap(), 1200000);
    }

    #[test]
    fn read_uses_cache() {
        let (exec, mut sysfs) = sysfs_with(&[("/sys/f", "100")]);
        assert_eq!(sysfs.read(Path::new("/sys/f"), "x").unwrap(), "100");
        // Mutate the backing file directly: a cached read must not see it.
        exec.add_file("/sys/f", "200");
        assert_eq!(sysfs.read(Path::new("/sys/f"), "x").unwrap(), "100");
    }

    #[test]
    fn write_invalidates_cache() {
        let (_, mut sysfs) = sysfs_with(&[("/sys/f", "100")]);
        assert_eq!(sysfs.read(Path::new("/sys/f"), "x").unwrap(), "100");
        sysfs.write_int(Path::new("/sys/f"), 300, "x").unwrap();
        assert_eq!(sysfs.read_int(Path::new("/sys/f"), "x").unwrap(), 300);
    }

    #[test]
    fn write_verify_succeeds_when_kernel_accepts() {
        let (_, mut sysfs) = sysfs_with(&[("/sys/f", "100")]);
        sysfs
            .write_verify_int(Path::new("/sys/f"), 250, "x", 0, Duration::ZERO)
            .unwrap();
        assert_eq!(sysfs.read_int(Path::new("/sys/f"), "x").unwrap(), 250);
    }

    #[test]
    fn write_verify_reports_mismatch() {
        // An executor whose file silently keeps its value models a kernel
        // that rejects the write.
        struct StubbornExec(EmulExecutor);
        impl Executor for StubbornExec {
            fn read(&self, path: &Path) -> Result<String> {
                self.0.read(path)
            }
            fn write(&self, _path: &Path, _data: &str) -> Result<()> {
                Ok(())
            }
            fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>> {
                self.0.read_bytes_at(path, pos, len)
            }
            fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()> {
                self.0.write_bytes_at(path, pos, data)
            }
            fn lsdir(&self, path: &Path) -> Result<Vec<crate::DirEntryInfo>> {
                self.0.lsdir(path)
            }
            fn run(&self, cmd: &str) -> Result<crate::RunResult> {
                self.0.run(cmd)
            }
            fn exists(&self, path: &Path) -> bool {
                self.0.exists(path)
            }
            fn hostmsg(&self) -> &str {
                ""
            }
        }

        let inner = EmulExecutor::new();
        inner.add_file("/sys/f", "100");
        let exec = Rc::new(StubbornExec(inner));
        let mut sysfs = SysfsIo::new(exec as Rc<dyn Executor>, true);

        let err = sysfs
            .write_verify_int(Path::new("/sys/f"), 250, "x", 2, Duration::ZERO)
            .unwrap_err();
        match err {
            Error::VerifyFailed {
                expected, actual, ..
            } => {
                assert_eq!(expected, 250);
                assert_eq!(actual, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
