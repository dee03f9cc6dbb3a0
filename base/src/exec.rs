// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `Executor` capability set: file and command I/O against the target
//! host. The stack above is written entirely against this trait so that a
//! captured dump can substitute for real sysfs/debugfs/MSR files in tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use crate::Error;
use crate::Result;

/// One directory entry as returned by `Executor::lsdir()`.
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
}

/// The outcome of `Executor::run()`.
#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exitcode: i32,
}

/// Uniform file/command I/O over local or emulated backends. A remote
/// backend would implement the same trait; the only behavioral difference
/// the core is allowed to rely on is `is_remote()` (used to batch MSR
/// transaction flushes into a single remote execution).
pub trait Executor {
    /// Read a text file in full.
    fn read(&self, path: &Path) -> Result<String>;

    /// Overwrite a file with `data` (kernel control files interpret each
    /// write as one operation).
    fn write(&self, path: &Path, data: &str) -> Result<()>;

    /// Read exactly `len` bytes at byte offset `pos`.
    fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at byte offset `pos`.
    fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()>;

    /// List directory entries.
    fn lsdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>>;

    /// Run a shell command on the target host.
    fn run(&self, cmd: &str) -> Result<RunResult>;

    /// Whether `path` exists on the target host.
    fn exists(&self, path: &Path) -> bool;

    /// Whether the target host is remote.
    fn is_remote(&self) -> bool {
        false
    }

    /// Whether this executor serves captured dumps instead of live files.
    /// The MSR layer disables scope optimization for emulated targets,
    /// because a dump does not model register scope.
    fn is_emulated(&self) -> bool {
        false
    }

    /// A suffix appended to error messages so the user can tell whether the
    /// failure was local, remote, or emulated. Empty for the local host.
    fn hostmsg(&self) -> &str;
}

fn classify_io_error(err: &io::Error, path: &Path, hostmsg: &str) -> Error {
    let raw = err.raw_os_error();
    if raw == Some(libc::ENOENT) || err.kind() == io::ErrorKind::NotFound {
        return Error::NotFound(format!("'{}' does not exist{}", path.display(), hostmsg));
    }
    if raw == Some(libc::EACCES) || raw == Some(libc::EPERM) {
        return Error::PermissionDenied(format!(
            "permission denied for '{}'{}: {}",
            path.display(),
            hostmsg,
            err
        ));
    }
    Error::Io(format!("failed to access '{}'{}: {}", path.display(), hostmsg, err))
}

/// The local host backend.
#[derive(Default)]
pub struct LocalExecutor {}

impl LocalExecutor {
    pub fn new() -> LocalExecutor {
        LocalExecutor {}
    }
}

impl Executor for LocalExecutor {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|err| classify_io_error(&err, path, self.hostmsg()))
    }

    fn write(&self, path: &Path, data: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        file.write_all(data.as_bytes())
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))
    }

    fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut file =
            fs::File::open(path).map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        Ok(buf)
    }

    fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        file.write_all(data)
            .map_err(|err| classify_io_error(&err, path, self.hostmsg()))
    }

    fn lsdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let entries =
            fs::read_dir(path).map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| classify_io_error(&err, path, self.hostmsg()))?;
            result.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn run(&self, cmd: &str) -> Result<RunResult> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|err| Error::Io(format!("failed to run '{cmd}': {err}")))?;
        Ok(RunResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exitcode: output.status.code().unwrap_or(-1),
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn hostmsg(&self) -> &str {
        ""
    }
}

/// An in-memory backend serving captured file contents. Writes are recorded
/// and visible to subsequent reads, so write-then-verify paths behave like
/// the real thing. Commands return canned results and are logged for test
/// inspection.
pub struct EmulExecutor {
    files: RefCell<BTreeMap<PathBuf, String>>,
    cmd_results: RefCell<HashMap<String, RunResult>>,
    cmd_log: RefCell<Vec<String>>,
    remote: bool,
}

impl EmulExecutor {
    pub fn new() -> EmulExecutor {
        EmulExecutor {
            files: RefCell::new(BTreeMap::new()),
            cmd_results: RefCell::new(HashMap::new()),
            cmd_log: RefCell::new(Vec::new()),
            remote: false,
        }
    }

    /// An emulated executor that claims to be remote. Only useful for
    /// exercising remote-only code paths such as transaction batching.
    pub fn new_remote() -> EmulExecutor {
        EmulExecutor {
            remote: true,
            ..EmulExecutor::new()
        }
    }

    /// Populate a file with `data`.
    pub fn add_file<P: Into<PathBuf>>(&self, path: P, data: &str) {
        self.files.borrow_mut().insert(path.into(), data.to_string());
    }

    /// Populate a binary file. The contents are stored as latin-1 so byte
    /// offsets survive the round trip.
    pub fn add_file_bytes<P: Into<PathBuf>>(&self, path: P, data: &[u8]) {
        let text: String = data.iter().map(|b| *b as char).collect();
        self.files.borrow_mut().insert(path.into(), text);
    }

    /// Register a canned result for `run(cmd)`.
    pub fn add_cmd_result(&self, cmd: &str, result: RunResult) {
        self.cmd_results.borrow_mut().insert(cmd.to_string(), result);
    }

    /// Commands passed to `run()` so far.
    pub fn cmd_log(&self) -> Vec<String> {
        self.cmd_log.borrow().clone()
    }

    /// Current contents of `path`, if any.
    pub fn file_contents(&self, path: &Path) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    /// Current contents of `path` as bytes.
    pub fn file_bytes(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .borrow()
            .get(path)
            .map(|text| text.chars().map(|c| c as u8).collect())
    }

    fn not_found(&self, path: &Path) -> Error {
        Error::NotFound(format!("'{}' does not exist{}", path.display(), self.hostmsg()))
    }
}

impl Default for EmulExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for EmulExecutor {
    fn read(&self, path: &Path) -> Result<String> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| self.not_found(path))
    }

    fn write(&self, path: &Path, data: &str) -> Result<()> {
        let mut files = self.files.borrow_mut();
        if !files.contains_key(path) {
            return Err(self.not_found(path));
        }
        files.insert(path.to_path_buf(), data.to_string());
        Ok(())
    }

    fn read_bytes_at(&self, path: &Path, pos: u64, len: usize) -> Result<Vec<u8>> {
        let files = self.files.borrow();
        let text = files.get(path).ok_or_else(|| self.not_found(path))?;
        let bytes: Vec<u8> = text.chars().map(|c| c as u8).collect();
        let start = pos as usize;
        if start + len > bytes.len() {
            return Err(Error::Io(format!(
                "short read at offset {} of '{}'{}",
                pos,
                path.display(),
                self.hostmsg()
            )));
        }
        Ok(bytes[start..start + len].to_vec())
    }

    fn write_bytes_at(&self, path: &Path, pos: u64, data: &[u8]) -> Result<()> {
        let mut files = self.files.borrow_mut();
        let text = files.get(path).ok_or_else(|| self.not_found(path))?;
        let mut bytes: Vec<u8> = text.chars().map(|c| c as u8).collect();
        let start = pos as usize;
        if start + data.len() > bytes.len() {
            bytes.resize(start + data.len(), 0);
        }
        bytes[start..start + data.len()].copy_from_slice(data);
        let text: String = bytes.iter().map(|b| *b as char).collect();
        files.insert(path.to_path_buf(), text);
        Ok(())
    }

    fn lsdir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let files = self.files.borrow();
        let mut names = std::collections::BTreeSet::new();
        for file in files.keys() {
            if let Ok(rest) = file.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    names.insert(first.as_os_str().to_string_lossy().into_owned());
                }
            }
        }
        if names.is_empty() {
            return Err(self.not_found(path));
        }
        Ok(names
            .into_iter()
            .map(|name| DirEntryInfo {
                path: path.join(&name),
                name,
            })
            .collect())
    }

    fn run(&self, cmd: &str) -> Result<RunResult> {
        self.cmd_log.borrow_mut().push(cmd.to_string());
        Ok(self
            .cmd_results
            .borrow()
            .get(cmd)
            .cloned()
            .unwrap_or_default())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.borrow();
        files.contains_key(path) || files.keys().any(|file| file.starts_with(path))
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn is_emulated(&self) -> bool {
        true
    }

    fn hostmsg(&self) -> &str {
        " (emulated)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_read_missing_file_is_not_found() {
        let exec = LocalExecutor::new();
        let err = exec.read(Path::new("/nonexistent/file/for/sure")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn local_read_bytes_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"0123456789").unwrap();
        let exec = LocalExecutor::new();
        assert_eq!(exec.read_bytes_at(&path, 3, 4).unwrap(), b"3456");
    }

    #[test]
    fn emul_lsdir_lists_first_level_entries() {
        let exec = EmulExecutor::new();
        exec.add_file("/d/tpmi-0000:00:03.1/tpmi-id-02/mem_dump", "x");
        exec.add_file("/d/tpmi-0001:00:03.1/tpmi-id-02/mem_dump", "x");
        let names: Vec<String> = exec
            .lsdir(Path::new("/d"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["tpmi-0000:00:03.1", "tpmi-0001:00:03.1"]);
    }

    #[test]
    fn emul_write_then_read() {
        let exec = EmulExecutor::new();
        exec.add_file("/sys/x", "1000");
        exec.write(Path::new("/sys/x"), "2000").unwrap();
        assert_eq!(exec.read(Path::new("/sys/x")).unwrap(), "2000");
        assert!(exec.write(Path::new("/sys/y"), "1").is_err());
    }

    #[test]
    fn emul_byte_io_round_trip() {
        let exec = EmulExecutor::new();
        exec.add_file_bytes("/dev/cpu/0/msr", &[0u8; 4096]);
        exec.write_bytes_at(Path::new("/dev/cpu/0/msr"), 0x1a0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let bytes = exec.read_bytes_at(Path::new("/dev/cpu/0/msr"), 0x1a0, 8).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
