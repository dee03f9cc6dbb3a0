// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TPMI engine tests against a captured debugfs dump.
//!
//! The dump describes two TPMI devices of one Granite Rapids package. The
//! first device carries the "rapl", "ufs" and "tpmi_info" features plus an
//! unknown feature ID; UFS instance 1 is dead on the first device and
//! instance 0 on the second.

use std::cell::RefCell;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use base::DirEntryInfo;
use base::Error;
use base::Executor;
use base::LocalExecutor;
use base::Result;
use base::RunResult;
use tpmi::TpmiEngine;

const GNR_VFM: u32 = 1709;
const DEV0: &str = "0000:00:02.1";
const DEV1: &str = "0001:00:02.1";

fn dump_base() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../test-data/test_tpmi_nohost/debugfs-dump")
}

fn spec_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../test-data/test_tpmi_nohost/specs")
}

fn engine() -> TpmiEngine {
    let exec = Rc::new(LocalExecutor::new());
    TpmiEngine::new(
        Some(GNR_VFM),
        &[spec_dir()],
        Some(dump_base()),
        exec as Rc<dyn Executor>,
    )
    .unwrap()
}

#[test]
fn decode_ufs_status() {
    let mut tpmi = engine();
    assert_eq!(
        tpmi.read_register("ufs", DEV0, 2, "UFS_STATUS", None).unwrap(),
        0xa52fc5f04092008
    );
    assert_eq!(
        tpmi.read_register("ufs", DEV0, 2, "UFS_STATUS", Some("CURRENT_RATIO")).unwrap(),
        0x8
    );
    assert_eq!(
        tpmi.read_register("ufs", DEV0, 2, "UFS_STATUS", Some("AGENT_TYPE_IO")).unwrap(),
        0x1
    );
    assert_eq!(
        tpmi.read_register("ufs", DEV0, 2, "UFS_STATUS", Some("AGENT_TYPE_CORE")).unwrap(),
        0x0
    );
}

#[test]
fn decode_rapl_energy_status() {
    let mut tpmi = engine();
    assert_eq!(
        tpmi.read_register("rapl", DEV0, 0, "SOCKET_RAPL_ENERGY_STATUS", None).unwrap(),
        0x104a8b7cde85806f
    );
}

#[test]
fn get_bitfield_matches_direct_read() {
    let mut tpmi = engine();
    let regval = tpmi.read_register("ufs", DEV0, 2, "UFS_STATUS", None).unwrap();
    assert_eq!(
        tpmi.get_bitfield(regval, "ufs", "UFS_STATUS", "CURRENT_RATIO").unwrap(),
        0x8
    );
    assert_eq!(
        tpmi.get_bitfield(regval, "ufs", "UFS_STATUS", "AGENT_TYPE_IO").unwrap(),
        0x1
    );
}

#[test]
fn iterate_ufs_feature() {
    let mut tpmi = engine();
    let tuples = tpmi.iter_feature("ufs", &[], &[], &[]).unwrap();
    assert_eq!(
        tuples,
        vec![
            (0, DEV0.to_string(), 0),
            (0, DEV0.to_string(), 2),
            (0, DEV1.to_string(), 2),
        ]
    );

    let tuples = tpmi.iter_feature_cluster("ufs", &[], &[], &[], &[]).unwrap();
    assert_eq!(
        tuples,
        vec![
            (0, DEV0.to_string(), 0, 0),
            (0, DEV0.to_string(), 0, 1),
            (0, DEV0.to_string(), 2, 0),
            (0, DEV0.to_string(), 2, 1),
            (0, DEV1.to_string(), 2, 0),
            (0, DEV1.to_string(), 2, 1),
        ]
    );
}

#[test]
fn iterate_with_filters() {
    let mut tpmi = engine();
    let tuples = tpmi.iter_feature("ufs", &[], &[DEV1], &[]).unwrap();
    assert_eq!(tuples, vec![(0, DEV1.to_string(), 2)]);

    // Dead and non-existing instances are silently skipped.
    let tuples = tpmi.iter_feature("ufs", &[], &[], &[1, 2, 7]).unwrap();
    assert_eq!(
        tuples,
        vec![(0, DEV0.to_string(), 2), (0, DEV1.to_string(), 2)]
    );

    assert!(tpmi.iter_feature("ufs", &[9], &[], &[]).is_err());
    assert!(tpmi.iter_feature("ufs", &[], &["0002:00:02.1"], &[]).is_err());
}

#[test]
fn known_and_unknown_features() {
    let mut tpmi = engine();
    assert_eq!(tpmi.get_unknown_features(), vec![0xFE]);

    let mut known: Vec<String> = tpmi.get_known_features().into_keys().collect();
    known.sort_unstable();
    assert_eq!(known, vec!["rapl", "tpmi_info", "ufs"]);

    assert_eq!(tpmi.get_sdict("ufs").unwrap().feature_id, 0x02);
    assert!(tpmi.get_fdict("ufs").unwrap().contains_key("UFS_CONTROL"));
}

#[test]
fn dead_instance_is_rejected() {
    let mut tpmi = engine();
    let err = tpmi.read_register("ufs", DEV0, 7, "UFS_STATUS", None).unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));
}

#[test]
fn cluster_reads() {
    let mut tpmi = engine();

    // Cluster 1 of instance 2 on the first device is a cache+memory die.
    assert_eq!(
        tpmi.read_ufs_register(DEV0, 2, 1, "UFS_STATUS", None).unwrap(),
        0x03000010
    );
    assert_eq!(
        tpmi.read_ufs_register(DEV0, 2, 1, "UFS_STATUS", Some("AGENT_TYPE_CACHE")).unwrap(),
        1
    );

    // Header registers are per-instance, not per-cluster.
    let err = tpmi.read_ufs_register(DEV0, 2, 1, "UFS_HEADER", None).unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));

    // Clusters beyond the fabric mask do not exist.
    let err = tpmi.read_ufs_register(DEV0, 2, 5, "UFS_STATUS", None).unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));

    // Non-UFS features have no clusters.
    let err = tpmi
        .read_register_cluster("rapl", DEV0, 0, 1, "SOCKET_RAPL_ENERGY_STATUS", None)
        .unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));
}

#[test]
fn register_readonly_flags() {
    let mut tpmi = engine();
    let fdict = tpmi.get_fdict("ufs").unwrap();
    assert!(fdict["UFS_STATUS"].readonly);
    assert!(fdict["UFS_HEADER"].readonly);
    assert!(!fdict["UFS_CONTROL"].readonly);
}

// An executor that logs writes, so the 'mem_write' protocol can be
// observed without mutating the committed dump.
struct RecordingExec {
    inner: LocalExecutor,
    writes: RefCell<Vec<(PathBuf, String)>>,
}

impl RecordingExec {
    fn new() -> RecordingExec {
        RecordingExec {
            inner: LocalExecutor::new(),
            writes: RefCell::new(Vec::new()),
        }
    }
}

impl Executor for RecordingExec {
    fn read(&self, path: &Path) -> Result<String> {
        self.inner.read(path)
    }
    fn write(&self, path: &Path, data: &str) -> Result<()> {
        self.writes.borrow_mut().push((path.to_path_buf(), data.to_string()));
        Ok(())
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
    fn hostmsg(&self) -> &str {
        ""
    }
}

fn recording_engine() -> (Rc<RecordingExec>, TpmiEngine) {
    let exec = Rc::new(RecordingExec::new());
    let tpmi = TpmiEngine::new(
        Some(GNR_VFM),
        &[spec_dir()],
        Some(dump_base()),
        exec.clone() as Rc<dyn Executor>,
    )
    .unwrap();
    (exec, tpmi)
}

#[test]
fn write_register_protocol() {
    let (exec, mut tpmi) = recording_engine();

    // A full 64-bit register write is two textual word writes.
    tpmi.write_register(0x2_50e8, "rapl", DEV0, 0, "SOCKET_RAPL_PL1_CONTROL", None)
        .unwrap();

    let writes = exec.writes.borrow();
    assert_eq!(writes.len(), 2);
    assert!(writes[0].0.ends_with("tpmi-0000:00:02.1/tpmi-id-00/mem_write"));
    assert_eq!(writes[0].1, "0,8,0x250e8");
    assert_eq!(writes[1].1, "0,12,0x0");
}

#[test]
fn write_bitfield_patches_register() {
    let (exec, mut tpmi) = recording_engine();

    // UFS_CONTROL of cluster 1, instance 2 reads 0x830; patching MIN_RATIO
    // (bits 14:8) to 0x10 gives 0x1030. The cluster offset moves the write
    // from spec offset 24 to 24 + 40 - 16 = 48.
    tpmi.write_ufs_register(0x10, DEV0, 2, 1, "UFS_CONTROL", Some("MIN_RATIO"))
        .unwrap();

    let writes = exec.writes.borrow();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].1, "2,48,0x1030");
    assert_eq!(writes[1].1, "2,52,0x0");
}

#[test]
fn write_validation() {
    let (exec, mut tpmi) = recording_engine();

    // Read-only register.
    let err = tpmi
        .write_register(1, "rapl", DEV0, 0, "SOCKET_RAPL_ENERGY_STATUS", None)
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    // Read-only bit field.
    let err = tpmi
        .write_register(1, "ufs", DEV0, 2, "UFS_STATUS", Some("CURRENT_RATIO"))
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    // Value too large for the bit field: 7 bits.
    let err = tpmi
        .write_ufs_register(0x80, DEV0, 2, 0, "UFS_CONTROL", Some("MAX_RATIO"))
        .unwrap_err();
    assert!(matches!(err, Error::BadValue(_)));

    assert!(exec.writes.borrow().is_empty());

    // Read-only engine mode refuses everything.
    tpmi.set_readonly(true);
    let err = tpmi
        .write_ufs_register(0x10, DEV0, 2, 0, "UFS_CONTROL", Some("MAX_RATIO"))
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
}
