// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The TPMI engine: debugfs discovery, mem_dump position maps, dead
//! instance filtering, UFS cluster maps, and register I/O.
//!
//! The kernel exposes each TPMI PCI device as a debugfs directory
//! (`tpmi-<pci address>`) holding one sub-directory per feature
//! (`tpmi-id-<hex>`) with a textual `mem_dump` file and a `mem_write`
//! control file. Reading a register means locating the value's byte
//! position inside `mem_dump` and parsing 8 hex characters; the position
//! maps ("mdmaps") are built once per feature and device by parsing the
//! dump.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use base::cpumodel;
use base::fmt::rangify;
use base::Error;
use base::Executor;
use base::Result;
use log::debug;
use log::info;
use log::warn;

use crate::spec;
use crate::Fdict;
use crate::SpecDirInfo;
use crate::SpecFileInfo;

/// The UFS (Uncore Frequency Scaling) feature is the only one whose
/// register block is replicated per cluster.
pub const UFS_FEATURE: &str = "ufs";

/// UFS registers that live in the per-instance header rather than being
/// replicated per cluster.
pub const UFS_HEADER_REGNAMES: [&str; 2] = ["UFS_HEADER", "UFS_FABRIC_CLUSTER_OFFSET"];

// The UFS header occupies 16 bytes at the start of each instance. Cluster
// offsets point past the header, while spec file offsets are relative to
// the header start.
const UFS_HEADER_SIZE: u32 = 16;

// TPMI is forward-compatible; when the caller does not know the VFM, the
// earliest TPMI-capable Xeon generation is assumed.
const DEFAULT_VFM: u32 = cpumodel::GRANITERAPIDS_X;

const DEBUGFS_MNT: &str = "/sys/kernel/debug";

// mdmap: instance -> register offset -> byte position in 'mem_dump'.
type Mdmap = BTreeMap<u32, BTreeMap<u32, u64>>;

// Raw register values captured while parsing 'mem_dump':
// instance -> offset -> value.
type DumpVals = BTreeMap<u32, BTreeMap<u32, u64>>;

struct AddrInfo {
    package: u32,
    // Lazily built; 'None' until the feature is first accessed.
    mdmap: Option<Mdmap>,
}

/// TPMI register access engine. Construction discovers the TPMI devices
/// (from debugfs or from a captured dump) and their features; the engine
/// lifetime owns the spec tables and position maps. If the engine mounted
/// debugfs itself, it unmounts it on drop.
pub struct TpmiEngine {
    exec: Rc<dyn Executor>,
    vfm: u32,
    dump_base: Option<PathBuf>,
    debugfs_mnt: PathBuf,
    unmount_on_drop: bool,
    readonly: bool,
    spec_infos: HashMap<String, SpecFileInfo>,
    spec_dirs: Vec<SpecDirInfo>,
    fdicts: HashMap<String, Fdict>,
    fmaps: HashMap<String, BTreeMap<String, AddrInfo>>,
    pkg2addrs: BTreeMap<u32, BTreeSet<String>>,
    unknown_fids: Vec<u8>,
    // (addr, instance) -> cluster ID -> cluster byte offset.
    cmaps: HashMap<(String, u32), BTreeMap<u32, u32>>,
}

fn is_hex(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

// Matches "tpmi-DDDD:BB:DD.F" (PCI address in lower-case hex).
fn parse_tpmi_dir_name(name: &str) -> Option<&str> {
    let addr = name.strip_prefix("tpmi-")?;
    let bytes: Vec<&str> = addr.split(':').collect();
    if bytes.len() != 3 {
        return None;
    }
    let (domain, bus) = (bytes[0], bytes[1]);
    let (device, function) = bytes[2].split_once('.')?;
    if domain.len() == 4
        && bus.len() == 2
        && device.len() == 2
        && function.len() == 1
        && [domain, bus, device, function].iter().all(|part| is_hex(part))
    {
        Some(addr)
    } else {
        None
    }
}

// Matches "tpmi-id-XX" (feature ID in hex).
fn parse_tpmi_id_dir_name(name: &str) -> Option<u8> {
    let fid = name.strip_prefix("tpmi-id-")?;
    if !is_hex(fid) {
        return None;
    }
    u8::from_str_radix(fid, 16).ok()
}

fn mount_debugfs(exec: &Rc<dyn Executor>) -> Result<(PathBuf, bool)> {
    let mounts = exec.read(Path::new("/proc/mounts"))?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _dev = fields.next();
        let mnt = fields.next();
        let fstype = fields.next();
        if fstype == Some("debugfs") {
            if let Some(mnt) = mnt {
                return Ok((PathBuf::from(mnt), false));
            }
        }
    }

    debug!("debugfs is not mounted, mounting it to '{DEBUGFS_MNT}'");
    let result = exec.run(&format!("mount -t debugfs none {DEBUGFS_MNT}"))?;
    if result.exitcode != 0 {
        return Err(Error::Io(format!(
            "failed to mount debugfs to '{DEBUGFS_MNT}'{}:\n{}",
            exec.hostmsg(),
            result.stderr.trim()
        )));
    }
    Ok((PathBuf::from(DEBUGFS_MNT), true))
}

impl TpmiEngine {
    /// Create an engine.
    ///
    /// `vfm` identifies the platform (or, for a dump, the platform the dump
    /// was captured on); Granite Rapids Xeon is assumed when absent.
    /// `specdirs` are searched for spec files in addition to the directory
    /// named by `PEPC_TPMI_DATA_PATH`. With `dump_base` set, the dump
    /// directory substitutes for the debugfs mount point and nothing is
    /// mounted.
    pub fn new(
        vfm: Option<u32>,
        specdirs: &[PathBuf],
        dump_base: Option<PathBuf>,
        exec: Rc<dyn Executor>,
    ) -> Result<TpmiEngine> {
        let vfm = vfm.unwrap_or_else(|| {
            debug!("no VFM specified, assuming Granite Rapids Xeon");
            DEFAULT_VFM
        });
        if !cpumodel::is_intel(vfm) {
            return Err(Error::NotSupported(format!(
                "unsupported CPU vendor{}: only Intel CPUs support TPMI",
                exec.hostmsg()
            )));
        }

        let (debugfs_mnt, unmount_on_drop) = match &dump_base {
            Some(base) => (base.clone(), false),
            None => mount_debugfs(&exec)?,
        };

        let all_spec_dirs = spec::find_spec_dirs(specdirs);
        let (spec_infos, spec_dirs) = spec::get_features(&all_spec_dirs, vfm)?;

        let mut engine = TpmiEngine {
            exec,
            vfm,
            dump_base,
            debugfs_mnt,
            unmount_on_drop,
            readonly: false,
            spec_infos,
            spec_dirs,
            fdicts: HashMap::new(),
            fmaps: HashMap::new(),
            pkg2addrs: BTreeMap::new(),
            unknown_fids: Vec::new(),
            cmaps: HashMap::new(),
        };
        engine.build_fmaps()?;
        Ok(engine)
    }

    /// Refuse all register writes from now on.
    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    pub fn vfm(&self) -> u32 {
        self.vfm
    }

    /// The scanned spec directories.
    pub fn spec_dirs(&self) -> &[SpecDirInfo] {
        &self.spec_dirs
    }

    fn scan_tpmi_pci_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in self.exec.lsdir(&self.debugfs_mnt)? {
            if let Some(addr) = parse_tpmi_dir_name(&entry.name) {
                dirs.push((addr.to_string(), entry.path.clone()));
            }
        }

        if !dirs.is_empty() {
            return Ok(dirs);
        }

        let expected = "expected to find 'tpmi-<PCI address>' sub-directories (e.g. \
                        'tpmi-0000:00:03.1'), but found none";
        if self.dump_base.is_some() {
            return Err(Error::NotSupported(format!(
                "no TPMI-related sub-directories found in the debugfs dump at '{}': {expected}. \
                 The dump does not appear to contain TPMI data",
                self.debugfs_mnt.display()
            )));
        }
        Err(Error::NotSupported(format!(
            "no TPMI-related sub-directories found in '{}': {expected}. TPMI does not appear to \
             be supported{}. Possible reasons:\n \
             1. Hardware does not support TPMI.\n \
             2. The kernel is old and does not have the TPMI driver (added in version 6.6).\n \
             3. The TPMI driver is not enabled (CONFIG_INTEL_TPMI)",
            self.debugfs_mnt.display(),
            self.exec.hostmsg()
        )))
    }

    fn feature_path(&self, addr: &str, fname: &str) -> Result<PathBuf> {
        let fid = self.spec_info(fname)?.feature_id;
        Ok(self
            .debugfs_mnt
            .join(format!("tpmi-{addr}"))
            .join(format!("tpmi-id-{fid:02x}")))
    }

    fn spec_info(&self, fname: &str) -> Result<&SpecFileInfo> {
        self.spec_infos.get(fname).ok_or_else(|| {
            let mut known: Vec<&str> = self.spec_infos.keys().map(|name| name.as_str()).collect();
            known.sort_unstable();
            Error::BadValue(format!(
                "unknown feature '{fname}'{}, known features are: {}",
                self.exec.hostmsg(),
                known.join(", ")
            ))
        })
    }

    fn load_fdict(&mut self, fname: &str) -> Result<()> {
        if !self.fdicts.contains_key(fname) {
            let info = self.spec_info(fname)?.clone();
            let fdict = spec::load_fdict(fname, &info.path)?;
            self.fdicts.insert(fname.to_string(), fdict);
        }
        Ok(())
    }

    fn fdict(&mut self, fname: &str) -> Result<&Fdict> {
        self.load_fdict(fname)?;
        Ok(&self.fdicts[fname])
    }

    fn register_def(&mut self, fname: &str, regname: &str) -> Result<spec::Register> {
        let fdict = self.fdict(fname)?;
        fdict.get(regname).cloned().ok_or_else(|| {
            Error::BadValue(format!(
                "register '{regname}' does not exist for feature '{fname}'"
            ))
        })
    }

    fn bitfield_def(&mut self, fname: &str, regname: &str, bfname: &str) -> Result<spec::BitField> {
        let regdef = self.register_def(fname, regname)?;
        regdef.fields.get(bfname).cloned().ok_or_else(|| {
            let mut available: Vec<&str> = regdef.fields.keys().map(|name| name.as_str()).collect();
            available.sort_unstable();
            Error::BadValue(format!(
                "bit field '{bfname}' not found for TPMI register '{regname}', feature \
                 '{fname}', available bit fields: {}",
                available.join(", ")
            ))
        })
    }

    /// Parse a `mem_dump` file into (position map, raw values). Two line
    /// formats exist:
    ///
    /// ```text
    /// TPMI Instance:1 offset:0x40005000
    ///  00000020: 013afd40 00004000 2244aacc deadbeef
    /// [00000020] 013afd40 00004000 2244aacc deadbeef
    /// ```
    ///
    /// The bracketed form is produced by older kernels. Byte positions of
    /// every 32-bit value are recorded for later direct-seek reads, and the
    /// values themselves are captured for dead-instance filtering.
    fn parse_mem_dump(&self, path: &Path) -> Result<(Mdmap, DumpVals)> {
        let contents = self.exec.read(path)?;

        let mut mdmap: Mdmap = BTreeMap::new();
        let mut vals: DumpVals = BTreeMap::new();
        let mut instance: Option<u32> = None;
        let mut pos: u64 = 0;

        for line in contents.split_inclusive('\n') {
            let stripped = line.trim_end_matches('\n');

            if let Some(rest) = stripped.strip_prefix("TPMI Instance:") {
                let (num, _) = rest.split_once(' ').ok_or_else(|| {
                    Error::BadValue(format!(
                        "unexpected line in TPMI file '{}':\n{stripped}",
                        path.display()
                    ))
                })?;
                let num = num.parse::<u32>().map_err(|_| {
                    Error::BadValue(format!(
                        "bad instance number '{num}' in TPMI file '{}'",
                        path.display()
                    ))
                })?;
                mdmap.insert(num, BTreeMap::new());
                vals.insert(num, BTreeMap::new());
                instance = Some(num);
            } else if stripped.starts_with(' ') || stripped.starts_with('[') {
                let instance = instance.ok_or_else(|| {
                    Error::BadValue(format!(
                        "data line before any 'TPMI Instance' line in '{}'",
                        path.display()
                    ))
                })?;

                let body = &stripped[1..];
                let offs_end = body.find([':', ']']).ok_or_else(|| {
                    Error::BadValue(format!(
                        "unexpected line in TPMI file '{}':\n{stripped}",
                        path.display()
                    ))
                })?;
                let offs_str = &body[..offs_end];
                let mut offs = u32::from_str_radix(offs_str, 16).map_err(|_| {
                    Error::BadValue(format!(
                        "bad TPMI offset '{offs_str}' in '{}'",
                        path.display()
                    ))
                })?;

                // Position of the first value: the leading character, the
                // offset, the ':' or ']', and one space.
                let mut line_pos = 3 + offs_str.len() as u64;

                for token in body[offs_end + 1..].trim_start().split(' ') {
                    if token.len() != 8 || !is_hex(token) {
                        return Err(Error::BadValue(format!(
                            "bad register value '{token}' at offset {offs:#x} in TPMI file '{}'",
                            path.display()
                        )));
                    }
                    let val = u64::from_str_radix(token, 16).unwrap();
                    vals.get_mut(&instance).unwrap().insert(offs, val);
                    mdmap.get_mut(&instance).unwrap().insert(offs, pos + line_pos);
                    line_pos += 9;
                    offs += 4;
                }
            } else if !stripped.is_empty() {
                return Err(Error::BadValue(format!(
                    "unexpected line in TPMI file '{}':\n{stripped}",
                    path.display()
                )));
            }

            pos += line.len() as u64;
        }

        Ok((mdmap, vals))
    }

    /// Drop dead instances from `mdmap` and verify interface versions.
    ///
    /// Every feature must have a register with an `INTERFACE_VERSION` bit
    /// field. Version 0xFF marks the instance as not implemented: its
    /// offset map is cleared and iteration skips it. Implemented instances
    /// must agree on the version, and only versions up to 0.3 are
    /// supported.
    fn drop_dead_instances(
        &mut self,
        fname: &str,
        addr: &str,
        mdmap: &mut Mdmap,
        vals: &DumpVals,
    ) -> Result<()> {
        let fdict = self.fdict(fname)?.clone();

        let mut version_reg_found = false;
        let mut expected: Option<(u8, u8)> = None;

        for (regname, regdef) in &fdict {
            let bfdef = match regdef.fields.get("INTERFACE_VERSION") {
                Some(bfdef) => bfdef,
                None => continue,
            };
            version_reg_found = true;

            let instances: Vec<u32> = mdmap.keys().copied().collect();
            for instance in instances {
                let regval = vals
                    .get(&instance)
                    .and_then(|offsets| offsets.get(&regdef.offset))
                    .copied()
                    .ok_or_else(|| {
                        Error::BadValue(format!(
                            "BUG: missing register {regname} at offset {:#x} for TPMI feature \
                             '{fname}', instance {instance}, address {addr}{}",
                            regdef.offset,
                            self.exec.hostmsg()
                        ))
                    })?;

                let version = ((regval & bfdef.bitmask) >> bfdef.bitshift) as u8;
                if version == 0xFF {
                    debug!(
                        "TPMI feature '{fname}', address {addr}, instance {instance} is not \
                         implemented, dropping it"
                    );
                    mdmap.insert(instance, BTreeMap::new());
                    continue;
                }

                // Bits 7:5 hold the major version, bits 4:0 the minor.
                let major = (version >> 5) & 0b111;
                let minor = version & 0b11111;

                if major != 0 || minor > 3 {
                    return Err(Error::NotSupported(format!(
                        "unsupported TPMI interface version {major}.{minor} for feature \
                         '{fname}', address {addr}{}: only TPMI up to version 0.3 is supported",
                        self.exec.hostmsg()
                    )));
                }

                match expected {
                    None => expected = Some((major, minor)),
                    Some((emajor, eminor)) => {
                        if emajor != major || eminor != minor {
                            return Err(Error::BadValue(format!(
                                "TPMI interface version mismatch for feature '{fname}', address \
                                 {addr}{}: expected {emajor}.{eminor}, got {major}.{minor}",
                                self.exec.hostmsg()
                            )));
                        }
                    }
                }
            }
        }

        if !version_reg_found {
            return Err(Error::BadValue(format!(
                "TPMI interface version register not found for feature '{fname}'"
            )));
        }
        Ok(())
    }

    fn build_mdmap(&mut self, addr: &str, fname: &str) -> Result<Mdmap> {
        let path = self.feature_path(addr, fname)?.join("mem_dump");
        debug!("reading 'mem_dump' of feature '{fname}' at '{}'", path.display());

        let (mut mdmap, vals) = self.parse_mem_dump(&path)?;
        self.drop_dead_instances(fname, addr, &mut mdmap, &vals)?;
        Ok(mdmap)
    }

    /// A best-effort package assignment for dumps that lack the
    /// 'tpmi_info' feature: Diamond Rapids platforms have two TPMI devices
    /// per package, everything else has one. Addresses are assigned to
    /// packages in sorted order.
    fn dummy_tpmi_info(&self, addr: &str, addrs: &BTreeSet<String>) -> (Mdmap, u32) {
        debug!("finding a reasonable dummy package number for TPMI device {addr}");

        let index = addrs.iter().position(|a| a == addr).unwrap_or(0);
        let package = if self.vfm == cpumodel::DIAMONDRAPIDS_X {
            (index / 2) as u32
        } else {
            index as u32
        };

        // Pretend 'tpmi_info' has only dead instances.
        let mut mdmap = Mdmap::new();
        mdmap.insert(0, BTreeMap::new());

        warn!("the 'tpmi_info' feature was not found in the debugfs dump");
        info!("using a dummy 'tpmi_info', assigning package number {package} to TPMI device {addr}");
        (mdmap, package)
    }

    fn build_fmaps(&mut self) -> Result<()> {
        let pci_dirs = self.scan_tpmi_pci_dirs()?;

        let mut fid2fname: HashMap<u8, String> = HashMap::new();
        for (fname, info) in &self.spec_infos {
            fid2fname.insert(info.feature_id, fname.clone());
        }

        let mut fname2addrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unknown_fids: BTreeSet<u8> = BTreeSet::new();
        let mut addrs_set: BTreeSet<String> = BTreeSet::new();

        for (addr, pci_path) in &pci_dirs {
            for entry in self.exec.lsdir(pci_path)? {
                let Some(fid) = parse_tpmi_id_dir_name(&entry.name) else {
                    continue;
                };
                match fid2fname.get(&fid) {
                    Some(fname) => {
                        fname2addrs.entry(fname.clone()).or_default().push(addr.clone());
                        addrs_set.insert(addr.clone());
                    }
                    // Supported by the hardware, but no spec file.
                    None => {
                        unknown_fids.insert(fid);
                    }
                }
            }
        }

        if fname2addrs.is_empty() {
            let paths = pci_dirs
                .iter()
                .map(|(_, path)| format!(" * {}", path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            let what = if self.dump_base.is_some() {
                "no TPMI features found in the debugfs dump"
            } else {
                "no TPMI features found"
            };
            return Err(Error::NotSupported(format!(
                "{what}{}, checked the following paths:\n{paths}",
                self.exec.hostmsg()
            )));
        }

        // Every TPMI device advertises 'tpmi_info'; it provides the package
        // number of every device. A dump may legitimately lack it, in which
        // case packages are synthesized, but on a live system its absence
        // means the spec files are broken.
        if !fname2addrs.contains_key("tpmi_info") && self.dump_base.is_none() {
            let dirs = self
                .spec_dirs
                .iter()
                .map(|dirinfo| format!(" * {}", dirinfo.path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::NotFound(format!(
                "spec file for the 'tpmi_info' TPMI feature was not found, checked in the \
                 following directories:\n{dirs}"
            )));
        }

        let have_tpmi_info = fname2addrs.contains_key("tpmi_info");
        self.fmaps.insert("tpmi_info".to_string(), BTreeMap::new());

        for (fname, addrs) in &fname2addrs {
            self.fmaps.entry(fname.clone()).or_default();

            for addr in addrs {
                if self.fmaps[fname].contains_key(addr) {
                    continue;
                }

                if !self.fmaps["tpmi_info"].contains_key(addr) {
                    let (mdmap, package) = if have_tpmi_info {
                        let mdmap = self.build_mdmap(addr, "tpmi_info")?;
                        let package = self.read_register_at(
                            "tpmi_info",
                            addr,
                            0,
                            0,
                            "TPMI_BUS_INFO",
                            Some("PACKAGE_ID"),
                            &mdmap,
                        )? as u32;
                        (mdmap, package)
                    } else {
                        self.dummy_tpmi_info(addr, &addrs_set)
                    };

                    self.fmaps.get_mut("tpmi_info").unwrap().insert(
                        addr.clone(),
                        AddrInfo {
                            package,
                            mdmap: Some(mdmap),
                        },
                    );
                    self.pkg2addrs.entry(package).or_default().insert(addr.clone());
                }

                if fname == "tpmi_info" {
                    continue;
                }

                let package = self.fmaps["tpmi_info"][addr].package;
                self.fmaps
                    .get_mut(fname)
                    .unwrap()
                    .insert(addr.clone(), AddrInfo { package, mdmap: None });
            }
        }

        self.unknown_fids = unknown_fids.into_iter().collect();
        Ok(())
    }

    fn mdmap(&mut self, fname: &str, addr: &str) -> Result<&Mdmap> {
        let needs_build = self
            .fmaps
            .get(fname)
            .and_then(|fmap| fmap.get(addr))
            .map(|addrinfo| addrinfo.mdmap.is_none())
            .ok_or_else(|| {
                Error::BadValue(format!(
                    "TPMI device '{addr}' does not exist for feature '{fname}'"
                ))
            })?;

        if needs_build {
            let mdmap = self.build_mdmap(addr, fname)?;
            self.fmaps.get_mut(fname).unwrap().get_mut(addr).unwrap().mdmap = Some(mdmap);
        }

        Ok(self.fmaps[fname][addr].mdmap.as_ref().unwrap())
    }

    fn validate_fname(&self, fname: &str) -> Result<()> {
        if self.fmaps.contains_key(fname) {
            return Ok(());
        }
        let mut known: Vec<&str> = self.fmaps.keys().map(|name| name.as_str()).collect();
        known.sort_unstable();
        Err(Error::BadValue(format!(
            "unknown feature '{fname}'{}, known features are: {}",
            self.exec.hostmsg(),
            known.join(", ")
        )))
    }

    fn validate_addr(&self, fname: &str, addr: &str, package: Option<u32>) -> Result<()> {
        if !self.fmaps[fname].contains_key(addr) {
            let addrs = self.fmaps[fname]
                .keys()
                .map(|addr| format!(" * {addr}"))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::BadValue(format!(
                "TPMI device '{addr}' does not exist for feature '{fname}'{}, available \
                 devices are:\n{addrs}",
                self.exec.hostmsg()
            )));
        }

        if let Some(package) = package {
            let correct = self.fmaps[fname][addr].package;
            if package != correct {
                return Err(Error::BadValue(format!(
                    "invalid package number '{package}' for TPMI device '{addr}', correct \
                     package number is '{correct}'"
                )));
            }
        }
        Ok(())
    }

    fn validate_package(&self, package: u32) -> Result<()> {
        if self.pkg2addrs.contains_key(&package) {
            return Ok(());
        }
        let packages: Vec<u32> = self.pkg2addrs.keys().copied().collect();
        Err(Error::BadValue(format!(
            "invalid package number '{package}'{}, valid package numbers are: {}",
            self.exec.hostmsg(),
            rangify(&packages)
        )))
    }

    fn validate_instance(&mut self, fname: &str, addr: &str, instance: u32) -> Result<()> {
        let mdmap = self.mdmap(fname, addr)?;
        if mdmap.contains_key(&instance) {
            return Ok(());
        }
        let instances: Vec<u32> = mdmap.keys().copied().collect();
        Err(Error::BadValue(format!(
            "instance {instance} not available for the '{fname}' TPMI device '{addr}'{}, \
             available instances are: {}",
            self.exec.hostmsg(),
            rangify(&instances)
        )))
    }

    fn validate_cluster(&mut self, addr: &str, instance: u32, cluster: u32, regname: &str) -> Result<()> {
        if cluster == 0 {
            return Ok(());
        }

        if UFS_HEADER_REGNAMES.contains(&regname) {
            return Err(Error::BadValue(format!(
                "register '{regname}' cannot be accessed for cluster '{cluster}' of UFS TPMI \
                 device '{addr}', instance '{instance}': this register is per-instance, not \
                 per-cluster"
            )));
        }

        let cmap = self.cmap(addr, instance)?;
        if cmap.contains_key(&cluster) {
            return Ok(());
        }
        let clusters: Vec<u32> = cmap.keys().copied().collect();
        Err(Error::BadValue(format!(
            "cluster {cluster} not available for the UFS TPMI device '{addr}', instance \
             '{instance}'{}, available cluster IDs are: {}",
            self.exec.hostmsg(),
            rangify(&clusters)
        )))
    }

    /// For a per-cluster register, translate the spec offset into the
    /// mem_dump offset of the given cluster. Cluster offsets point to
    /// UFS_STATUS, which follows the 16-byte per-instance header; spec
    /// offsets include the header, hence the subtraction.
    fn adjust_ufs_offset(&self, addr: &str, instance: u32, cluster: u32, offset: u32) -> Result<u32> {
        let coffset = self
            .cmaps
            .get(&(addr.to_string(), instance))
            .and_then(|cmap| cmap.get(&cluster))
            .copied()
            .ok_or_else(|| {
                Error::BadValue(format!(
                    "BUG: no cluster map for UFS TPMI device '{addr}', instance '{instance}', \
                     cluster '{cluster}'"
                ))
            })?;
        (offset + coffset).checked_sub(UFS_HEADER_SIZE).ok_or_else(|| {
            Error::BadValue(format!(
                "bad cluster offset {coffset:#x} for UFS TPMI device '{addr}', instance \
                 '{instance}', cluster '{cluster}': register offset {offset:#x} lands inside \
                 the UFS header"
            ))
        })
    }

    fn read_u32_at(&self, path: &Path, pos: u64) -> Result<u32> {
        let bytes = self.exec.read_bytes_at(path, pos, 8)?;
        let text = String::from_utf8_lossy(&bytes);
        u32::from_str_radix(&text, 16).map_err(|_| {
            Error::BadValue(format!(
                "bad register value '{text}' at position {pos} of '{}'",
                path.display()
            ))
        })
    }

    // Read one 32-bit word of a register, with cluster adjustment.
    #[allow(clippy::too_many_arguments)]
    fn read_word(
        &self,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        offset: u32,
        mdmap: &Mdmap,
    ) -> Result<u32> {
        let offsets = mdmap.get(&instance).ok_or_else(|| {
            let instances: Vec<u32> = mdmap.keys().copied().collect();
            Error::BadValue(format!(
                "bad instance number '{instance}' for TPMI feature '{fname}' and device \
                 '{addr}', available instances: {}",
                rangify(&instances)
            ))
        })?;

        let offset = if cluster > 0 {
            self.adjust_ufs_offset(addr, instance, cluster, offset)?
        } else {
            offset
        };

        let pos = offsets.get(&offset).copied().ok_or_else(|| {
            let max_offset = offsets.keys().max().copied().unwrap_or(0);
            Error::BadValue(format!(
                "bad offset '{offset:#x}' for register '{regname}' of TPMI feature '{fname}': \
                 should be a positive integer aligned to 4 and not exceeding '{max_offset}'"
            ))
        })?;

        let path = self.feature_path(addr, fname)?.join("mem_dump");
        self.read_u32_at(&path, pos)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_register_at(
        &mut self,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
        mdmap: &Mdmap,
    ) -> Result<u64> {
        let regdef = self.register_def(fname, regname)?;

        let mut val =
            self.read_word(fname, addr, instance, cluster, regname, regdef.offset, mdmap)? as u64;
        if regdef.width > 32 {
            // 64-bit registers are dumped as two consecutive 32-bit words.
            let high =
                self.read_word(fname, addr, instance, cluster, regname, regdef.offset + 4, mdmap)?;
            val |= (high as u64) << 32;
        }

        if let Some(bfname) = bfname {
            let bfdef = self.bitfield_def(fname, regname, bfname)?;
            val = (val & bfdef.bitmask) >> bfdef.bitshift;
            debug!("value of TPMI register '{regname}', bit field '{bfname}' is {val:#x}");
        } else {
            debug!("value of TPMI register '{regname}' is {val:#x}");
        }
        Ok(val)
    }

    fn read_register_internal(
        &mut self,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<u64> {
        let mdmap = self.mdmap(fname, addr)?.clone();
        self.read_register_at(fname, addr, instance, cluster, regname, bfname, &mdmap)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_register_internal(
        &mut self,
        value: u64,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<()> {
        if self.readonly {
            return Err(Error::PermissionDenied(format!(
                "TPMI is read-only{}",
                self.exec.hostmsg()
            )));
        }

        let regdef = self.register_def(fname, regname)?;

        if let Some(bfname) = bfname {
            let bfdef = self.bitfield_def(fname, regname, bfname)?;
            if bfdef.readonly {
                return Err(Error::PermissionDenied(format!(
                    "bit field '{bfname}' of TPMI register '{regname}' in feature '{fname}' is \
                     read-only{}",
                    self.exec.hostmsg()
                )));
            }
        } else if regdef.readonly {
            return Err(Error::PermissionDenied(format!(
                "TPMI register '{regname}' in feature '{fname}' is read-only{}",
                self.exec.hostmsg()
            )));
        }

        let mut offset = regdef.offset;
        let mut width = regdef.width;

        debug!(
            "writing {value:#x} to '{fname}' register '{regname}', instance '{instance}' at \
             offset {offset:#x} of TPMI device '{addr}'"
        );

        let value = if let Some(bfname) = bfname {
            let bfdef = self.bitfield_def(fname, regname, bfname)?;
            let (msb, lsb) = bfdef.bits;
            let max = ((1u128 << (msb - lsb + 1)) - 1) as u64;
            if value > max {
                return Err(Error::BadValue(format!(
                    "too large value '{value:#x}' for a {}-bit bit field '{bfname}' of register \
                     '{regname}'",
                    msb - lsb + 1
                )));
            }
            let regval = self.read_register_internal(fname, addr, instance, cluster, regname, None)?;
            (regval & !bfdef.bitmask) | (value << bfdef.bitshift)
        } else {
            if width < 64 && value > ((1u128 << width) - 1) as u64 {
                return Err(Error::BadValue(format!(
                    "too large value '{value:#x}' for a {width}-bit register '{regname}'"
                )));
            }
            value
        };

        // Ensure the instance and offsets exist before touching 'mem_write'.
        let mdmap = self.mdmap(fname, addr)?.clone();
        self.read_word(fname, addr, instance, cluster, regname, regdef.offset, &mdmap)?;

        if cluster > 0 {
            offset = self.adjust_ufs_offset(addr, instance, cluster, offset)?;
        }

        let path = self.feature_path(addr, fname)?.join("mem_write");
        let mut value = value;
        while width > 0 {
            // 64-bit registers are written as two 32-bit halves; the kernel
            // interface provides no atomicity across them.
            let word = (value & 0xffff_ffff) as u32;
            let data = format!("{instance},{offset},{word:#x}");
            debug!("writing '{data}' to '{}'", path.display());
            self.exec.write(&path, &data)?;

            width -= 32;
            offset += 4;
            value >>= 32;
        }
        Ok(())
    }

    fn cmap(&mut self, addr: &str, instance: u32) -> Result<&BTreeMap<u32, u32>> {
        let key = (addr.to_string(), instance);
        if self.cmaps.contains_key(&key) {
            return Ok(&self.cmaps[&key]);
        }

        // The 8-bit LOCAL_FABRIC_CLUSTER_ID_MASK names the clusters that
        // exist (bit i set = cluster i exists, up to 8 clusters), and
        // UFS_FABRIC_CLUSTER_OFFSET packs eight 8-bit offsets in 8-byte
        // units.
        let mask = self.read_register_internal(
            UFS_FEATURE,
            addr,
            instance,
            0,
            "UFS_HEADER",
            Some("LOCAL_FABRIC_CLUSTER_ID_MASK"),
        )?;
        let offsets = self.read_register_internal(
            UFS_FEATURE,
            addr,
            instance,
            0,
            "UFS_FABRIC_CLUSTER_OFFSET",
            None,
        )?;

        debug!(
            "building UFS cluster map for TPMI device '{addr}', instance '{instance}': \
             clusters_mask={mask:#x}, clusters_offsets={offsets:#x}"
        );

        let mdmap = self.mdmap(UFS_FEATURE, addr)?.clone();
        let mut cmap = BTreeMap::new();

        for cluster in 0..8u32 {
            if mask & (1 << cluster) == 0 {
                continue;
            }

            let offset_index = ((offsets >> (cluster * 8)) & 0xFF) as u32;
            let coffset = offset_index * 8;

            let valid = coffset % 4 == 0
                && mdmap
                    .get(&instance)
                    .map(|offsets| offsets.contains_key(&coffset))
                    .unwrap_or(false);
            if !valid {
                let max_offset = mdmap
                    .get(&instance)
                    .and_then(|offsets| offsets.keys().max().copied())
                    .unwrap_or(0);
                return Err(Error::BadValue(format!(
                    "bad cluster offset '{coffset:#x}' for UFS cluster '{cluster}' at address \
                     '{addr}', instance '{instance}': should be a positive integer aligned to 4 \
                     and not exceeding '{max_offset}'"
                )));
            }

            cmap.insert(cluster, coffset);
        }

        self.cmaps.insert(key.clone(), cmap);
        Ok(&self.cmaps[&key])
    }

    /// Spec information for all features present on the target system.
    pub fn get_known_features(&self) -> HashMap<String, SpecFileInfo> {
        self.fmaps
            .keys()
            .filter_map(|fname| {
                self.spec_infos
                    .get(fname)
                    .map(|info| (fname.clone(), info.clone()))
            })
            .collect()
    }

    /// Feature IDs present on the target system with no spec file.
    pub fn get_unknown_features(&self) -> Vec<u8> {
        self.unknown_fids.clone()
    }

    /// Spec information for one feature.
    pub fn get_sdict(&self, fname: &str) -> Result<&SpecFileInfo> {
        self.spec_info(fname)
    }

    /// The full register dictionary of a feature.
    pub fn get_fdict(&mut self, fname: &str) -> Result<&Fdict> {
        self.fdict(fname)
    }

    fn filter_instances(mdmap: &Mdmap, instances: &[u32]) -> Vec<u32> {
        if instances.is_empty() {
            // Skip dead instances (interface version was 0xFF).
            mdmap
                .iter()
                .filter(|(_, offsets)| !offsets.is_empty())
                .map(|(&instance, _)| instance)
                .collect()
        } else {
            instances
                .iter()
                .copied()
                .filter(|instance| {
                    mdmap.get(instance).map(|offsets| !offsets.is_empty()).unwrap_or(false)
                })
                .collect()
        }
    }

    /// Enumerate the live `(package, addr, instance)` tuples of a feature,
    /// optionally restricted to specific packages, addresses, or instances.
    /// For the UFS feature this assumes cluster 0; use
    /// `iter_feature_cluster()` to cover clusters.
    pub fn iter_feature(
        &mut self,
        fname: &str,
        packages: &[u32],
        addrs: &[&str],
        instances: &[u32],
    ) -> Result<Vec<(u32, String, u32)>> {
        self.validate_fname(fname)?;
        for &package in packages {
            self.validate_package(package)?;
        }
        for addr in addrs {
            self.validate_addr(fname, addr, None)?;
        }

        let all_addrs: Vec<String> = if addrs.is_empty() {
            self.fmaps[fname].keys().cloned().collect()
        } else {
            addrs.iter().map(|addr| addr.to_string()).collect()
        };
        let all_packages: Vec<u32> = if packages.is_empty() {
            self.pkg2addrs.keys().copied().collect()
        } else {
            packages.to_vec()
        };

        let mut result = Vec::new();
        for addr in &all_addrs {
            if !self.fmaps[fname].contains_key(addr) {
                continue;
            }

            let mdmap = match self.mdmap(fname, addr) {
                Ok(mdmap) => mdmap.clone(),
                Err(err) if err.is_not_found() => {
                    // No instances for this feature on this device.
                    debug!("{err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let package = self.fmaps[fname][addr].package;
            for &wanted in &all_packages {
                if package != wanted {
                    continue;
                }
                for instance in Self::filter_instances(&mdmap, instances) {
                    result.push((package, addr.clone(), instance));
                }
            }
        }
        Ok(result)
    }

    /// Enumerate `(package, addr, instance, cluster)` tuples of the UFS
    /// feature.
    pub fn iter_ufs_feature(
        &mut self,
        packages: &[u32],
        addrs: &[&str],
        instances: &[u32],
        clusters: &[u32],
    ) -> Result<Vec<(u32, String, u32, u32)>> {
        let mut result = Vec::new();
        for (package, addr, instance) in self.iter_feature(UFS_FEATURE, packages, addrs, instances)? {
            let cmap = self.cmap(&addr, instance)?;
            let present: Vec<u32> = if clusters.is_empty() {
                cmap.keys().copied().collect()
            } else {
                clusters.iter().copied().filter(|cluster| cmap.contains_key(cluster)).collect()
            };
            for cluster in present {
                result.push((package, addr.clone(), instance, cluster));
            }
        }
        Ok(result)
    }

    /// Enumerate `(package, addr, instance, cluster)` tuples of a feature.
    /// Non-UFS features have no clusters: cluster 0 is yielded for each
    /// instance, and requesting a non-zero cluster is an error.
    pub fn iter_feature_cluster(
        &mut self,
        fname: &str,
        packages: &[u32],
        addrs: &[&str],
        instances: &[u32],
        clusters: &[u32],
    ) -> Result<Vec<(u32, String, u32, u32)>> {
        if fname == UFS_FEATURE {
            return self.iter_ufs_feature(packages, addrs, instances, clusters);
        }

        for &cluster in clusters {
            if cluster != 0 {
                return Err(Error::BadValue(format!(
                    "invalid cluster '{cluster}': TPMI feature '{fname}' does not support \
                     clusters"
                )));
            }
        }

        Ok(self
            .iter_feature(fname, packages, addrs, instances)?
            .into_iter()
            .map(|(package, addr, instance)| (package, addr, instance, 0))
            .collect())
    }

    /// Read a register (or one of its bit fields). Assumes cluster 0 for
    /// the UFS feature.
    pub fn read_register(
        &mut self,
        fname: &str,
        addr: &str,
        instance: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<u64> {
        self.validate_fname(fname)?;
        self.validate_addr(fname, addr, None)?;
        if let Some(bfname) = bfname {
            self.bitfield_def(fname, regname, bfname)?;
        } else {
            self.register_def(fname, regname)?;
        }
        self.validate_instance(fname, addr, instance)?;

        self.read_register_internal(fname, addr, instance, 0, regname, bfname)
    }

    /// Read a UFS register (or bit field) from a specific cluster.
    pub fn read_ufs_register(
        &mut self,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<u64> {
        self.validate_fname(UFS_FEATURE)?;
        self.validate_addr(UFS_FEATURE, addr, None)?;
        if let Some(bfname) = bfname {
            self.bitfield_def(UFS_FEATURE, regname, bfname)?;
        } else {
            self.register_def(UFS_FEATURE, regname)?;
        }
        self.validate_instance(UFS_FEATURE, addr, instance)?;
        self.validate_cluster(addr, instance, cluster, regname)?;

        self.read_register_internal(UFS_FEATURE, addr, instance, cluster, regname, bfname)
    }

    /// Read a register from a specific cluster. Non-UFS features only
    /// accept cluster 0.
    pub fn read_register_cluster(
        &mut self,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<u64> {
        if fname == UFS_FEATURE {
            return self.read_ufs_register(addr, instance, cluster, regname, bfname);
        }
        if cluster != 0 {
            return Err(Error::BadValue(format!(
                "invalid cluster '{cluster}': TPMI feature '{fname}' does not support clusters \
                 other than 0"
            )));
        }
        self.read_register(fname, addr, instance, regname, bfname)
    }

    /// Extract a bit field from a register value previously read.
    pub fn get_bitfield(&mut self, regval: u64, fname: &str, regname: &str, bfname: &str) -> Result<u64> {
        self.validate_fname(fname)?;
        let bfdef = self.bitfield_def(fname, regname, bfname)?;
        Ok((regval & bfdef.bitmask) >> bfdef.bitshift)
    }

    /// Write a register (or one of its bit fields). Assumes cluster 0 for
    /// the UFS feature. Bit-field writes read the register, patch the
    /// field, and write the whole register back.
    pub fn write_register(
        &mut self,
        value: u64,
        fname: &str,
        addr: &str,
        instance: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<()> {
        self.validate_fname(fname)?;
        self.validate_addr(fname, addr, None)?;
        if let Some(bfname) = bfname {
            self.bitfield_def(fname, regname, bfname)?;
        } else {
            self.register_def(fname, regname)?;
        }
        self.validate_instance(fname, addr, instance)?;

        self.write_register_internal(value, fname, addr, instance, 0, regname, bfname)
    }

    /// Write a UFS register (or bit field) of a specific cluster.
    pub fn write_ufs_register(
        &mut self,
        value: u64,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<()> {
        self.validate_fname(UFS_FEATURE)?;
        self.validate_addr(UFS_FEATURE, addr, None)?;
        if let Some(bfname) = bfname {
            self.bitfield_def(UFS_FEATURE, regname, bfname)?;
        } else {
            self.register_def(UFS_FEATURE, regname)?;
        }
        self.validate_instance(UFS_FEATURE, addr, instance)?;
        self.validate_cluster(addr, instance, cluster, regname)?;

        self.write_register_internal(value, UFS_FEATURE, addr, instance, cluster, regname, bfname)
    }

    /// Write a register of a specific cluster. Non-UFS features only
    /// accept cluster 0.
    #[allow(clippy::too_many_arguments)]
    pub fn write_register_cluster(
        &mut self,
        value: u64,
        fname: &str,
        addr: &str,
        instance: u32,
        cluster: u32,
        regname: &str,
        bfname: Option<&str>,
    ) -> Result<()> {
        if fname == UFS_FEATURE {
            return self.write_ufs_register(value, addr, instance, cluster, regname, bfname);
        }
        if cluster != 0 {
            return Err(Error::BadValue(format!(
                "invalid cluster '{cluster}': TPMI feature '{fname}' does not support clusters"
            )));
        }
        self.write_register(value, fname, addr, instance, regname, bfname)
    }
}

impl Drop for TpmiEngine {
    fn drop(&mut self) {
        if self.unmount_on_drop {
            if let Err(err) = self.exec.run(&format!("umount {}", self.debugfs_mnt.display())) {
                debug!("failed to unmount '{}': {err}", self.debugfs_mnt.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpmi_dir_name_matching() {
        assert_eq!(parse_tpmi_dir_name("tpmi-0000:00:03.1"), Some("0000:00:03.1"));
        assert_eq!(parse_tpmi_dir_name("tpmi-00ff:a0:1e.7"), Some("00ff:a0:1e.7"));
        assert_eq!(parse_tpmi_dir_name("tpmi-0000:00:03"), None);
        assert_eq!(parse_tpmi_dir_name("tpmi-0000:00:03.1x"), None);
        assert_eq!(parse_tpmi_dir_name("tpmi-0000:00:3.1"), None);
        assert_eq!(parse_tpmi_dir_name("tpmi-0000:00:03.1".to_uppercase().as_str()), None);
        assert_eq!(parse_tpmi_dir_name("other"), None);
    }

    #[test]
    fn tpmi_id_dir_name_matching() {
        assert_eq!(parse_tpmi_id_dir_name("tpmi-id-02"), Some(0x02));
        assert_eq!(parse_tpmi_id_dir_name("tpmi-id-fe"), Some(0xFE));
        assert_eq!(parse_tpmi_id_dir_name("tpmi-id-"), None);
        assert_eq!(parse_tpmi_id_dir_name("tpmi-id-xyz"), None);
        assert_eq!(parse_tpmi_id_dir_name("mem_dump"), None);
    }
}
