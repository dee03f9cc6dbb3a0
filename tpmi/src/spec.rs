// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TPMI spec files: discovery, partial scanning, and full loading.
//!
//! A spec directory contains an `index.yml` mapping VFM values to
//! per-platform sub-directories of spec files, one YAML file per TPMI
//! feature. During startup only the head of each spec file is read (the
//! `name`, `desc` and `feature_id` keys, required to come first and in that
//! order); the full register table is loaded lazily per feature.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use base::Error;
use base::Result;
use log::debug;
use log::warn;
use serde::Deserialize;

/// Extra spec directory supplied by the user. Ignored (with a warning)
/// unless it holds an `index.yml`.
pub const SPECS_PATH_ENVVAR: &str = "PEPC_TPMI_DATA_PATH";

// Scanning limits: a spec directory is trusted input, but a typo'ed path
// should fail fast instead of slurping a huge tree.
const MAX_SPEC_FILES: usize = 256;
const MAX_NON_YAML: usize = 32;
const MAX_SCAN_LOAD_ERRORS: usize = 4;
const MAX_SPEC_FILE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

// How much of a spec file the partial scan is willing to read while looking
// for the three header keys.
const SCAN_HEAD_BYTES: usize = 8192;

/// Basic information about one spec file, extracted by the partial scan.
#[derive(Clone, Debug)]
pub struct SpecFileInfo {
    pub name: String,
    pub desc: String,
    pub feature_id: u8,
    pub path: PathBuf,
}

/// A scanned spec directory.
#[derive(Clone, Debug)]
pub struct SpecDirInfo {
    pub path: PathBuf,
    pub vfm: u32,
    pub subdir: String,
    pub platform_name: String,
}

/// One bit field of a TPMI register.
#[derive(Clone, Debug)]
pub struct BitField {
    pub desc: String,
    pub readonly: bool,
    /// Inclusive `(msb, lsb)`.
    pub bits: (u32, u32),
    pub bitshift: u32,
    pub bitmask: u64,
}

/// One TPMI register of a feature.
#[derive(Clone, Debug)]
pub struct Register {
    /// Byte offset within the instance memory space, a multiple of 4.
    pub offset: u32,
    /// 32 or 64.
    pub width: u32,
    /// A register is read-write when at least one field is.
    pub readonly: bool,
    pub fields: HashMap<String, BitField>,
}

/// A feature's register dictionary: register name to definition.
pub type Fdict = HashMap<String, Register>;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIndexEntry {
    subdir: String,
    platform_name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIndex {
    version: String,
    vfms: BTreeMap<u32, RawIndexEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    bits: String,
    readonly: bool,
    desc: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegister {
    offset: u32,
    width: u32,
    fields: BTreeMap<String, RawField>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpec {
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    desc: String,
    // Spec files prior to format 1.6.2 used 'feature-id'.
    #[serde(alias = "feature-id")]
    #[allow(dead_code)]
    feature_id: u8,
    registers: BTreeMap<String, RawRegister>,
}

/// Spec directories to search: the `PEPC_TPMI_DATA_PATH` directory when it
/// is usable, then the given default directories.
pub fn find_spec_dirs(defaults: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(val) = env::var(SPECS_PATH_ENVVAR) {
        if !val.is_empty() {
            let dir = PathBuf::from(&val);
            if !dir.is_dir() {
                warn!(
                    "TPMI spec files path '{val}' from the '{SPECS_PATH_ENVVAR}' environment \
                     variable does not exist or is not a directory, ignoring it"
                );
            } else if !dir.join("index.yml").is_file() {
                warn!(
                    "TPMI spec files path '{val}' from the '{SPECS_PATH_ENVVAR}' environment \
                     variable does not contain an 'index.yml' file, ignoring it"
                );
            } else {
                dirs.push(dir);
            }
        }
    }

    dirs.extend(defaults.iter().cloned());
    dirs
}

fn parse_index_file(specdir: &Path, vfm: u32) -> Result<SpecDirInfo> {
    let idxpath = specdir.join("index.yml");
    let text = fs::read_to_string(&idxpath).map_err(|err| {
        Error::NotFound(format!("failed to read index file '{}': {err}", idxpath.display()))
    })?;

    let index: RawIndex = serde_yaml::from_str(&text).map_err(|err| {
        Error::BadValue(format!("bad index file '{}':\n  {err}", idxpath.display()))
    })?;

    if index.version != "1.0" {
        return Err(Error::BadValue(format!(
            "bad index file '{}': unsupported index format version '{}', only version '1.0' \
             is supported",
            idxpath.display(),
            index.version
        )));
    }

    match index.vfms.get(&vfm) {
        Some(entry) => Ok(SpecDirInfo {
            path: specdir.to_path_buf(),
            vfm,
            subdir: entry.subdir.clone(),
            platform_name: entry.platform_name.clone(),
        }),
        None => {
            let available = index
                .vfms
                .keys()
                .map(|vfm| vfm.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(Error::NotFound(format!(
                "no matching platform for VFM {vfm} found in '{}', available VFMs are: \
                 {available}",
                idxpath.display()
            )))
        }
    }
}

/// Partially load the spec file at `path`: read just enough to extract the
/// `name`, `desc` and `feature_id` keys. They must be the first three
/// top-level keys, in that order, none repeated.
fn load_spec_info(path: &Path) -> Result<SpecFileInfo> {
    let meta = fs::metadata(path)
        .map_err(|err| Error::Io(format!("failed to access spec file '{}': {err}", path.display())))?;
    if !meta.is_file() {
        return Err(Error::BadValue(format!("'{}' is not a regular file", path.display())));
    }
    if meta.len() > MAX_SPEC_FILE_BYTES {
        return Err(Error::BadValue(format!(
            "too large spec file '{}', maximum allowed size is 4 GiB",
            path.display()
        )));
    }

    let mut file = fs::File::open(path)
        .map_err(|err| Error::Io(format!("failed to open spec file '{}': {err}", path.display())))?;
    let mut head = vec![0u8; SCAN_HEAD_BYTES];
    let mut used = 0;
    while used < head.len() {
        let n = file
            .read(&mut head[used..])
            .map_err(|err| Error::Io(format!("failed to read spec file '{}': {err}", path.display())))?;
        if n == 0 {
            break;
        }
        used += n;
    }
    head.truncate(used);
    let head = String::from_utf8_lossy(&head);

    const KEYS: [&str; 3] = ["name", "desc", "feature_id"];
    let mut values: Vec<String> = Vec::new();

    for line in head.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        // Only top-level scalar keys qualify.
        if line.starts_with(char::is_whitespace) {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            break;
        };
        let key = key.trim();
        let nkeys = values.len();

        if nkeys < KEYS.len() {
            if key != KEYS[nkeys] {
                if KEYS.contains(&key) {
                    return Err(Error::BadValue(format!(
                        "bad spec file '{}': repeating or misordered key '{key}', the first 3 \
                         keys must be 'name', 'desc', and 'feature_id', in this order",
                        path.display()
                    )));
                }
                return Err(Error::BadValue(format!(
                    "bad spec file '{}': the first 3 keys must be 'name', 'desc', and \
                     'feature_id', got key '{key}' instead",
                    path.display()
                )));
            }
            values.push(value.trim().trim_matches('"').to_string());
            if values.len() == KEYS.len() {
                break;
            }
        }
    }

    if values.len() < KEYS.len() {
        let missing = KEYS[values.len()..].join(", ");
        return Err(Error::BadValue(format!(
            "bad spec file '{}': missing keys '{missing}'",
            path.display()
        )));
    }

    let feature_id = parse_u8(&values[2]).ok_or_else(|| {
        Error::BadValue(format!(
            "bad spec file '{}': bad 'feature_id' key value '{}'",
            path.display(),
            values[2]
        ))
    })?;

    Ok(SpecFileInfo {
        name: values[0].clone(),
        desc: values[1].clone(),
        feature_id,
        path: path.to_path_buf(),
    })
}

fn parse_u8(text: &str) -> Option<u8> {
    if let Some(hex) = text.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u8>().ok()
    }
}

/// Scan spec directories and return the spec file information for every
/// feature available for `vfm`, plus the scanned directories. Only spec
/// file heads are read. The first directory providing a feature wins.
pub fn get_features(
    specdirs: &[PathBuf],
    vfm: u32,
) -> Result<(HashMap<String, SpecFileInfo>, Vec<SpecDirInfo>)> {
    let mut infos: HashMap<String, SpecFileInfo> = HashMap::new();
    let mut dirs: Vec<SpecDirInfo> = Vec::new();

    for specdir in specdirs {
        let dirinfo = match parse_index_file(specdir, vfm) {
            Ok(dirinfo) => dirinfo,
            Err(err) => {
                warn!(
                    "failed to parse TPMI spec index file in directory '{}':\n  {err}",
                    specdir.display()
                );
                continue;
            }
        };

        let subdir = specdir.join(&dirinfo.subdir);
        let entries = match fs::read_dir(&subdir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    "failed to access TPMI spec files directory '{}':\n  {err}",
                    subdir.display()
                );
                continue;
            }
        };

        let mut spec_files = 0;
        let mut non_yaml = 0;
        let mut load_errors = 0;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".yml") && !name.ends_with(".yaml") {
                non_yaml += 1;
                if non_yaml > MAX_NON_YAML {
                    return Err(Error::BadValue(format!(
                        "too many non-YAML files in '{}', maximum allowed count is \
                         {MAX_NON_YAML}",
                        subdir.display()
                    )));
                }
                continue;
            }

            let path = subdir.join(&name);
            let info = match load_spec_info(&path) {
                Ok(info) => info,
                Err(err) => {
                    load_errors += 1;
                    if load_errors > MAX_SCAN_LOAD_ERRORS {
                        return Err(Error::BadValue(format!(
                            "failed to load spec file '{}':\n  {err}\nreached the maximum spec \
                             file load errors count of {MAX_SCAN_LOAD_ERRORS}",
                            path.display()
                        )));
                    }
                    continue;
                }
            };

            if infos.contains_key(&info.name) {
                debug!(
                    "spec file for TPMI feature '{}' was already loaded, skipping '{}'",
                    info.name,
                    path.display()
                );
                continue;
            }

            spec_files += 1;
            if spec_files > MAX_SPEC_FILES {
                return Err(Error::BadValue(format!(
                    "too many spec files in '{}', maximum allowed number of spec files is \
                     {MAX_SPEC_FILES}",
                    subdir.display()
                )));
            }

            infos.insert(info.name.clone(), info);
        }

        dirs.push(dirinfo);
    }

    if infos.is_empty() {
        let paths = specdirs
            .iter()
            .map(|path| format!(" * {}", path.display()))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::NotSupported(format!(
            "no TPMI spec files found, checked the following paths:\n{paths}"
        )));
    }

    Ok((infos, dirs))
}

/// Fully load and validate the spec file of feature `fname`, returning its
/// register dictionary with the synthesized `bitshift`/`bitmask` per field
/// and the register-level `readonly` flag.
pub fn load_fdict(fname: &str, path: &Path) -> Result<Fdict> {
    let bad = |msg: String| {
        Error::BadValue(format!(
            "bad TPMI feature '{fname}' spec file '{}':\n  {msg}",
            path.display()
        ))
    };

    let text = fs::read_to_string(path)
        .map_err(|err| Error::Io(format!("failed to read spec file '{}': {err}", path.display())))?;
    let spec: RawSpec = serde_yaml::from_str(&text).map_err(|err| bad(err.to_string()))?;

    let mut fdict = HashMap::new();

    for (regname, raw) in spec.registers {
        if regname.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(bad(format!(
                "bad TPMI register name '{regname}': should include only upper case characters"
            )));
        }
        if raw.offset % 4 != 0 {
            return Err(bad(format!(
                "bad offset '{}' in TPMI register '{regname}': must be a multiple of 4 bytes",
                raw.offset
            )));
        }
        if raw.width != 32 && raw.width != 64 {
            return Err(bad(format!(
                "bad width '{}' in TPMI register '{regname}': must be either 32 or 64",
                raw.width
            )));
        }

        let mut all_fields_rw = true;
        let mut fields = HashMap::new();

        for (bfname, rawbf) in raw.fields {
            if bfname.chars().any(|c| c.is_ascii_lowercase()) {
                return Err(bad(format!(
                    "bad bit field name '{bfname}' for TPMI register '{regname}': should \
                     include only upper case characters"
                )));
            }
            if rawbf.desc.contains('\n') {
                return Err(bad(format!(
                    "bad description of bit field '{bfname}' of the '{regname}' TPMI register: \
                     includes a newline character"
                )));
            }

            let mut split = rawbf.bits.splitn(2, ':');
            let msb = split.next().and_then(|s| s.trim().parse::<u32>().ok());
            let lsb = split.next().and_then(|s| s.trim().parse::<u32>().ok());
            let (msb, lsb) = match (msb, lsb) {
                (Some(msb), Some(lsb)) => (msb, lsb),
                _ => {
                    return Err(bad(format!(
                        "bad 'bits' key value '{}' in bit field '{bfname}' of the '{regname}' \
                         TPMI register: should have the '<high-bit>:<low-bit>' format",
                        rawbf.bits
                    )))
                }
            };
            if msb < lsb {
                return Err(bad(format!(
                    "bad 'bits' key value '{}' in bit field '{bfname}' of the '{regname}' TPMI \
                     register: high bit value '{msb}' is smaller than low bit value '{lsb}'",
                    rawbf.bits
                )));
            }
            if msb >= raw.width {
                return Err(bad(format!(
                    "bad 'bits' key value '{}' in bit field '{bfname}' of the '{regname}' TPMI \
                     register: bit {msb} does not exist in a {}-bit register",
                    rawbf.bits, raw.width
                )));
            }

            all_fields_rw = all_fields_rw && !rawbf.readonly;

            let bitmask = (((1u128 << (msb + 1)) - 1) ^ ((1u128 << lsb) - 1)) as u64;
            fields.insert(
                bfname,
                BitField {
                    desc: rawbf.desc,
                    readonly: rawbf.readonly,
                    bits: (msb, lsb),
                    bitshift: lsb,
                    bitmask,
                },
            );
        }

        fdict.insert(
            regname,
            Register {
                offset: raw.offset,
                width: raw.width,
                readonly: !all_fields_rw,
                fields,
            },
        );
    }

    Ok(fdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const GOOD_SPEC: &str = "\
name: rapl
desc: Running Average Power Limit
feature_id: 0x00
registers:
    RAPL_HEADER:
        offset: 0
        width: 64
        fields:
            INTERFACE_VERSION:
                bits: \"7:0\"
                readonly: true
                desc: Interface version.
    SOCKET_RAPL_PL1_CONTROL:
        offset: 8
        width: 64
        fields:
            POWER_LIMIT:
                bits: \"16:0\"
                readonly: false
                desc: Power limit.
            ENABLE:
                bits: \"17:17\"
                readonly: false
                desc: Power limit enable.
";

    #[test]
    fn partial_scan_reads_header_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "rapl.yml", GOOD_SPEC);
        let info = load_spec_info(&path).unwrap();
        assert_eq!(info.name, "rapl");
        assert_eq!(info.desc, "Running Average Power Limit");
        assert_eq!(info.feature_id, 0);
    }

    #[test]
    fn partial_scan_enforces_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad.yml",
            "desc: x\nname: y\nfeature_id: 1\nregisters: {}\n",
        );
        assert!(load_spec_info(&path).is_err());

        let path = write_file(
            dir.path(),
            "bad2.yml",
            "name: x\ndesc: y\nregisters: {}\n",
        );
        assert!(load_spec_info(&path).is_err());
    }

    #[test]
    fn fdict_synthesizes_masks_and_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "rapl.yml", GOOD_SPEC);
        let fdict = load_fdict("rapl", &path).unwrap();

        let header = &fdict["RAPL_HEADER"];
        assert!(header.readonly);
        let version = &header.fields["INTERFACE_VERSION"];
        assert_eq!(version.bitshift, 0);
        assert_eq!(version.bitmask, 0xff);

        let control = &fdict["SOCKET_RAPL_PL1_CONTROL"];
        assert!(!control.readonly);
        let enable = &control.fields["ENABLE"];
        assert_eq!(enable.bitshift, 17);
        assert_eq!(enable.bitmask, 1 << 17);
    }

    #[test]
    fn fdict_rejects_lower_case_register_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad.yml",
            "name: x\ndesc: y\nfeature_id: 1\nregisters:\n    bad_reg:\n        offset: 0\n\
             \x20       width: 32\n        fields: {}\n",
        );
        assert!(load_fdict("x", &path).is_err());
    }

    #[test]
    fn fdict_rejects_misaligned_offset_and_bad_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad.yml",
            "name: x\ndesc: y\nfeature_id: 1\nregisters:\n    REG:\n        offset: 6\n\
             \x20       width: 32\n        fields: {}\n",
        );
        assert!(load_fdict("x", &path).is_err());

        let path = write_file(
            dir.path(),
            "bad2.yml",
            "name: x\ndesc: y\nfeature_id: 1\nregisters:\n    REG:\n        offset: 8\n\
             \x20       width: 16\n        fields: {}\n",
        );
        assert!(load_fdict("x", &path).is_err());
    }

    #[test]
    fn index_scan_selects_platform_subdir() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "index.yml",
            "version: \"1.0\"\nvfms:\n    1709:\n        subdir: gnr\n\
             \x20       platform_name: Granite Rapids Xeon\n",
        );
        write_file(dir.path(), "gnr/rapl.yml", GOOD_SPEC);

        let (infos, dirs) = get_features(&[dir.path().to_path_buf()], 1709).unwrap();
        assert!(infos.contains_key("rapl"));
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].platform_name, "Granite Rapids Xeon");

        // Unknown VFM: the index has no entry, so no specs are found.
        assert!(get_features(&[dir.path().to_path_buf()], 42).is_err());
    }
}
