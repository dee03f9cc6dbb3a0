// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Intel CPU model identification.
//!
//! A VFM packs (vendor, family, model) into one integer the same way the
//! Linux kernel's `x86_vfm` does: `vendor << 16 | family << 8 | model`.
//! Platform-dependent register tables are keyed on VFM values and VFM
//! groups defined here.

pub const VENDOR_INTEL: u32 = 0;
pub const VENDOR_AMD: u32 = 2;

pub const fn vfm(vendor: u32, family: u32, model: u32) -> u32 {
    (vendor << 16) | (family << 8) | model
}

pub const fn split_vfm(vfm: u32) -> (u32, u32, u32) {
    (vfm >> 16, (vfm >> 8) & 0xff, vfm & 0xff)
}

pub const fn is_intel(vfm: u32) -> bool {
    (vfm >> 16) == VENDOR_INTEL
}

const fn intel(family: u32, model: u32) -> u32 {
    vfm(VENDOR_INTEL, family, model)
}

// "Big core" clients and servers, family 6.
pub const CORE2_MEROM: u32 = intel(6, 0x0F);
pub const NEHALEM: u32 = intel(6, 0x1E);
pub const NEHALEM_G: u32 = intel(6, 0x1F);
pub const NEHALEM_EP: u32 = intel(6, 0x1A);
pub const NEHALEM_EX: u32 = intel(6, 0x2E);
pub const WESTMERE: u32 = intel(6, 0x25);
pub const WESTMERE_EP: u32 = intel(6, 0x2C);
pub const WESTMERE_EX: u32 = intel(6, 0x2F);
pub const SANDYBRIDGE: u32 = intel(6, 0x2A);
pub const SANDYBRIDGE_X: u32 = intel(6, 0x2D);
pub const IVYBRIDGE: u32 = intel(6, 0x3A);
pub const IVYBRIDGE_X: u32 = intel(6, 0x3E);
pub const HASWELL: u32 = intel(6, 0x3C);
pub const HASWELL_X: u32 = intel(6, 0x3F);
pub const HASWELL_L: u32 = intel(6, 0x45);
pub const HASWELL_G: u32 = intel(6, 0x46);
pub const BROADWELL: u32 = intel(6, 0x3D);
pub const BROADWELL_G: u32 = intel(6, 0x47);
pub const BROADWELL_X: u32 = intel(6, 0x4F);
pub const BROADWELL_D: u32 = intel(6, 0x56);
pub const SKYLAKE_L: u32 = intel(6, 0x4E);
pub const SKYLAKE: u32 = intel(6, 0x5E);
pub const SKYLAKE_X: u32 = intel(6, 0x55);
pub const KABYLAKE_L: u32 = intel(6, 0x8E);
pub const KABYLAKE: u32 = intel(6, 0x9E);
pub const COMETLAKE: u32 = intel(6, 0xA5);
pub const COMETLAKE_L: u32 = intel(6, 0xA6);
pub const CANNONLAKE_L: u32 = intel(6, 0x66);
pub const ICELAKE_L: u32 = intel(6, 0x7E);
pub const ICELAKE: u32 = intel(6, 0x7D);
pub const ICELAKE_X: u32 = intel(6, 0x6A);
pub const ICELAKE_D: u32 = intel(6, 0x6C);
pub const LAKEFIELD: u32 = intel(6, 0x8A);
pub const ROCKETLAKE: u32 = intel(6, 0xA7);
pub const TIGERLAKE_L: u32 = intel(6, 0x8C);
pub const TIGERLAKE: u32 = intel(6, 0x8D);
pub const ALDERLAKE: u32 = intel(6, 0x97);
pub const ALDERLAKE_L: u32 = intel(6, 0x9A);
pub const RAPTORLAKE: u32 = intel(6, 0xB7);
pub const RAPTORLAKE_P: u32 = intel(6, 0xBA);
pub const RAPTORLAKE_S: u32 = intel(6, 0xBF);
pub const METEORLAKE: u32 = intel(6, 0xAC);
pub const METEORLAKE_L: u32 = intel(6, 0xAA);
pub const LUNARLAKE_M: u32 = intel(6, 0xBD);
pub const ARROWLAKE: u32 = intel(6, 0xC6);
pub const ARROWLAKE_H: u32 = intel(6, 0xC5);
pub const ARROWLAKE_U: u32 = intel(6, 0xB5);
pub const SAPPHIRERAPIDS_X: u32 = intel(6, 0x8F);
pub const EMERALDRAPIDS_X: u32 = intel(6, 0xCF);
pub const GRANITERAPIDS_X: u32 = intel(6, 0xAD);
pub const GRANITERAPIDS_D: u32 = intel(6, 0xAE);
pub const DIAMONDRAPIDS_X: u32 = intel(19, 0x01);

// Atoms.
pub const ATOM_BONNELL: u32 = intel(6, 0x1C);
pub const ATOM_BONNELL_MID: u32 = intel(6, 0x26);
pub const ATOM_SALTWELL: u32 = intel(6, 0x36);
pub const ATOM_SALTWELL_MID: u32 = intel(6, 0x27);
pub const ATOM_SALTWELL_TABLET: u32 = intel(6, 0x35);
pub const ATOM_SILVERMONT: u32 = intel(6, 0x37);
pub const ATOM_SILVERMONT_D: u32 = intel(6, 0x4D);
pub const ATOM_SILVERMONT_MID: u32 = intel(6, 0x4A);
pub const ATOM_AIRMONT: u32 = intel(6, 0x4C);
pub const ATOM_GOLDMONT: u32 = intel(6, 0x5C);
pub const ATOM_GOLDMONT_D: u32 = intel(6, 0x5F);
pub const ATOM_GOLDMONT_PLUS: u32 = intel(6, 0x7A);
pub const ATOM_TREMONT: u32 = intel(6, 0x96);
pub const ATOM_TREMONT_D: u32 = intel(6, 0x86);
pub const ATOM_TREMONT_L: u32 = intel(6, 0x9C);
pub const ATOM_CRESTMONT: u32 = intel(6, 0xB6);
pub const ATOM_CRESTMONT_X: u32 = intel(6, 0xAF);
pub const ATOM_DARKMONT_X: u32 = intel(6, 0xDD);

// Xeon Phi.
pub const XEON_PHI_KNL: u32 = intel(6, 0x57);
pub const XEON_PHI_KNM: u32 = intel(6, 0x85);

// VFM groups referenced by the per-register feature tables.
pub const GROUP_NEHALEM: &[u32] = &[NEHALEM, NEHALEM_G, NEHALEM_EP, NEHALEM_EX];
pub const GROUP_WESTMERE: &[u32] = &[WESTMERE, WESTMERE_EP, WESTMERE_EX];
pub const GROUP_SANDYBRIDGE: &[u32] = &[SANDYBRIDGE, SANDYBRIDGE_X];
pub const GROUP_IVYBRIDGE: &[u32] = &[IVYBRIDGE, IVYBRIDGE_X];
pub const GROUP_HASWELL: &[u32] = &[HASWELL, HASWELL_X, HASWELL_L, HASWELL_G];
pub const GROUP_BROADWELL: &[u32] = &[BROADWELL, BROADWELL_G, BROADWELL_X, BROADWELL_D];
pub const GROUP_SKYLAKE: &[u32] = &[SKYLAKE_L, SKYLAKE, SKYLAKE_X];
pub const GROUP_SKL_CLIENT: &[u32] = &[SKYLAKE_L, SKYLAKE];
pub const GROUP_SKX: &[u32] = &[SKYLAKE_X];
pub const GROUP_KABYLAKE: &[u32] = &[KABYLAKE_L, KABYLAKE];
pub const GROUP_COMETLAKE: &[u32] = &[COMETLAKE, COMETLAKE_L];
pub const GROUP_CANNONLAKE: &[u32] = &[CANNONLAKE_L];
pub const GROUP_ICELAKE: &[u32] = &[ICELAKE_L, ICELAKE, ICELAKE_X, ICELAKE_D];
pub const GROUP_ICL_CLIENT: &[u32] = &[ICELAKE_L, ICELAKE];
pub const GROUP_ICX: &[u32] = &[ICELAKE_X, ICELAKE_D];
pub const GROUP_LAKEFIELD: &[u32] = &[LAKEFIELD];
pub const GROUP_ROCKETLAKE: &[u32] = &[ROCKETLAKE];
pub const GROUP_TIGERLAKE: &[u32] = &[TIGERLAKE_L, TIGERLAKE];
pub const GROUP_ALDERLAKE: &[u32] = &[ALDERLAKE, ALDERLAKE_L];
pub const GROUP_RAPTORLAKE: &[u32] = &[RAPTORLAKE, RAPTORLAKE_P, RAPTORLAKE_S];
pub const GROUP_METEORLAKE: &[u32] = &[METEORLAKE, METEORLAKE_L];
pub const GROUP_LUNARLAKE: &[u32] = &[LUNARLAKE_M];
pub const GROUP_ARROWLAKE: &[u32] = &[ARROWLAKE, ARROWLAKE_H, ARROWLAKE_U];
pub const GROUP_SPR: &[u32] = &[SAPPHIRERAPIDS_X];
pub const GROUP_EMR: &[u32] = &[EMERALDRAPIDS_X];
pub const GROUP_GNR: &[u32] = &[GRANITERAPIDS_X, GRANITERAPIDS_D];
pub const GROUP_SILVERMONT: &[u32] = &[ATOM_SILVERMONT, ATOM_SILVERMONT_D, ATOM_SILVERMONT_MID];
pub const GROUP_AIRMONT: &[u32] = &[ATOM_AIRMONT];
pub const GROUP_GOLDMONT: &[u32] = &[ATOM_GOLDMONT, ATOM_GOLDMONT_D, ATOM_GOLDMONT_PLUS];
pub const GROUP_TREMONT: &[u32] = &[ATOM_TREMONT, ATOM_TREMONT_D, ATOM_TREMONT_L];
pub const GROUP_CRESTMONT: &[u32] = &[ATOM_CRESTMONT, ATOM_CRESTMONT_X];
pub const GROUP_DARKMONT: &[u32] = &[ATOM_DARKMONT_X];
pub const GROUP_PHI: &[u32] = &[XEON_PHI_KNL, XEON_PHI_KNM];

/// Codename of a VFM, for human-facing messages.
pub fn codename(vfm: u32) -> Option<&'static str> {
    let name = match vfm {
        v if v == SKYLAKE_X => "Skylake Xeon",
        v if v == ICELAKE_X => "Ice Lake Xeon",
        v if v == ICELAKE_D => "Ice Lake Xeon D",
        v if v == SAPPHIRERAPIDS_X => "Sapphire Rapids Xeon",
        v if v == EMERALDRAPIDS_X => "Emerald Rapids Xeon",
        v if v == GRANITERAPIDS_X => "Granite Rapids Xeon",
        v if v == GRANITERAPIDS_D => "Granite Rapids Xeon D",
        v if v == DIAMONDRAPIDS_X => "Diamond Rapids Xeon",
        v if v == ATOM_CRESTMONT_X => "Sierra Forest Xeon",
        v if v == ATOM_DARKMONT_X => "Clearwater Forest Xeon",
        v if v == ALDERLAKE => "Alder Lake",
        v if v == ALDERLAKE_L => "Alder Lake mobile",
        v if v == RAPTORLAKE => "Raptor Lake",
        v if v == RAPTORLAKE_P => "Raptor Lake mobile",
        v if v == RAPTORLAKE_S => "Raptor Lake S",
        v if v == METEORLAKE => "Meteor Lake",
        v if v == METEORLAKE_L => "Meteor Lake mobile",
        v if v == LUNARLAKE_M => "Lunar Lake mobile",
        v if v == ARROWLAKE => "Arrow Lake",
        v if v == ATOM_SILVERMONT => "Silvermont Atom",
        v if v == ATOM_AIRMONT => "Airmont Atom",
        _ => return None,
    };
    Some(name)
}
