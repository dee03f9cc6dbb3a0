// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Non-compute die discovery against the committed TPMI debugfs dump.

use std::path::Path;
use std::rc::Rc;

use base::Executor;
use base::LocalExecutor;
use pmctl::AgentType;
use pmctl::NonCompDies;
use tpmi::TpmiEngine;

const GNR_VFM: u32 = 1709;

fn noncomp() -> NonCompDies {
    let base = Path::new(env!("CARGO_MANIFEST_DIR")).join("test-data/test_tpmi_nohost");
    let exec = Rc::new(LocalExecutor::new());
    let tpmi = TpmiEngine::new(
        Some(GNR_VFM),
        &[base.join("specs")],
        Some(base.join("debugfs-dump")),
        exec as Rc<dyn Executor>,
    )
    .unwrap();
    NonCompDies::new(tpmi)
}

#[test]
fn discovers_noncompute_dies() {
    let mut noncomp = noncomp();

    let dies = noncomp.get_dies().unwrap().clone();
    assert_eq!(dies.len(), 1);
    assert_eq!(dies[&0], vec![2, 3]);

    let sets = noncomp.get_dies_sets().unwrap();
    assert!(sets[&0].contains(&2));
    assert!(sets[&0].contains(&3));
}

#[test]
fn die_titles_and_agent_types() {
    let mut noncomp = noncomp();
    let info = noncomp.get_dies_info().unwrap();

    let die2 = &info[&0][&2];
    assert_eq!(die2.agent_types, vec![AgentType::Io]);
    assert_eq!(die2.title, "I/O");

    let die3 = &info[&0][&3];
    assert_eq!(die3.agent_types, vec![AgentType::Cache, AgentType::Memory]);
    assert_eq!(die3.title, "Cache and memory");
}
