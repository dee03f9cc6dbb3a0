// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Model-Specific Register access: a cached, scope-aware, transactional
//! engine over the `/dev/cpu/<n>/msr` character devices, and a declarative
//! "featured MSR" layer that turns raw 64-bit registers into named,
//! type-checked bit-field features.

mod cache;
mod engine;
mod features;

pub mod regs;

pub use cache::PerCpuCache;
pub use engine::get_bits;
pub use engine::set_bits;
pub use engine::MsrEngine;
pub use features::clx_ap_adjusted_scope;
pub use features::FeatureDef;
pub use features::FeatureHook;
pub use features::FeatureType;
pub use features::FeatureValue;
pub use features::FeaturedMsr;
