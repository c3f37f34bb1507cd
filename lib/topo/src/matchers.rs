// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seams for the canonical server-shape matchers and the user ring parser.
//!
//! Known machine shapes (chordal ring, Rome 4P2H, 1H16P, 4H4P, ...) ship with
//! their own channel layouts; recognizing them is cheaper and better than
//! searching. Those recognizers live outside this crate and are injected into
//! the planner through these traits.

use crate::error::Result;
use crate::graph::TopoGraph;
use crate::topo::TopoSystem;

/// A declarative matcher for one canonical machine shape.
///
/// `try_match` either fully populates the graph (channels, bandwidths, types)
/// and returns `true`, or leaves it untouched and returns `false`.
pub trait ModelMatcher {
    fn name(&self) -> &'static str;

    fn try_match(&self, system: &TopoSystem, graph: &mut TopoGraph) -> Result<bool>;
}

/// Parser for a user-supplied textual ring specification.
///
/// Same contract as [`ModelMatcher::try_match`]: populate fully or leave the
/// graph untouched.
pub trait RingSpecParser {
    fn parse(&self, spec: &str, system: &TopoSystem, graph: &mut TopoGraph) -> Result<bool>;
}
