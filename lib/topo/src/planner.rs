// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The outer search driver.
//!
//! [`Planner::compute`] first consults the declarative sources (XML override,
//! user ring specification, canonical-shape matchers). On a miss it seeds the
//! working graph at the highest feasible speed and runs the backtracking
//! search, relaxing one constraint axis at a time until something fits:
//! identical channels, then intra path type, then inter path type, then
//! cross-NIC, then a simpler tree, then speed. A second pass tries to raise
//! the intra bandwidth of tree patterns above the NIC speed. Callers always
//! get a usable graph; when everything fails a degenerate single channel is
//! synthesized.

use std::fs;

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::graph::{Pattern, TopoGraph};
use crate::matchers::{ModelMatcher, RingSpecParser};
use crate::search::{
    search_init, search_rec, SEARCH_GLOBAL_TIMEOUT, SEARCH_TIMEOUT, SEARCH_TIMEOUT_SAMECHANNELS,
    SEARCH_TIMEOUT_TREE,
};
use crate::topo::{NodeKind, NodeType, PathType, Platform, TopoSystem};
use crate::xml;

const SPEEDS_AMD: [f32; 16] = [
    24.0, 20.0, 18.0, 15.0, 12.0, 10.0, 9.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.4, 1.2, 0.24, 0.12,
];
const SPEEDS_NVIDIA_INTRA: [f32; 13] =
    [44.0, 30.0, 22.0, 18.0, 15.0, 12.0, 10.0, 9.0, 7.0, 6.0, 5.0, 4.0, 3.0];
const SPEEDS_NVIDIA_INTER: [f32; 19] = [
    48.0, 30.0, 28.0, 24.0, 22.0, 18.0, 15.0, 12.0, 10.0, 9.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.4, 1.2,
    0.24, 0.12,
];

/// Channels are duplicated (with bandwidth split) above this intra speed.
const DUP_BW_THRESHOLD: f32 = 25.0;

fn speed_table(system: &TopoSystem) -> &'static [f32] {
    match system.platform {
        Platform::Amd => &SPEEDS_AMD,
        Platform::Nvidia => {
            if system.nnets() == 0 {
                &SPEEDS_NVIDIA_INTRA
            } else {
                &SPEEDS_NVIDIA_INTER
            }
        }
    }
}

/// First index whose speed does not exceed `cap` (last entry if none does).
fn speed_floor(speeds: &[f32], cap: f32) -> usize {
    let mut index = 0;
    while speeds[index] > cap && index < speeds.len() - 1 {
        index += 1;
    }
    index
}

pub struct Planner {
    config: PlannerConfig,
    matchers: Vec<Box<dyn ModelMatcher>>,
    ring_parser: Option<Box<dyn RingSpecParser>>,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Planner { config, matchers: Vec::new(), ring_parser: None }
    }

    /// Matchers are consulted in registration order.
    pub fn with_matcher(mut self, matcher: Box<dyn ModelMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_ring_parser(mut self, parser: Box<dyn RingSpecParser>) -> Self {
        self.ring_parser = Some(parser);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Compute the channel layout for `graph` (pattern, id, collNet and the
    /// channel bounds are the caller's inputs; everything else is derived).
    pub fn compute(&self, system: &mut TopoSystem, graph: &mut TopoGraph) -> Result<()> {
        let ngpus = system.ngpus();
        search_init(system);

        let cross_nic_permitted = system.nnets() > 1 && self.config.cross_nic != 0;
        graph.cross_nic = self.config.cross_nic == 1;
        graph.bw_intra = 0.0;
        graph.bw_inter = 0.0;
        graph.latency_inter = 0.0;
        graph.type_intra = if ngpus == 1 { PathType::Loc } else { PathType::Nvl };
        graph.type_inter = PathType::Pix;
        graph.n_channels = 0;
        graph.same_channels = true;
        graph.n_intra_channels = 0;
        graph.alloc(ngpus, system.n_ranks);

        if let Some(path) = &self.config.graph_file {
            tracing::info!("loading channel graph override from {}", path.display());
            // Parse into a scratch graph so a bad file cannot leave partial
            // state behind.
            let mut candidate = graph.clone();
            let loaded = fs::read_to_string(path)
                .map_err(Into::into)
                .and_then(|text| xml::graphs_from_xml(system, &text, &mut candidate));
            match loaded {
                Ok(n_channels) => {
                    tracing::info!(
                        "search {}: {} channels loaded from XML graph",
                        graph.id,
                        n_channels
                    );
                    if candidate.n_channels > 0 {
                        *graph = candidate;
                        expand_multi_rank(system, graph);
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!("ignoring graph override {}: {err}", path.display());
                }
            }
        }

        if let Some(spec) = &self.config.rings {
            if let Some(parser) = &self.ring_parser {
                if parser.parse(spec, system, graph)? && graph.n_channels > 0 {
                    system.rome_4p2h = true;
                }
            }
        } else if !self.config.model_matching_disabled() && !graph.coll_net {
            for matcher in &self.matchers {
                if matcher.try_match(system, graph)? && graph.n_channels > 0 {
                    tracing::info!("matched {} model", matcher.name());
                    break;
                }
            }
        }
        if graph.n_channels > 0 {
            expand_multi_rank(system, graph);
            return Ok(());
        }

        // Limit single-node max channels when searching a ring graph on Rome.
        if graph.pattern == Pattern::Ring && system.rome_4p2h && ngpus == system.n_ranks {
            graph.max_channels = graph.max_channels.min(2);
        }
        if ngpus == 1 {
            graph.pattern = Pattern::Tree;
        }

        let speeds = speed_table(system);
        let mut tmp = graph.clone();
        let mut speed_index = speed_floor(speeds, system.max_bw);
        tmp.bw_intra = speeds[speed_index];
        tmp.bw_inter = speeds[speed_index];
        let mut global_timeout = SEARCH_GLOBAL_TIMEOUT;
        let mut pass = 1;
        let mut time;

        loop {
            time = if tmp.same_channels {
                SEARCH_TIMEOUT_SAMECHANNELS
            } else if tmp.pattern == Pattern::Tree {
                SEARCH_TIMEOUT_TREE
            } else {
                SEARCH_TIMEOUT
            };
            tmp.n_channels = 0;
            global_timeout -= time;

            search_rec(system, &mut tmp, graph, &mut time)?;
            tracing::debug!(
                "pattern {:?}, crossNic {}, bw {}/{}, type {}/{}, sameChannels {} -> nChannels {}x{}/{} {}",
                tmp.pattern,
                tmp.cross_nic,
                tmp.bw_inter,
                tmp.bw_intra,
                tmp.type_inter,
                tmp.type_intra,
                tmp.same_channels,
                graph.n_channels,
                graph.bw_inter,
                graph.bw_intra,
                if time == 0 { "TIMEOUT" } else if time == -1 { "PERFECT" } else { "" },
            );

            // A proven-optimal or bandwidth-saturating solution ends pass 1.
            let done =
                time == -1 || graph.n_channels as f32 * graph.bw_inter >= system.total_bw;

            if pass == 1
                && !done
                && relax_constraints(
                    system,
                    &mut tmp,
                    graph,
                    speeds,
                    &mut speed_index,
                    &mut global_timeout,
                    time,
                    cross_nic_permitted,
                    ngpus,
                )
            {
                continue;
            }
            if pass == 1 {
                // Pin pass 2 to the best solution found.
                time = -1;
                tmp.clone_from(graph);
                speed_index = speed_floor(speeds, graph.bw_inter);
                tmp.bw_intra = speeds[speed_index];
                tmp.bw_inter = speeds[speed_index];
                tmp.min_channels = graph.n_channels;
                pass = 2;
            }
            // Pass 2: see if we can increase bwIntra for trees.
            if time != 0
                && graph.pattern != Pattern::Ring
                && tmp.bw_intra == graph.bw_intra
                && tmp.bw_intra < tmp.bw_inter * 2.0
                && speed_index > 0
            {
                speed_index -= 1;
                tmp.bw_intra = speeds[speed_index];
                continue;
            }
            break;
        }

        if graph.n_channels == 0 && !graph.coll_net {
            tracing::warn!(
                "could not find a path for pattern {:?}, falling back to simple order",
                graph.pattern
            );
            for (i, node) in system.nodes(NodeType::Gpu).iter().enumerate() {
                if let NodeKind::Gpu(info) = &node.kind {
                    graph.set_intra(0, i, info.ranks[0]);
                }
            }
            graph.inter[0] = 0;
            graph.inter[1] = 0;
            graph.bw_intra = 0.1;
            graph.bw_inter = 0.1;
            graph.type_intra = PathType::Sys;
            graph.type_inter = PathType::Sys;
            graph.n_channels = 1;
        }

        if graph.bw_intra >= DUP_BW_THRESHOLD {
            duplicate_channels(graph);
        }
        expand_multi_rank(system, graph);
        Ok(())
    }

    /// Dump the computed graphs as XML when configured to.
    pub fn dump_graphs(&self, system: &TopoSystem, graphs: &[&TopoGraph]) -> Result<()> {
        if let Some(path) = &self.config.graph_dump_file {
            tracing::info!("dumping channel graphs to {}", path.display());
            let text = xml::graphs_to_xml(system, graphs)?;
            fs::write(path, text)?;
        }
        Ok(())
    }
}

/// Loosen one constraint axis, in strict order. Returns whether to search
/// again.
#[allow(clippy::too_many_arguments)]
fn relax_constraints(
    system: &TopoSystem,
    tmp: &mut TopoGraph,
    best: &TopoGraph,
    speeds: &[f32],
    speed_index: &mut usize,
    global_timeout: &mut i64,
    time: i64,
    cross_nic_permitted: bool,
    ngpus: usize,
) -> bool {
    // Try having different channels.
    if tmp.same_channels {
        tmp.same_channels = false;
        return true;
    }
    tmp.same_channels = true;

    if time != -1 {
        *global_timeout += time;
    } else {
        *global_timeout = SEARCH_GLOBAL_TIMEOUT;
    }
    if *global_timeout < 0 && best.n_channels > 0 {
        return false;
    }

    let max_type_intra = if system.nnets() > 0 { tmp.type_inter } else { PathType::Sys };
    if tmp.type_intra < max_type_intra
        && (best.n_channels == 0 || tmp.type_intra < best.type_intra)
    {
        tmp.type_intra = tmp.type_intra.relax();
        return true;
    }
    tmp.type_intra = if ngpus == 1 { PathType::Loc } else { PathType::Nvl };

    if system.nnets() > 0
        && tmp.type_inter < PathType::Sys
        && (best.n_channels == 0
            || tmp.type_inter < best.type_inter
            || tmp.type_inter < PathType::Pxn)
    {
        tmp.type_inter = tmp.type_inter.relax();
        return true;
    }
    tmp.type_inter = PathType::Pix;

    if cross_nic_permitted && !tmp.cross_nic {
        tmp.cross_nic = true;
        return true;
    }
    tmp.cross_nic = false;

    // Try a simpler tree.
    if tmp.pattern == Pattern::SplitTree {
        tmp.pattern = Pattern::Tree;
        return true;
    }
    tmp.pattern = best.pattern;

    // Decrease the speed until we find a solution, but never below half of
    // the best solution's bandwidth.
    if *speed_index < speeds.len() - 1
        && (best.n_channels == 0 || speeds[*speed_index + 1] / best.bw_inter > 0.49)
    {
        *speed_index += 1;
        tmp.bw_intra = speeds[*speed_index];
        tmp.bw_inter = speeds[*speed_index];
        return true;
    }
    *speed_index = speed_floor(speeds, system.max_bw);
    tmp.bw_intra = speeds[*speed_index];
    tmp.bw_inter = speeds[*speed_index];
    false
}

/// Duplicate channels up to `max_channels`, splitting the bandwidth across
/// the copies.
fn duplicate_channels(graph: &mut TopoGraph) {
    let n = graph.n_channels;
    let dup = (n * 2).min(graph.max_channels);
    let stride = graph.stride;
    for c in 0..dup - n {
        for i in 0..stride {
            let rank = graph.intra_at(c, i);
            graph.set_intra(n + c, i, rank);
        }
        graph.inter[(n + c) * 2] = graph.inter[c * 2];
        graph.inter[(n + c) * 2 + 1] = graph.inter[c * 2 + 1];
    }
    let factor = dup.div_ceil(n) as f32;
    graph.bw_intra /= factor;
    graph.bw_inter /= factor;
    graph.n_channels = dup;
}

/// Substitute each representative rank with the full list of ranks its GPU
/// hosts.
fn expand_multi_rank(system: &TopoSystem, graph: &mut TopoGraph) {
    let ngpus = system.ngpus();
    tracing::trace!(
        "expanding intra array for multi-rank per GPU, nChannels {}",
        graph.n_channels
    );
    let packed: Vec<i32> = graph.intra[..graph.n_channels * ngpus].to_vec();
    let mut tk = 0;
    for c in 0..graph.n_channels {
        for i in 0..ngpus {
            let rank = packed[c * ngpus + i];
            for node in system.nodes(NodeType::Gpu) {
                if let NodeKind::Gpu(info) = &node.kind {
                    if info.ranks[0] == rank {
                        for &r in &info.ranks {
                            graph.intra[tk] = r;
                            tk += 1;
                        }
                    }
                }
            }
        }
    }
    if graph.n_channels > 0 {
        graph.stride = tk / graph.n_channels;
    }
}

/// Log the computed graph, one line per channel.
pub fn print_graph(system: &TopoSystem, graph: &TopoGraph) {
    tracing::info!(
        "pattern {:?}, crossNic {}, nChannels {}, bw {}/{}, type {}/{}, sameChannels {}",
        graph.pattern,
        graph.cross_nic,
        graph.n_channels,
        graph.bw_intra,
        graph.bw_inter,
        graph.type_intra,
        graph.type_inter,
        graph.same_channels,
    );
    let show_inter =
        system.nnets() > 0 && system.ngpus() != system.n_ranks && graph.n_intra_channels == 0;
    let nnets = system.nnets() as i64;
    for c in 0..graph.n_channels {
        let mut line = format!("{c:2} :");
        if show_inter {
            line.push_str(&format!(" NET/{}", graph.inter[c * 2]));
        }
        for (i, rank) in graph.channel_ranks(c).iter().enumerate() {
            let [entry, exit] = graph.intra_nets[c * graph.stride + i];
            if (0..nnets).contains(&entry) {
                line.push_str(&format!(" NET/{entry}"));
            }
            line.push_str(&format!(" GPU/{rank}"));
            if (0..nnets).contains(&exit) {
                line.push_str(&format!(" NET/{exit}"));
            }
        }
        if show_inter {
            line.push_str(&format!(" NET/{}", graph.inter[c * 2 + 1]));
        }
        tracing::info!("{line}");
    }
}
