// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ordering of candidate next GPUs. The order is critical for the search to
//! converge on a good solution before its time budget runs out.

use std::cmp::Ordering;

use crate::error::Result;
use crate::graph::TopoGraph;
use crate::topo::{LinkType, NodeRef, NodeType, TopoSystem};

/// How NIC proximity weighs into the ordering of the next GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetSort {
    /// No NIC involved; inter keys stay zero.
    Ignore,
    /// The next step returns to a NIC; inter keys dominate.
    Toward,
    /// A NIC is in play but not next; reverse the order when the intra keys
    /// are degenerate, to explore the tree from the opposite end.
    Away,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GpuScore {
    pub g: usize,
    start_index: usize,
    intra_hops: usize,
    intra_bw: f32,
    inter_hops: usize,
    inter_pci_bw: f32,
    inter_bw: f32,
}

impl GpuScore {
    /// Strict lexicographic comparison, most important key first.
    fn cmp_score(&self, other: &Self) -> Ordering {
        other
            .inter_bw
            .total_cmp(&self.inter_bw)
            .then(other.inter_pci_bw.total_cmp(&self.inter_pci_bw))
            .then(self.inter_hops.cmp(&other.inter_hops))
            .then(other.intra_bw.total_cmp(&self.intra_bw))
            .then(self.intra_hops.cmp(&other.intra_hops))
            .then(self.start_index.cmp(&other.start_index))
    }
}

/// Min of the bandwidth pair on the GPU's PCI attachment, or -1.0 when the
/// GPU has none.
pub(crate) fn gpu_pci_bw(system: &TopoSystem, g: usize) -> f32 {
    let gpu = &system.nodes(NodeType::Gpu)[g];
    for &l in &gpu.links {
        let link = system.link(l);
        if link.kind != LinkType::Pci {
            continue;
        }
        let pci = system.node(link.remote);
        for &back in &pci.links {
            let back_link = system.link(back);
            if back_link.remote == NodeRef::gpu(g) {
                return link.bw.min(back_link.bw);
            }
        }
    }
    -1.0
}

/// All candidates share the same intra keys.
fn intra_scores_equal(scores: &[GpuScore]) -> bool {
    scores.windows(2).all(|w| {
        w[1].intra_bw == w[0].intra_bw && w[1].intra_hops == w[0].intra_hops
    })
}

/// Rank the GPUs reachable from `g` that are still unused on the current
/// channel, best candidate first.
pub(crate) fn next_gpu_sort(
    system: &TopoSystem,
    graph: &TopoGraph,
    g: usize,
    sort_net: NetSort,
) -> Result<Vec<usize>> {
    let flag = 1u64 << graph.n_channels;
    let ngpus = system.ngpus();
    let net_index = if sort_net != NetSort::Ignore {
        let net_id = graph.inter[graph.n_channels * 2];
        Some(system.net_index_of_id(net_id)?)
    } else {
        None
    };

    let mut scores = Vec::with_capacity(ngpus);
    for i in 1..ngpus {
        let candidate = (g + i) % ngpus;
        let path = system.path(NodeRef::gpu(g), NodeRef::gpu(candidate));
        if path.links.is_empty() {
            continue; // no path to that GPU
        }
        if system.nodes(NodeType::Gpu)[candidate].used & flag != 0 {
            continue;
        }
        let mut score = GpuScore {
            g: candidate,
            start_index: i,
            intra_hops: path.hops(),
            intra_bw: path.bw,
            inter_hops: 0,
            inter_pci_bw: 0.0,
            inter_bw: 0.0,
        };
        if let Some(n) = net_index {
            let net_path = system.path(NodeRef::net(n), NodeRef::gpu(candidate));
            score.inter_hops = net_path.hops();
            score.inter_pci_bw = gpu_pci_bw(system, candidate);
            score.inter_bw = net_path.bw;
        }
        scores.push(score);
    }

    scores.sort_by(GpuScore::cmp_score);

    if sort_net == NetSort::Away && intra_scores_equal(&scores) {
        scores.reverse();
    }
    Ok(scores.iter().map(|s| s.g).collect())
}
