// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The backtracking channel search.
//!
//! Four mutually recursive entry points materialize channels one GPU at a
//! time: [`search_rec`] seeds a channel, [`search_rec_net`] iterates entry
//! NICs, [`search_rec_gpu`] advances a channel one position, and
//! [`search_try_gpu`] commits a path charge around the recursion. Every
//! mutation on the way down is reverted on the way back up; the ledger must
//! read exactly as it did before the search, whatever the outcome.
//!
//! `time` is a shared countdown. It reaching 0 unwinds the recursion with
//! whatever was saved so far; -1 is the sentinel for "provably best solution
//! found, stop everywhere".

use crate::error::{Result, TopoError};
use crate::graph::{Pattern, TopoGraph};
use crate::ledger::follow_path;
use crate::nets::select_nets;
use crate::score::{gpu_pci_bw, next_gpu_sort, NetSort};
use crate::topo::{LinkType, NodeKind, NodeRef, NodeType, TopoSystem, LOC_BW};

pub(crate) const SEARCH_GLOBAL_TIMEOUT: i64 = 1 << 18;
pub(crate) const SEARCH_TIMEOUT: i64 = 1 << 14;
pub(crate) const SEARCH_TIMEOUT_TREE: i64 = 1 << 14;
pub(crate) const SEARCH_TIMEOUT_SAMECHANNELS: i64 = 1 << 8;
const SEARCH_TIMEOUT_PCI_PROBE: i64 = 1 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForcedOrder {
    /// Normal scored search.
    None,
    /// Walk the GPUs in PCI (index) order.
    Pci,
    /// Replay the previous channel's order.
    Replay,
}

/// Derive `system.max_bw` (best per-channel bandwidth reachable from any GPU)
/// and `system.total_bw` (best aggregate bandwidth out of any single GPU).
pub fn search_init(system: &mut TopoSystem) {
    let mut max_bw = 0.0f32;
    let mut total_bw = 0.0f32;
    let inter = system.nnets() > 0;
    if !inter && system.ngpus() == 1 {
        system.max_bw = LOC_BW;
        system.total_bw = 0.0;
        return;
    }
    let target = if inter { NodeType::Net } else { NodeType::Gpu };
    for gpu in system.nodes(NodeType::Gpu) {
        for path in gpu.paths_to(target) {
            if path.links.is_empty() {
                continue;
            }
            max_bw = max_bw.max(path.bw);
        }
        let mut nvlink_bw = 0.0f32;
        let mut pci_bw = 0.0f32;
        for &l in &gpu.links {
            let link = system.link(l);
            match link.kind {
                LinkType::Nvl => nvlink_bw += link.bw,
                LinkType::Pci => pci_bw = link.bw,
                _ => {}
            }
        }
        total_bw = total_bw.max(nvlink_bw.max(pci_bw));
    }
    system.max_bw = max_bw;
    system.total_bw = total_bw;
}

/* Search patterns
 *
 *     Intra-node
 * Ring            : GPU a -> GPU b -> .. -> GPU x -> GPU a
 * Tree            : GPU a -> GPU b -> .. -> GPU x
 *
 *     Inter-node
 * Ring            : NET n -> GPU a -> GPU b -> .. -> GPU x -> NET n (or m if crossNic)
 * Tree            : NET n -> GPU a -> GPU b -> .. -> GPU x
 *                              `--> NET n (or m if crossNic)
 * Split tree      : NET n -> GPU a -> GPU b -> .. -> GPU x
 *                                       `--> NET n (or m if crossNic)
 */
pub(crate) fn search_params(
    system: &TopoSystem,
    pattern: Pattern,
) -> (Option<usize>, Option<usize>) {
    let ngpus = system.ngpus();
    if system.nnets() > 0 && ngpus != system.n_ranks {
        let back_to_net = match pattern {
            Pattern::Ring => ngpus - 1,
            Pattern::SplitTree => 1,
            _ => 0,
        };
        (Some(back_to_net), None)
    } else {
        let back_to_first = match pattern {
            Pattern::Ring => Some(ngpus - 1),
            _ => None,
        };
        (None, back_to_first)
    }
}

/// The GPU placed at position `pos` on the previous channel.
pub(crate) fn replay_get_gpu(
    system: &TopoSystem,
    graph: &TopoGraph,
    pos: usize,
) -> Result<usize> {
    if graph.n_channels == 0 {
        return Err(TopoError::internal("no previous channel to replay"));
    }
    let rank = graph.intra_at(graph.n_channels - 1, pos);
    system.gpu_index_of_rank(rank)
}

/// Same-host NVLink adjacencies in the committed rings, counting at most one
/// per ring step.
fn count_xgmi(system: &TopoSystem, graph: &TopoGraph) -> usize {
    let ngpus = system.ngpus();
    let mut count = 0;
    for c in 0..graph.n_channels {
        for i in 0..ngpus {
            let rank = graph.intra_at(c, i);
            let next_rank = graph.intra_at(c, (i + 1) % ngpus);
            let hosted = system.nodes(NodeType::Gpu).iter().position(
                |node| matches!(&node.kind, NodeKind::Gpu(info) if info.ranks.contains(&rank)),
            );
            let Some(j) = hosted else { continue };
            let node = &system.nodes(NodeType::Gpu)[j];
            for k in 0..ngpus {
                let path = &node.paths_to(NodeType::Gpu)[k];
                if path.links.len() != 1 {
                    continue;
                }
                let link = system.link(path.links[0]);
                let remote = system.node(link.remote);
                if link.kind == LinkType::Nvl
                    && matches!(&remote.kind, NodeKind::Gpu(info) if info.ranks.contains(&next_rank))
                {
                    count += 1;
                }
            }
        }
    }
    count
}

/// Does `graph` supersede `reference` as the best-so-far?
pub(crate) fn compare_graphs(
    system: &TopoSystem,
    graph: &TopoGraph,
    reference: &TopoGraph,
) -> bool {
    // 1. Constraint to get the same nChannels between rings and trees.
    if graph.n_channels < graph.min_channels {
        return false;
    }

    // 2. Try to get better bandwidth.
    let bw = graph.n_channels as f32 * graph.bw_intra;
    let ref_bw = reference.n_channels as f32 * reference.bw_intra;
    if bw < ref_bw {
        return false;
    }
    if bw > ref_bw {
        return true;
    }

    // 3. Fewer hops, but not at the price of going cross NICs.
    let mut copy = false;
    if graph.pattern == reference.pattern
        && graph.cross_nic == reference.cross_nic
        && graph.n_hops < reference.n_hops
    {
        copy = true;
    }
    // 4. Prefer more XGMI connections.
    if graph.n_channels == reference.n_channels
        && count_xgmi(system, reference) < count_xgmi(system, graph)
    {
        copy = true;
    }
    copy
}

/// Charge the path into GPU `g`, mark it used on the current channel, recurse,
/// and restore both.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_try_gpu(
    system: &mut TopoSystem,
    graph: &mut TopoGraph,
    save: &mut TopoGraph,
    step: usize,
    back_to_net: Option<usize>,
    back_to_first: Option<usize>,
    forced: ForcedOrder,
    time: &mut i64,
    from: Option<NodeRef>,
    g: usize,
) -> Result<()> {
    let flag = 1u64 << graph.n_channels;
    if follow_path(system, graph, from, NodeRef::gpu(g), 1)? {
        system.node_mut(NodeRef::gpu(g)).used ^= flag;
        search_rec_gpu(system, graph, save, g, step, back_to_net, back_to_first, forced, time)?;
        system.node_mut(NodeRef::gpu(g)).used ^= flag;
        follow_path(system, graph, from, NodeRef::gpu(g), -1)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn search_rec_gpu(
    system: &mut TopoSystem,
    graph: &mut TopoGraph,
    save: &mut TopoGraph,
    g: usize,
    step: usize,
    back_to_net: Option<usize>,
    back_to_first: Option<usize>,
    forced: ForcedOrder,
    time: &mut i64,
) -> Result<()> {
    if *time <= 0 {
        return Ok(());
    }
    *time -= 1;

    let ngpus = system.ngpus();
    if step == ngpus {
        // Channel complete; decide whether it beats the best so far.
        graph.n_channels += 1;
        if compare_graphs(system, graph, save) {
            save.clone_from(graph);
            if graph.n_channels == graph.max_channels {
                *time = -1;
            }
        }
        if graph.n_channels < graph.max_channels {
            search_rec(system, graph, save, time)?;
        }
        graph.n_channels -= 1;
        return Ok(());
    }

    let rank = system.gpu_info(g)?.ranks[0];
    graph.set_intra(graph.n_channels, step, rank);

    if Some(step) == back_to_net {
        // First get back to the NIC.
        if system.nnets() > 0 {
            let start_net = system.net_index_of_id(graph.inter[graph.n_channels * 2])?;
            let (start_id, start_asic, start_port) = {
                let info = system.net_info(start_net)?;
                (system.nodes(NodeType::Net)[start_net].id, info.asic, info.port)
            };
            let nets = select_nets(system, graph.type_inter, Some(g))?;
            for n in nets {
                let (net_id, asic, port) = {
                    let info = system.net_info(n)?;
                    (system.nodes(NodeType::Net)[n].id, info.asic, info.port)
                };
                // Trees are symmetric: the exit NIC must be the entry NIC.
                if graph.pattern == Pattern::Tree && net_id != start_id {
                    continue;
                }
                if !graph.cross_nic && (asic != start_asic || port != start_port) {
                    continue;
                }

                // Balanced tree: count half of the bandwidth on each of the
                // first two GPUs.
                let mut next_back_to_net = None;
                let bw_inter_save = graph.bw_inter;
                if graph.pattern == Pattern::BalancedTree {
                    if step == 0 {
                        next_back_to_net = Some(1);
                    } else if net_id != graph.inter[graph.n_channels * 2 + 1] {
                        continue;
                    }
                    graph.bw_inter /= 2.0;
                }

                let reached = follow_path(system, graph, Some(NodeRef::gpu(g)), NodeRef::net(n), 1)?;
                graph.bw_inter = bw_inter_save;
                if reached {
                    graph.inter[graph.n_channels * 2 + 1] = net_id;
                    search_rec_gpu(
                        system, graph, save, g, step, next_back_to_net, back_to_first, forced, time,
                    )?;

                    if graph.pattern == Pattern::BalancedTree {
                        graph.bw_inter /= 2.0;
                    }
                    follow_path(system, graph, Some(NodeRef::gpu(g)), NodeRef::net(n), -1)?;
                    graph.bw_inter = bw_inter_save;
                }
            }
        }
    } else if step < ngpus - 1 {
        // Go to the next GPU.
        let next: Vec<usize> = match forced {
            ForcedOrder::Pci => vec![step + 1],
            ForcedOrder::Replay => vec![replay_get_gpu(system, graph, step + 1)?],
            ForcedOrder::None => {
                let sort_net = match back_to_net {
                    None => NetSort::Ignore,
                    Some(b) if b == step + 1 => NetSort::Toward,
                    Some(_) => NetSort::Away,
                };
                next_gpu_sort(system, graph, g, sort_net)?
            }
        };
        for next_g in next {
            search_try_gpu(
                system,
                graph,
                save,
                step + 1,
                back_to_net,
                back_to_first,
                forced,
                time,
                Some(NodeRef::gpu(g)),
                next_g,
            )?;
        }
    } else if Some(step) == back_to_first {
        // Find the first GPU and loop back to it.
        let first = system.gpu_index_of_rank(graph.intra_at(graph.n_channels, 0))?;
        if follow_path(system, graph, Some(NodeRef::gpu(g)), NodeRef::gpu(first), 1)? {
            search_rec_gpu(
                system, graph, save, first, step + 1, back_to_net, None, forced, time,
            )?;
            follow_path(system, graph, Some(NodeRef::gpu(g)), NodeRef::gpu(first), -1)?;
        }
    } else {
        search_rec_gpu(system, graph, save, g, ngpus, None, None, forced, time)?;
    }
    Ok(())
}

pub(crate) fn search_rec_net(
    system: &mut TopoSystem,
    graph: &mut TopoGraph,
    save: &mut TopoGraph,
    back_to_net: Option<usize>,
    back_to_first: Option<usize>,
    time: &mut i64,
) -> Result<()> {
    let bw = graph.bw_inter;
    let ngpus = system.ngpus();
    let nnets = system.nnets();
    let nets = select_nets(system, graph.type_inter, None)?;
    for n in nets {
        let (net_id, asic, port, net_bw, latency, max_channels, coll_support) = {
            let info = system.net_info(n)?;
            (
                system.nodes(NodeType::Net)[n].id,
                info.asic,
                info.port,
                info.bw,
                info.latency,
                info.max_channels,
                info.coll_support,
            )
        };
        if graph.coll_net && !coll_support {
            continue;
        }
        if net_bw < bw || max_channels == 0 {
            continue;
        }

        graph.inter[graph.n_channels * 2] = net_id;
        graph.latency_inter = latency;

        // All NICs sharing (asic, port) share the device budget.
        let group: Vec<usize> = (0..nnets)
            .filter(|&i| {
                system
                    .net_info(i)
                    .map(|info| info.asic == asic && info.port == port)
                    .unwrap_or(false)
            })
            .collect();
        for &i in &group {
            system.net_info_mut(i)?.bw -= bw;
        }
        system.net_info_mut(n)?.max_channels -= 1;

        // First try to replay the last channel.
        if graph.n_channels > 0 {
            let g = replay_get_gpu(system, graph, 0)?;
            search_try_gpu(
                system,
                graph,
                save,
                0,
                back_to_net,
                back_to_first,
                ForcedOrder::Replay,
                time,
                Some(NodeRef::net(n)),
                g,
            )?;
        }
        if graph.n_channels == 0 || !graph.same_channels {
            if graph.n_channels == 0 {
                // Try the PCI order first to set a reference, starting from
                // the GPU closest to the NIC with a GDR preference. This probe
                // runs on its own short budget and does not consume ours.
                let mut f = 0;
                let mut f_gdr = false;
                for i in 0..ngpus {
                    let hops_i = system.path(NodeRef::net(n), NodeRef::gpu(i)).hops();
                    let hops_f = system.path(NodeRef::net(n), NodeRef::gpu(f)).hops();
                    if hops_i <= hops_f {
                        let gdr = system.check_gdr(i, n)?;
                        if hops_i < hops_f || (!f_gdr && gdr) {
                            f = i;
                            f_gdr = gdr;
                        }
                    }
                }
                let mut probe_time = SEARCH_TIMEOUT_PCI_PROBE;
                let forced = if f == 0 { ForcedOrder::Pci } else { ForcedOrder::None };
                search_try_gpu(
                    system,
                    graph,
                    save,
                    0,
                    back_to_net,
                    back_to_first,
                    forced,
                    &mut probe_time,
                    Some(NodeRef::net(n)),
                    f,
                )?;
                if probe_time == -1 {
                    *time = -1;
                }
            }

            // Then try the most local GPUs.
            let mut max_bw = 0.0f32;
            let mut min_hops = usize::MAX;
            for g in 0..ngpus {
                let path = system.path(NodeRef::net(n), NodeRef::gpu(g));
                if path.bw > max_bw {
                    max_bw = path.bw;
                    min_hops = path.hops();
                } else if path.bw == max_bw && path.hops() < min_hops {
                    min_hops = path.hops();
                }
            }
            if max_bw >= bw {
                // In the first pass, avoid GPUs used in both directions
                // between channels; that usually leads to lower bandwidth.
                for try_gpu_bidir in [false, true] {
                    for g in 0..ngpus {
                        let path = system.path(NodeRef::net(n), NodeRef::gpu(g));
                        if path.bw == max_bw && path.hops() == min_hops {
                            let bidir = gpu_pci_bw(system, g) <= 0.0;
                            if try_gpu_bidir == bidir {
                                search_try_gpu(
                                    system,
                                    graph,
                                    save,
                                    0,
                                    back_to_net,
                                    back_to_first,
                                    ForcedOrder::None,
                                    time,
                                    Some(NodeRef::net(n)),
                                    g,
                                )?;
                            }
                        }
                    }
                }
            }
        }

        system.net_info_mut(n)?.max_channels += 1;
        for &i in &group {
            system.net_info_mut(i)?.bw += bw;
        }
    }
    Ok(())
}

/// Entry point per channel.
pub(crate) fn search_rec(
    system: &mut TopoSystem,
    graph: &mut TopoGraph,
    save: &mut TopoGraph,
    time: &mut i64,
) -> Result<()> {
    let (back_to_net, back_to_first) = search_params(system, graph.pattern);
    if system.nnets() > 0 && system.ngpus() != system.n_ranks {
        // Start from a NIC.
        search_rec_net(system, graph, save, back_to_net, back_to_first, time)?;
    } else {
        // Intra-node only.
        if graph.n_channels == 0 {
            // Try the PCI order first.
            search_try_gpu(
                system, graph, save, 0, back_to_net, back_to_first, ForcedOrder::Pci, time, None, 0,
            )?;
        } else {
            // Also try to replay the previous channel.
            let g = replay_get_gpu(system, graph, 0)?;
            search_try_gpu(
                system, graph, save, 0, back_to_net, back_to_first, ForcedOrder::Replay, time,
                None, g,
            )?;
        }
        if !graph.same_channels || graph.n_channels == 0 {
            // Finally, try every other start unless channels must be identical.
            for g in 0..system.ngpus() {
                search_try_gpu(
                    system, graph, save, 0, back_to_net, back_to_first, ForcedOrder::None, time,
                    None, g,
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::{LinkIdx, NetInfo, PathType, Platform, TopoBuilder};
    use rstest::rstest;

    /// Fully-connected NVLink clique with per-pair direct paths.
    fn nvlink_clique(ngpus: usize, bw: f32) -> TopoSystem {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let gpus: Vec<NodeRef> = (0..ngpus)
            .map(|g| b.gpu(g as i64, g as i32, &[g as i32], 90))
            .collect();
        let mut links = vec![vec![0 as LinkIdx; ngpus]; ngpus];
        for i in 0..ngpus {
            for j in 0..ngpus {
                if i != j {
                    links[i][j] = b.link(gpus[i], gpus[j], LinkType::Nvl, bw);
                }
            }
        }
        for i in 0..ngpus {
            for j in 0..ngpus {
                if i != j {
                    b.path(gpus[i], gpus[j], PathType::Nvl, bw, vec![links[i][j]]);
                }
            }
        }
        b.build(ngpus)
    }

    fn ring_graph(system: &TopoSystem, bw: f32) -> (TopoGraph, TopoGraph) {
        let mut graph = TopoGraph::new(0, Pattern::Ring);
        graph.alloc(system.ngpus(), system.n_ranks);
        graph.bw_intra = bw;
        graph.bw_inter = bw;
        graph.type_intra = PathType::Nvl;
        graph.type_inter = PathType::Pix;
        graph.max_channels = 2;
        let save = graph.clone();
        (graph, save)
    }

    #[rstest]
    #[case::ring(Pattern::Ring, Some(3), None)]
    #[case::split_tree(Pattern::SplitTree, Some(1), None)]
    #[case::tree(Pattern::Tree, Some(0), None)]
    #[case::balanced_tree(Pattern::BalancedTree, Some(0), None)]
    fn params_with_nets_and_remote_ranks(
        #[case] pattern: Pattern,
        #[case] back_to_net: Option<usize>,
        #[case] back_to_first: Option<usize>,
    ) {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        for g in 0..4 {
            b.gpu(g, g as i32, &[g as i32], 90);
        }
        b.net(100, NetInfo { asic: 1, bw: 12.0, ..Default::default() });
        let system = b.build(8);
        assert_eq!(search_params(&system, pattern), (back_to_net, back_to_first));
    }

    #[rstest]
    #[case::ring(Pattern::Ring, Some(3))]
    #[case::tree(Pattern::Tree, None)]
    fn params_single_host(#[case] pattern: Pattern, #[case] back_to_first: Option<usize>) {
        let system = nvlink_clique(4, 24.0);
        assert_eq!(search_params(&system, pattern), (None, back_to_first));
    }

    #[test]
    fn search_finds_a_ring_and_restores_the_ledger() {
        let mut system = nvlink_clique(2, 24.0);
        let (mut graph, mut save) = ring_graph(&system, 20.0);
        let mut time = SEARCH_TIMEOUT;

        search_rec(&mut system, &mut graph, &mut save, &mut time).unwrap();

        assert!(save.n_channels >= 1);
        let ranks: Vec<i32> = save.channel_ranks(0).to_vec();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1]);
        // Ring of two: out and back.
        assert_eq!(save.n_hops, 2 * save.n_channels as i64);

        for idx in 0..2 * 2 - 2 {
            assert_eq!(system.link(idx).bw, 24.0, "link {idx} leaked bandwidth");
        }
        for node in system.nodes(NodeType::Gpu) {
            assert_eq!(node.used, 0);
        }
    }

    #[test]
    fn exhausted_time_unwinds_with_ledger_intact() {
        let mut system = nvlink_clique(4, 24.0);
        let (mut graph, mut save) = ring_graph(&system, 12.0);
        let mut time = 1;

        search_rec(&mut system, &mut graph, &mut save, &mut time).unwrap();

        assert_eq!(save.n_channels, 0);
        for g in 0..4usize {
            for other in 0..4usize {
                if g == other {
                    continue;
                }
                let l = system.find_link(NodeRef::gpu(g), NodeRef::gpu(other)).unwrap();
                assert_eq!(system.link(l).bw, 24.0);
            }
        }
        for node in system.nodes(NodeType::Gpu) {
            assert_eq!(node.used, 0);
        }
    }

    #[test]
    fn every_saved_channel_is_a_permutation() {
        let mut system = nvlink_clique(4, 24.0);
        let (mut graph, mut save) = ring_graph(&system, 12.0);
        graph.max_channels = 2;
        let mut time = SEARCH_TIMEOUT;

        search_rec(&mut system, &mut graph, &mut save, &mut time).unwrap();

        assert!(save.n_channels >= 1);
        for c in 0..save.n_channels {
            let mut ranks: Vec<i32> = save.channel_ranks(c).to_vec();
            ranks.sort_unstable();
            assert_eq!(ranks, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn comparator_is_irreflexive_and_antisymmetric() {
        let system = nvlink_clique(2, 24.0);
        let (mut a, _) = ring_graph(&system, 12.0);
        a.n_channels = 1;
        a.intra[0] = 0;
        a.intra[1] = 1;
        a.n_hops = 2;

        assert!(!compare_graphs(&system, &a, &a));

        let mut b = a.clone();
        b.bw_intra = 10.0;
        // One direction only may win.
        assert!(compare_graphs(&system, &a, &b));
        assert!(!compare_graphs(&system, &b, &a));
    }

    #[test]
    fn comparator_rejects_below_min_channels() {
        let system = nvlink_clique(2, 24.0);
        let (mut a, save) = ring_graph(&system, 12.0);
        a.n_channels = 1;
        a.min_channels = 2;
        assert!(!compare_graphs(&system, &a, &save));
    }

    #[test]
    fn search_init_figures() {
        let mut system = nvlink_clique(2, 24.0);
        search_init(&mut system);
        assert_eq!(system.max_bw, 24.0);
        assert_eq!(system.total_bw, 24.0);

        let mut b = TopoBuilder::new(Platform::Nvidia);
        b.gpu(0, 0, &[0], 90);
        let mut single = b.build(1);
        search_init(&mut single);
        assert_eq!(single.max_bw, LOC_BW);
    }
}
