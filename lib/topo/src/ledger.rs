// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Residual-bandwidth ledger.
//!
//! Charges and refunds are applied link by link along precomputed paths. A
//! charge that cannot be satisfied on some hop is rolled back by refunding the
//! prefix; there are no snapshots. Every arithmetic step rounds to milli
//! precision so that symmetric charge/refund cycles restore residuals exactly.

use crate::error::Result;
use crate::graph::TopoGraph;
use crate::topo::{CpuArch, CpuVendor, LinkIdx, LinkType, NodeKind, NodeRef, NodeType, PathType, TopoSystem};

/// `a = round((a - b) * 1000) / 1000`. Plain subtraction drifts once
/// identical charges accumulate and cancel.
#[inline]
pub(crate) fn sub_round(a: &mut f32, b: f32) {
    *a = ((*a - b) * 1000.0).round() / 1000.0;
}

/// P2P through an Intel root complex moves less data per unit of raw
/// bandwidth; charge accordingly.
#[inline]
fn intel_p2p_overhead(bw: f32) -> f32 {
    bw * 6.0 / 5.0
}

/// Charge `bw` along `links` for up to `max_steps` hops, returning the number
/// of hops actually charged. Negative `bw` refunds. The caller is responsible
/// for refunding the prefix when the returned count falls short.
pub(crate) fn follow_links(
    system: &mut TopoSystem,
    links: &[LinkIdx],
    path_kind: PathType,
    start: NodeRef,
    max_steps: usize,
    bw: f32,
) -> Result<usize> {
    let mut pci_bw = bw;
    for &li in links {
        let remote = system.link(li).remote;
        if let NodeKind::Cpu(cpu) = &system.node(remote).kind {
            if path_kind == PathType::Phb
                && start.kind == NodeType::Gpu
                && cpu.arch == CpuArch::X86
                && cpu.vendor == CpuVendor::Intel
            {
                pci_bw = intel_p2p_overhead(bw);
            }
        }
    }

    let mut node = start;
    for (step, &li) in links.iter().take(max_steps).enumerate() {
        let (link_kind, link_bw, remote) = {
            let link = system.link(li);
            (link.kind, link.bw, link.remote)
        };
        let fw_bw = if link_kind == LinkType::Pci { pci_bw } else { bw };

        let mut rev_bw = 0.0;
        if let NodeKind::Gpu(gpu) = &system.node(remote).kind {
            if gpu.comp_cap < 80 && start.kind != NodeType::Gpu {
                rev_bw += fw_bw / 8.0;
            }
        }
        if remote.kind == NodeType::Cpu && link_kind == LinkType::Nvl {
            rev_bw += fw_bw;
        }
        // One reverse-link lookup per step, and only when a reverse charge is
        // actually owed.
        let rev_link = if rev_bw != 0.0 {
            Some(system.find_rev_link(node, remote)?)
        } else {
            None
        };

        if link_bw < fw_bw {
            return Ok(step);
        }
        if let Some(rl) = rev_link {
            if system.link(rl).bw < rev_bw {
                return Ok(step);
            }
        }
        sub_round(&mut system.link_mut(li).bw, fw_bw);
        if let Some(rl) = rev_link {
            sub_round(&mut system.link_mut(rl).bw, rev_bw);
        }
        node = remote;
    }
    Ok(max_steps)
}

/// Try to go from `from` to `to`, charging (`mult == 1`) or refunding
/// (`mult == -1`) the graph's per-hop bandwidth along the precomputed path.
/// Returns whether the destination was reached; a failed charge leaves the
/// ledger exactly as it found it.
pub(crate) fn follow_path(
    system: &mut TopoSystem,
    graph: &mut TopoGraph,
    from: Option<NodeRef>,
    to: NodeRef,
    mult: i32,
) -> Result<bool> {
    let Some(from) = from else {
        // Free placement: the first node of a channel costs nothing.
        return Ok(true);
    };
    let (path_kind, links) = {
        let path = system.path(from, to);
        (path.kind, path.links.clone())
    };
    if links.is_empty() {
        return Ok(true);
    }

    let intra = from.kind == NodeType::Gpu && to.kind == NodeType::Gpu;
    let bw = if intra { graph.bw_intra } else { graph.bw_inter };
    let ceiling = if intra { graph.type_intra } else { graph.type_inter };
    if mult == 1 && path_kind > ceiling {
        return Ok(false);
    }

    let bw = bw * mult as f32;
    let steps = follow_links(system, &links, path_kind, from, links.len(), bw)?;
    if steps < links.len() {
        // Not enough bandwidth: rewind the prefix and report failure.
        follow_links(system, &links, path_kind, from, steps, -bw)?;
        return Ok(false);
    }
    graph.n_hops += mult as i64 * links.len() as i64;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Pattern;
    use crate::topo::{NetInfo, Platform, TopoBuilder};

    fn two_gpu_system(bw: f32) -> (TopoSystem, NodeRef, NodeRef) {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let g0 = b.gpu(0, 0, &[0], 90);
        let g1 = b.gpu(1, 1, &[1], 90);
        let (l01, l10) = b.connect(g0, g1, LinkType::Nvl, bw);
        b.path(g0, g1, PathType::Nvl, bw, vec![l01]);
        b.path(g1, g0, PathType::Nvl, bw, vec![l10]);
        (b.build(2), g0, g1)
    }

    fn graph_with_bw(bw: f32) -> TopoGraph {
        let mut graph = TopoGraph::new(0, Pattern::Ring);
        graph.alloc(2, 2);
        graph.bw_intra = bw;
        graph.bw_inter = bw;
        graph.type_intra = PathType::Sys;
        graph.type_inter = PathType::Sys;
        graph
    }

    #[test]
    fn charge_and_refund_restore_residuals_exactly() {
        let (mut system, g0, g1) = two_gpu_system(24.0);
        let mut graph = graph_with_bw(11.983);

        for _ in 0..100 {
            assert!(follow_path(&mut system, &mut graph, Some(g0), g1, 1).unwrap());
            assert!(follow_path(&mut system, &mut graph, Some(g0), g1, -1).unwrap());
        }
        let link = system.find_link(g0, g1).unwrap();
        assert_eq!(system.link(link).bw, 24.0);
        assert_eq!(graph.n_hops, 0);
    }

    #[test]
    fn insufficient_bandwidth_fails_without_leaking() {
        let (mut system, g0, g1) = two_gpu_system(10.0);
        let mut graph = graph_with_bw(12.0);

        assert!(!follow_path(&mut system, &mut graph, Some(g0), g1, 1).unwrap());
        let link = system.find_link(g0, g1).unwrap();
        assert_eq!(system.link(link).bw, 10.0);
        assert_eq!(graph.n_hops, 0);
    }

    #[test]
    fn path_type_above_ceiling_is_rejected_on_charge_only() {
        let (mut system, g0, g1) = two_gpu_system(24.0);
        let mut graph = graph_with_bw(12.0);
        graph.type_intra = PathType::Loc;

        assert!(!follow_path(&mut system, &mut graph, Some(g0), g1, 1).unwrap());
        let link = system.find_link(g0, g1).unwrap();
        assert_eq!(system.link(link).bw, 24.0);
    }

    #[test]
    fn multi_hop_failure_rewinds_the_prefix() {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let g0 = b.gpu(0, 0, &[0], 90);
        let s = b.switch(100);
        let g1 = b.gpu(1, 1, &[1], 90);
        let (l0s, _) = b.connect(g0, s, LinkType::Pci, 12.0);
        // Second hop too narrow for the charge.
        let (ls1, _) = b.connect(s, g1, LinkType::Pci, 6.0);
        b.path(g0, g1, PathType::Pix, 6.0, vec![l0s, ls1]);
        let mut system = b.build(2);
        let mut graph = graph_with_bw(10.0);

        assert!(!follow_path(&mut system, &mut graph, Some(g0), g1, 1).unwrap());
        assert_eq!(system.link(l0s).bw, 12.0);
        assert_eq!(system.link(ls1).bw, 6.0);
    }

    #[test]
    fn nvlink_into_cpu_charges_the_reverse_link() {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let g0 = b.gpu(0, 0, &[0], 90);
        let c = b.cpu(10, CpuArch::Power, CpuVendor::Unknown);
        let (gc, cg) = b.connect(g0, c, LinkType::Nvl, 20.0);
        b.path(g0, c, PathType::Phb, 20.0, vec![gc]);
        let mut system = b.build(1);
        let mut graph = graph_with_bw(8.0);
        graph.type_inter = PathType::Sys;

        assert!(follow_path(&mut system, &mut graph, Some(g0), c, 1).unwrap());
        assert_eq!(system.link(gc).bw, 12.0);
        assert_eq!(system.link(cg).bw, 12.0);
        assert!(follow_path(&mut system, &mut graph, Some(g0), c, -1).unwrap());
        assert_eq!(system.link(gc).bw, 20.0);
        assert_eq!(system.link(cg).bw, 20.0);
    }

    #[test]
    fn old_gpu_reached_from_nic_pays_reverse_charge() {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let g0 = b.gpu(0, 0, &[0], 70);
        let n = b.net(100, NetInfo { asic: 1, bw: 16.0, ..Default::default() });
        let (ng, gn) = b.connect(n, g0, LinkType::Net, 16.0);
        b.path(n, g0, PathType::Phb, 16.0, vec![ng]);
        let mut system = b.build(2);
        let mut graph = graph_with_bw(8.0);
        graph.type_inter = PathType::Sys;

        assert!(follow_path(&mut system, &mut graph, Some(n), g0, 1).unwrap());
        assert_eq!(system.link(ng).bw, 8.0);
        assert_eq!(system.link(gn).bw, 15.0);
        assert!(follow_path(&mut system, &mut graph, Some(n), g0, -1).unwrap());
        assert_eq!(system.link(ng).bw, 16.0);
        assert_eq!(system.link(gn).bw, 16.0);
    }

    #[test]
    fn intel_phb_transit_charges_pci_overhead() {
        let mut b = TopoBuilder::new(Platform::Nvidia);
        let g0 = b.gpu(0, 0, &[0], 90);
        let c = b.cpu(10, CpuArch::X86, CpuVendor::Intel);
        let g1 = b.gpu(1, 1, &[1], 90);
        let (l0c, _) = b.connect(g0, c, LinkType::Pci, 24.0);
        let (lc1, _) = b.connect(c, g1, LinkType::Pci, 24.0);
        b.path(g0, g1, PathType::Phb, 24.0, vec![l0c, lc1]);
        let mut system = b.build(2);
        let mut graph = graph_with_bw(10.0);
        graph.type_intra = PathType::Sys;

        assert!(follow_path(&mut system, &mut graph, Some(g0), g1, 1).unwrap());
        // 10.0 scaled by the Intel factor: 12.0 charged per PCI hop.
        assert_eq!(system.link(l0c).bw, 12.0);
        assert_eq!(system.link(lc1).bw, 12.0);
        assert!(follow_path(&mut system, &mut graph, Some(g0), g1, -1).unwrap());
        assert_eq!(system.link(l0c).bw, 24.0);
        assert_eq!(system.link(lc1).bw, 24.0);
    }
}
