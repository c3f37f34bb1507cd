// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Post-search queries: which NIC (and which proxy rank) to use at runtime.

use crate::config::PlannerConfig;
use crate::error::{Result, TopoError};
use crate::graph::TopoGraph;
use crate::topo::{NodeKind, NodeRef, NodeType, PathType, TopoSystem};

/// Longest chain of intermediate GPUs considered when probing indirect XGMI
/// connectivity.
pub const MAX_XGMI_INTER_GPUS: usize = 2;

/// Per-rank information the transport layer already holds.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub cuda_dev: i32,
    pub net_dev: i64,
}

/// The slice of communicator state the queries need: the local topology, the
/// peer table indexed by rank, and the ranks local to this host.
pub struct CommView<'a> {
    pub system: &'a TopoSystem,
    pub peers: &'a [PeerInfo],
    pub local_ranks: &'a [i32],
}

impl CommView<'_> {
    fn peer(&self, rank: i32) -> Result<&PeerInfo> {
        self.peers
            .get(rank as usize)
            .ok_or_else(|| TopoError::invalid(format!("rank {rank} out of range")))
    }
}

/// The NIC closest to `rank`'s GPU, spreading co-located GPUs across
/// equally-close NICs by device number.
pub fn get_local_net(system: &TopoSystem, rank: i32) -> Result<i64> {
    let g = system.gpu_index_of_rank(rank)?;
    let nnets = system.nnets();
    let mut best: Option<(PathType, usize)> = None;
    for n in 0..nnets {
        let path = system.path(NodeRef::gpu(g), NodeRef::net(n));
        if path.kind == PathType::Dis {
            continue;
        }
        let key = (path.kind, path.hops());
        if best.is_none_or(|b| key < b) {
            best = Some(key);
        }
    }
    let Some(best) = best else {
        return Err(TopoError::invalid(format!("no NIC reachable from rank {rank}")));
    };
    let candidates: Vec<usize> = (0..nnets)
        .filter(|&n| {
            let path = system.path(NodeRef::gpu(g), NodeRef::net(n));
            (path.kind, path.hops()) == best
        })
        .collect();
    let dev = system.gpu_info(g)?.dev as usize;
    let chosen = candidates[dev % candidates.len()];
    Ok(system.nodes(NodeType::Net)[chosen].id)
}

/// The rank that should proxy `rank`'s traffic toward `net_id`: `rank` itself
/// when its path to the NIC is close (<= PXB), otherwise a node-local GPU
/// sharing an NVLink with `rank` and a close path to the NIC.
pub fn get_intermediate_rank(system: &TopoSystem, rank: i32, net_id: i64) -> Result<i32> {
    let g = system.gpu_index_of_rank(rank)?;
    let n = system.net_index_of_id(net_id)?;
    if system.path(NodeRef::gpu(g), NodeRef::net(n)).kind <= PathType::Pxb {
        return Ok(rank);
    }
    for g2 in 0..system.ngpus() {
        if g2 == g {
            continue;
        }
        if system.path(NodeRef::gpu(g), NodeRef::gpu(g2)).kind <= PathType::Nvl
            && system.path(NodeRef::gpu(g2), NodeRef::net(n)).kind <= PathType::Pxb
        {
            return Ok(system.gpu_info(g2)?.ranks[0]);
        }
    }
    Ok(rank)
}

/// The NIC (and proxy rank) to use for `(rank, peer_rank)` on `channel_id`.
///
/// With a computed graph the graph is authoritative. Without one, start from
/// the local NIC and, depending on the cross-NIC and PXN policies, prefer the
/// peer's NIC — possibly reached through a node-local proxy GPU.
pub fn get_net_dev(
    view: &CommView<'_>,
    config: &PlannerConfig,
    rank: i32,
    graph: Option<&TopoGraph>,
    channel_id: usize,
    peer_rank: Option<i32>,
) -> Result<(i64, i32)> {
    if let Some(graph) = graph {
        // Honor the net device in the graph.
        let channel = channel_id % graph.n_channels;
        let index = if graph.intra_at(channel, 0) == rank { 0 } else { 1 };
        let dev = graph.inter[channel * 2 + index];
        let proxy = get_intermediate_rank(view.system, rank, dev)?;
        return Ok((dev, proxy));
    }
    let Some(peer_rank) = peer_rank else {
        return Err(TopoError::internal("net device query without graph or peer"));
    };

    // Start with our local NIC and local rank.
    let mut dev = get_local_net(view.system, rank)?;
    let mut proxy = rank;

    let pxn_level = config.p2p_pxn_level;
    if config.cross_nic == 0 || pxn_level != 0 {
        // See whether we can use the peer's preferred device.
        let cuda_dev = view.peer(peer_rank)?.cuda_dev;
        let Some(local_g) = view.system.gpu_index_of_dev(cuda_dev) else {
            return Ok((dev, proxy));
        };
        let local_rank = view.system.gpu_info(local_g)?.ranks[0];
        let net_dev = view.peer(local_rank)?.net_dev;

        if config.cross_nic == 0 {
            if view.system.net_index_of_id(net_dev).is_err() {
                tracing::warn!(
                    "rank {peer_rank} requires NIC {net_dev} but that NIC is not available for rank {rank}"
                );
                return Err(TopoError::invalid(format!("NIC {net_dev} not present")));
            }
            dev = net_dev;
        }
        if pxn_level == 1 {
            let g = view.system.gpu_index_of_rank(rank)?;
            let n = view.system.net_index_of_id(net_dev)?;
            if view.system.path(NodeRef::gpu(g), NodeRef::net(n)).kind <= PathType::Pxn {
                dev = net_dev;
                proxy = get_intermediate_rank(view.system, rank, dev)?;
            }
        } else if pxn_level == 2 {
            // Check whether we can reach the peer's NIC through a node-local
            // GPU close to it.
            for &r in view.local_ranks {
                if view.peers.get(r as usize).map(|p| p.net_dev) != Some(net_dev) {
                    continue;
                }
                let g1 = view.system.gpu_index_of_rank(rank)?;
                let g2 = view.system.gpu_index_of_rank(r)?;
                let n = view.system.net_index_of_id(net_dev)?;
                if view.system.path(NodeRef::gpu(g2), NodeRef::gpu(g1)).kind <= PathType::Nvl
                    && view.system.path(NodeRef::gpu(g2), NodeRef::net(n)).kind <= PathType::Pxb
                {
                    return Ok((net_dev, r));
                }
            }
        }
    }
    Ok((dev, proxy))
}

/// The intra-channel NIC recorded for `rank` on `channel_id`, if the graph
/// carries intra-node NIC layouts (`side` 0 = entry, 1 = exit).
pub fn get_intra_net_dev(
    system: &TopoSystem,
    rank: i32,
    graph: Option<&TopoGraph>,
    channel_id: usize,
    side: usize,
) -> Option<i64> {
    let graph = graph?;
    if graph.n_intra_channels == 0 {
        return None;
    }
    let nnets = system.nnets() as i64;
    let chan = channel_id % graph.n_intra_channels;
    for (i, &r) in graph.channel_ranks(chan).iter().enumerate() {
        if r == rank {
            let n = graph.intra_nets[chan * graph.stride + i][side.min(1)];
            return (0..nnets).contains(&n).then_some(n);
        }
    }
    None
}

fn direct_xgmi(system: &TopoSystem, dev1: i32, dev2: i32) -> bool {
    let Some(g) = system.gpu_index_of_dev(dev1) else {
        return false;
    };
    let node = &system.nodes(NodeType::Gpu)[g];
    for path in node.paths_to(NodeType::Gpu) {
        if path.links.len() != 1 {
            continue;
        }
        let link = system.link(path.links[0]);
        if link.kind != crate::topo::LinkType::Nvl {
            continue;
        }
        if matches!(&system.node(link.remote).kind, NodeKind::Gpu(info) if info.dev == dev2) {
            return true;
        }
    }
    false
}

fn xgmi_chain(system: &TopoSystem, chain: &mut Vec<i32>, dev2: i32, max_inter: usize) -> bool {
    let depth = chain.len() - 1;
    if depth >= max_inter.min(MAX_XGMI_INTER_GPUS) {
        return false;
    }
    if chain.len() + 2 > system.ngpus() {
        return false;
    }
    for node in system.nodes(NodeType::Gpu) {
        let NodeKind::Gpu(info) = &node.kind else { continue };
        let dev = info.dev;
        if dev == dev2 || chain.contains(&dev) {
            continue;
        }
        if !direct_xgmi(system, chain[chain.len() - 1], dev) {
            continue;
        }
        chain.push(dev);
        if direct_xgmi(system, dev, dev2) || xgmi_chain(system, chain, dev2, max_inter) {
            chain.pop();
            return true;
        }
        chain.pop();
    }
    false
}

/// Whether two GPUs are XGMI/NVLink connected, either directly or through a
/// chain of at most `max_inter` (bounded by [`MAX_XGMI_INTER_GPUS`])
/// intermediate GPUs that are pairwise XGMI connected.
pub fn get_link_type(system: &TopoSystem, dev1: i32, dev2: i32, max_inter: usize) -> bool {
    if direct_xgmi(system, dev1, dev2) {
        return true;
    }
    if max_inter == 0 {
        return false;
    }
    let mut chain = vec![dev1];
    xgmi_chain(system, &mut chain, dev2, max_inter)
}
