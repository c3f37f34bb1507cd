// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Small hand-built topologies shared by the integration tests.

use weave_topo::{LinkType, NetInfo, NodeRef, PathType, Platform, TopoBuilder, TopoSystem};

/// Fully connected NVLink clique, one rank per GPU.
pub fn nvlink_clique(ngpus: usize, bw: f32) -> TopoSystem {
    let mut b = TopoBuilder::new(Platform::Nvidia);
    let gpus: Vec<NodeRef> = (0..ngpus)
        .map(|g| b.gpu(g as i64, g as i32, &[g as i32], 90))
        .collect();
    for i in 0..ngpus {
        for j in 0..ngpus {
            if i != j {
                let l = b.link(gpus[i], gpus[j], LinkType::Nvl, bw);
                b.path(gpus[i], gpus[j], PathType::Nvl, bw, vec![l]);
            }
        }
    }
    b.build(ngpus)
}

/// A PCI chain 0-1-2-3: adjacent pairs are PIX, everything else routes
/// through the chain as PXB.
pub fn pci_chain(ngpus: usize, bw: f32) -> TopoSystem {
    let mut b = TopoBuilder::new(Platform::Nvidia);
    let gpus: Vec<NodeRef> = (0..ngpus)
        .map(|g| b.gpu(g as i64, g as i32, &[g as i32], 90))
        .collect();
    for w in 0..ngpus - 1 {
        b.connect(gpus[w], gpus[w + 1], LinkType::Pci, bw);
    }
    for i in 0..ngpus {
        for j in 0..ngpus {
            if i == j {
                continue;
            }
            let hops: Vec<NodeRef> = if i < j {
                (i..=j).map(|g| gpus[g]).collect()
            } else {
                (j..=i).rev().map(|g| gpus[g]).collect()
            };
            let kind = if i.abs_diff(j) == 1 { PathType::Pix } else { PathType::Pxb };
            b.route(kind, bw, &hops).expect("chain route");
        }
    }
    b.build(ngpus)
}

/// One host of a two-host system: an NVLink clique plus one NIC that every
/// GPU reaches at PIX over its own link. `n_ranks` counts both hosts.
pub fn two_host_system(ngpus: usize, nvl_bw: f32, net_bw: f32, n_ranks: usize) -> TopoSystem {
    let mut b = TopoBuilder::new(Platform::Nvidia);
    let gpus: Vec<NodeRef> = (0..ngpus)
        .map(|g| b.gpu(g as i64, g as i32, &[g as i32], 90))
        .collect();
    for i in 0..ngpus {
        for j in 0..ngpus {
            if i != j {
                let l = b.link(gpus[i], gpus[j], LinkType::Nvl, nvl_bw);
                b.path(gpus[i], gpus[j], PathType::Nvl, nvl_bw, vec![l]);
            }
        }
    }
    let net = b.net(
        100,
        NetInfo { asic: 100, port: 1, bw: net_bw, latency: 2.5, ..Default::default() },
    );
    for &gpu in &gpus {
        let (ng, gn) = b.connect(net, gpu, LinkType::Net, net_bw);
        b.path(net, gpu, PathType::Pix, net_bw, vec![ng]);
        b.path(gpu, net, PathType::Pix, net_bw, vec![gn]);
    }
    b.build(n_ranks)
}

/// Every directed link's residual bandwidth, for leak checks. The link arena
/// is dense, so the per-node link lists cover it exactly.
pub fn link_residuals(system: &TopoSystem) -> Vec<f32> {
    let all_types = [
        weave_topo::NodeType::Gpu,
        weave_topo::NodeType::Cpu,
        weave_topo::NodeType::Net,
        weave_topo::NodeType::Switch,
    ];
    let total: usize = all_types
        .iter()
        .map(|&t| system.nodes(t).iter().map(|n| n.links.len()).sum::<usize>())
        .sum();
    (0..total).map(|idx| system.link(idx).bw).collect()
}
