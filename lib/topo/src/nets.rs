// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ranked NIC candidate lists.

use crate::error::Result;
use crate::topo::{NodeRef, PathType, TopoSystem};

/// Build the ordered, duplicate-free list of NICs to try, nearest path type
/// first.
///
/// `gpu` of `None` builds a list suitable for all GPUs (search start); a
/// specific index restricts the view to that GPU (getting back to the NIC).
/// Within one (type, GPU) bucket the local list is rotated by the GPU's
/// device number, so co-located GPUs of independent communicators spread
/// across sibling NICs instead of all picking the same first choice.
pub(crate) fn select_nets(
    system: &TopoSystem,
    type_inter: PathType,
    gpu: Option<usize>,
) -> Result<Vec<usize>> {
    let nnets = system.nnets();
    let mut nets = Vec::with_capacity(nnets);

    for t in PathType::ORDERED.into_iter().take_while(|&t| t <= type_inter) {
        for g in 0..system.ngpus() {
            if gpu.is_some_and(|want| want != g) {
                continue;
            }
            let mut local: Vec<usize> = (0..nnets)
                .filter(|&n| system.path(NodeRef::gpu(g), NodeRef::net(n)).kind == t)
                .collect();
            if local.is_empty() {
                continue;
            }
            let dev = system.gpu_info(g)?.dev as usize;
            let local_len = local.len();
            local.rotate_left(dev % local_len);
            for n in local {
                if !nets.contains(&n) {
                    nets.push(n);
                }
            }
        }
    }
    Ok(nets)
}
