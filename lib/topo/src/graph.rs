// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The channel graph being built: an ordered set of rings or trees of GPUs,
//! optionally entering and exiting through NICs.

use crate::error::{Result, TopoError};
use crate::topo::{PathType, MAX_CHANNELS};

/// Topological shape of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    BalancedTree,
    SplitTree,
    Tree,
    Ring,
}

impl Pattern {
    /// Stable numeric code used by the XML form.
    pub(crate) fn code(self) -> u32 {
        match self {
            Pattern::BalancedTree => 1,
            Pattern::SplitTree => 2,
            Pattern::Tree => 3,
            Pattern::Ring => 4,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Pattern> {
        match code {
            1 => Ok(Pattern::BalancedTree),
            2 => Ok(Pattern::SplitTree),
            3 => Ok(Pattern::Tree),
            4 => Ok(Pattern::Ring),
            other => Err(TopoError::invalid(format!("unknown pattern code {other}"))),
        }
    }
}

/// A candidate channel layout.
///
/// During the search every mutation is paired with a reversal on the return
/// path; the only persistent copies are the `clone_from` snapshots taken when
/// the comparator declares a candidate better than the best so far.
#[derive(Debug, Clone)]
pub struct TopoGraph {
    pub id: usize,
    pub pattern: Pattern,
    pub cross_nic: bool,
    pub coll_net: bool,
    pub min_channels: usize,
    pub max_channels: usize,
    pub n_channels: usize,
    pub same_channels: bool,
    pub bw_intra: f32,
    pub bw_inter: f32,
    pub latency_inter: f32,
    pub type_intra: PathType,
    pub type_inter: PathType,
    /// Running hop total over all committed paths.
    pub n_hops: i64,
    /// Rank sequences, `stride` entries per channel.
    pub(crate) intra: Vec<i32>,
    /// Entry/exit NIC ids, two per channel; -1 when unset.
    pub(crate) inter: Vec<i64>,
    /// Per-(channel, position) NIC ids for intra-node channels. Never written
    /// by the search; reserved for intra-node NIC layouts.
    pub(crate) intra_nets: Vec<[i64; 2]>,
    pub n_intra_channels: usize,
    /// Ranks per channel in `intra`: the GPU count during the search, the
    /// rank count after multi-rank expansion.
    pub(crate) stride: usize,
}

impl TopoGraph {
    pub fn new(id: usize, pattern: Pattern) -> Self {
        TopoGraph {
            id,
            pattern,
            cross_nic: false,
            coll_net: false,
            min_channels: 1,
            max_channels: MAX_CHANNELS,
            n_channels: 0,
            same_channels: true,
            bw_intra: 0.0,
            bw_inter: 0.0,
            latency_inter: 0.0,
            type_intra: PathType::Loc,
            type_inter: PathType::Loc,
            n_hops: 0,
            intra: Vec::new(),
            inter: Vec::new(),
            intra_nets: Vec::new(),
            n_intra_channels: 0,
            stride: 0,
        }
    }

    /// Size the channel arrays for a system of `ngpus` local GPUs hosting up
    /// to `n_ranks` ranks, and clamp the channel bounds.
    pub(crate) fn alloc(&mut self, ngpus: usize, n_ranks: usize) {
        let width = ngpus.max(n_ranks);
        self.max_channels = self.max_channels.min(MAX_CHANNELS);
        self.min_channels = self.min_channels.max(1);
        self.intra = vec![-1; MAX_CHANNELS * width];
        self.inter = vec![-1; MAX_CHANNELS * 2];
        self.intra_nets = vec![[-1, -1]; MAX_CHANNELS * width];
        self.stride = ngpus;
        self.n_hops = 0;
    }

    /// The rank sequence of channel `c`.
    pub fn channel_ranks(&self, c: usize) -> &[i32] {
        &self.intra[c * self.stride..(c + 1) * self.stride]
    }

    /// The (entry, exit) NIC ids of channel `c`.
    pub fn channel_nets(&self, c: usize) -> (i64, i64) {
        (self.inter[c * 2], self.inter[c * 2 + 1])
    }

    /// Set the rank sequence of channel `c`. Layout providers (canonical-shape
    /// matchers, ring parsers) populate graphs through this; the planner has
    /// already sized the channel arrays by the time they run.
    pub fn set_channel_ranks(&mut self, c: usize, ranks: &[i32]) {
        let stride = self.stride;
        self.intra[c * stride..c * stride + ranks.len()].copy_from_slice(ranks);
    }

    /// Set the (entry, exit) NIC ids of channel `c`.
    pub fn set_channel_nets(&mut self, c: usize, entry: i64, exit: i64) {
        self.inter[c * 2] = entry;
        self.inter[c * 2 + 1] = exit;
    }

    pub(crate) fn intra_at(&self, c: usize, step: usize) -> i32 {
        self.intra[c * self.stride + step]
    }

    pub(crate) fn set_intra(&mut self, c: usize, step: usize, rank: i32) {
        let stride = self.stride;
        self.intra[c * stride + step] = rank;
    }
}
