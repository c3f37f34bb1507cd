// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The discovered hardware topology: nodes, links, and precomputed paths.
//!
//! Nodes and links live in arenas owned by [`TopoSystem`]; cross references
//! ("remote node", "reverse link", path steps) are indices, never owning
//! references in both directions. Topology discovery and path precomputation
//! happen outside this crate; they feed the system through [`TopoBuilder`].

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TopoError};

/// Upper bound on channels per graph; the per-GPU `used` bitmask is one bit
/// per channel.
pub const MAX_CHANNELS: usize = 32;

/// Bandwidth assumed for a device talking to itself.
pub const LOC_BW: f32 = 5000.0;

pub(crate) const NODE_TYPE_COUNT: usize = 4;

/// Hardware node classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum NodeType {
    Gpu = 0,
    Cpu = 1,
    Net = 2,
    Switch = 3,
}

impl NodeType {
    pub(crate) const ALL: [NodeType; NODE_TYPE_COUNT] =
        [NodeType::Gpu, NodeType::Cpu, NodeType::Net, NodeType::Switch];
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Gpu => "GPU",
            NodeType::Cpu => "CPU",
            NodeType::Net => "NET",
            NodeType::Switch => "SWITCH",
        };
        write!(f, "{s}")
    }
}

/// Link variants, ordered from closest to farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkType {
    Loc,
    Nvl,
    Pci,
    Net,
    Sys,
}

/// Path classification between two nodes, ordered from most local to most
/// remote. `Dis` marks a disconnected pair and is never a search tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PathType {
    Loc = 0,
    Nvl = 1,
    Nvb = 2,
    Pix = 3,
    Pxb = 4,
    Pxn = 5,
    Phb = 6,
    Sys = 7,
    Dis = 8,
}

impl PathType {
    pub(crate) const ORDERED: [PathType; 8] = [
        PathType::Loc,
        PathType::Nvl,
        PathType::Nvb,
        PathType::Pix,
        PathType::Pxb,
        PathType::Pxn,
        PathType::Phb,
        PathType::Sys,
    ];

    /// The next-loosest tolerance, saturating at `Sys`.
    pub(crate) fn relax(self) -> PathType {
        match self {
            PathType::Loc => PathType::Nvl,
            PathType::Nvl => PathType::Nvb,
            PathType::Nvb => PathType::Pix,
            PathType::Pix => PathType::Pxb,
            PathType::Pxb => PathType::Pxn,
            PathType::Pxn => PathType::Phb,
            _ => PathType::Sys,
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathType::Loc => "LOC",
            PathType::Nvl => "NVL",
            PathType::Nvb => "NVB",
            PathType::Pix => "PIX",
            PathType::Pxb => "PXB",
            PathType::Pxn => "PXN",
            PathType::Phb => "PHB",
            PathType::Sys => "SYS",
            PathType::Dis => "DIS",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PathType {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOC" => Ok(PathType::Loc),
            "NVL" => Ok(PathType::Nvl),
            "NVB" => Ok(PathType::Nvb),
            "PIX" => Ok(PathType::Pix),
            "PXB" => Ok(PathType::Pxb),
            "PXN" => Ok(PathType::Pxn),
            "PHB" => Ok(PathType::Phb),
            "SYS" => Ok(PathType::Sys),
            other => Err(TopoError::invalid(format!("unknown path type '{other}'"))),
        }
    }
}

/// GPU fleet vendor; selects the planner's speed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Nvidia,
    Amd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86,
    Arm,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// Device index as enumerated by the driver.
    pub dev: i32,
    /// Ranks hosted by this GPU; `ranks[0]` is the representative used during
    /// the search, the full list is substituted at expansion.
    pub ranks: Vec<i32>,
    /// Compute capability; below 80 incurs a reverse charge when reached from
    /// a non-GPU source.
    pub comp_cap: i32,
}

#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub arch: CpuArch,
    pub vendor: CpuVendor,
}

#[derive(Debug, Clone)]
pub struct NetInfo {
    /// NICs sharing (asic, port) are ports of the same physical device and
    /// share a bandwidth budget.
    pub asic: i64,
    pub port: i32,
    /// Residual device bandwidth; charged per channel during the search.
    pub bw: f32,
    pub latency: f32,
    pub max_channels: usize,
    pub coll_support: bool,
    pub gdr: bool,
}

impl Default for NetInfo {
    fn default() -> Self {
        NetInfo {
            asic: 0,
            port: 0,
            bw: 0.0,
            latency: 0.0,
            max_channels: MAX_CHANNELS,
            coll_support: false,
            gdr: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Gpu(GpuInfo),
    Cpu(CpuInfo),
    Net(NetInfo),
    Switch,
}

impl NodeKind {
    fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Gpu(_) => NodeType::Gpu,
            NodeKind::Cpu(_) => NodeType::Cpu,
            NodeKind::Net(_) => NodeType::Net,
            NodeKind::Switch => NodeType::Switch,
        }
    }
}

/// Typed index of a node: the arena slot within its type's node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub kind: NodeType,
    pub index: usize,
}

impl NodeRef {
    pub fn gpu(index: usize) -> NodeRef {
        NodeRef { kind: NodeType::Gpu, index }
    }

    pub fn cpu(index: usize) -> NodeRef {
        NodeRef { kind: NodeType::Cpu, index }
    }

    pub fn net(index: usize) -> NodeRef {
        NodeRef { kind: NodeType::Net, index }
    }
}

pub type LinkIdx = usize;

/// A directed link. `bw` is the residual bandwidth ledger entry for this
/// direction; the reverse direction is a separate link.
#[derive(Debug, Clone)]
pub struct TopoLink {
    pub kind: LinkType,
    pub bw: f32,
    pub remote: NodeRef,
}

/// A precomputed path between two nodes: an ordered sequence of link indices
/// plus its classification and end-to-end bandwidth. An empty link list with
/// `kind == Dis` means the pair is disconnected; an empty list between a node
/// and itself is the trivial local path.
#[derive(Debug, Clone)]
pub struct Path {
    pub kind: PathType,
    pub bw: f32,
    pub links: Vec<LinkIdx>,
}

impl Path {
    pub fn hops(&self) -> usize {
        self.links.len()
    }
}

impl Default for Path {
    fn default() -> Self {
        Path { kind: PathType::Dis, bw: 0.0, links: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct TopoNode {
    pub id: i64,
    pub kind: NodeKind,
    pub links: Vec<LinkIdx>,
    /// Bit k set = this node is already placed on channel k of the graph
    /// currently being searched.
    pub(crate) used: u64,
    /// Paths to every node, indexed by target type then target index.
    pub(crate) paths: [Vec<Path>; NODE_TYPE_COUNT],
}

impl TopoNode {
    fn new(id: i64, kind: NodeKind) -> Self {
        TopoNode {
            id,
            kind,
            links: Vec::new(),
            used: 0,
            paths: Default::default(),
        }
    }

    pub fn paths_to(&self, target: NodeType) -> &[Path] {
        &self.paths[target as usize]
    }

    pub fn gpu_info(&self) -> Option<&GpuInfo> {
        match &self.kind {
            NodeKind::Gpu(info) => Some(info),
            _ => None,
        }
    }

    pub fn net_info(&self) -> Option<&NetInfo> {
        match &self.kind {
            NodeKind::Net(info) => Some(info),
            _ => None,
        }
    }

    pub fn cpu_info(&self) -> Option<&CpuInfo> {
        match &self.kind {
            NodeKind::Cpu(info) => Some(info),
            _ => None,
        }
    }
}

/// The discovered system: node arenas per type, the link arena, and the
/// figures the planner derives from them.
#[derive(Debug, Clone)]
pub struct TopoSystem {
    nodes: [Vec<TopoNode>; NODE_TYPE_COUNT],
    links: Vec<TopoLink>,
    /// Total ranks in the communicator, across all hosts.
    pub n_ranks: usize,
    /// Per-channel max bandwidth reachable from any GPU; seeds the speed scan.
    pub max_bw: f32,
    /// Best aggregate bandwidth out of any single GPU.
    pub total_bw: f32,
    pub platform: Platform,
    /// Set when a user ring specification matched a Rome 4P2H system.
    pub rome_4p2h: bool,
}

impl TopoSystem {
    pub fn nodes(&self, t: NodeType) -> &[TopoNode] {
        &self.nodes[t as usize]
    }

    pub fn node(&self, r: NodeRef) -> &TopoNode {
        &self.nodes[r.kind as usize][r.index]
    }

    pub(crate) fn node_mut(&mut self, r: NodeRef) -> &mut TopoNode {
        &mut self.nodes[r.kind as usize][r.index]
    }

    pub fn ngpus(&self) -> usize {
        self.nodes(NodeType::Gpu).len()
    }

    pub fn nnets(&self) -> usize {
        self.nodes(NodeType::Net).len()
    }

    pub fn link(&self, idx: LinkIdx) -> &TopoLink {
        &self.links[idx]
    }

    pub(crate) fn link_mut(&mut self, idx: LinkIdx) -> &mut TopoLink {
        &mut self.links[idx]
    }

    pub(crate) fn gpu_info(&self, g: usize) -> Result<&GpuInfo> {
        self.nodes(NodeType::Gpu)[g]
            .gpu_info()
            .ok_or_else(|| TopoError::internal(format!("node {g} is not a GPU")))
    }

    pub(crate) fn net_info(&self, n: usize) -> Result<&NetInfo> {
        self.nodes(NodeType::Net)[n]
            .net_info()
            .ok_or_else(|| TopoError::internal(format!("node {n} is not a NIC")))
    }

    pub(crate) fn net_info_mut(&mut self, n: usize) -> Result<&mut NetInfo> {
        match &mut self.nodes[NodeType::Net as usize][n].kind {
            NodeKind::Net(info) => Ok(info),
            _ => Err(TopoError::internal(format!("node {n} is not a NIC"))),
        }
    }

    pub fn path(&self, from: NodeRef, to: NodeRef) -> &Path {
        &self.node(from).paths[to.kind as usize][to.index]
    }

    /// The GPU hosting `rank`, multi-rank aware.
    pub fn gpu_index_of_rank(&self, rank: i32) -> Result<usize> {
        for (g, node) in self.nodes(NodeType::Gpu).iter().enumerate() {
            if let NodeKind::Gpu(info) = &node.kind {
                if info.ranks.contains(&rank) {
                    return Ok(g);
                }
            }
        }
        tracing::warn!("could not find gpu for rank {rank}");
        Err(TopoError::internal(format!("no GPU hosts rank {rank}")))
    }

    pub fn net_index_of_id(&self, id: i64) -> Result<usize> {
        for (n, node) in self.nodes(NodeType::Net).iter().enumerate() {
            if node.id == id {
                return Ok(n);
            }
        }
        tracing::warn!("could not find net id {id:x}");
        Err(TopoError::internal(format!("no NIC has id {id:#x}")))
    }

    /// The GPU with driver device index `dev`.
    pub fn gpu_index_of_dev(&self, dev: i32) -> Option<usize> {
        self.nodes(NodeType::Gpu)
            .iter()
            .position(|node| matches!(&node.kind, NodeKind::Gpu(info) if info.dev == dev))
    }

    pub fn find_link(&self, from: NodeRef, to: NodeRef) -> Option<LinkIdx> {
        self.node(from)
            .links
            .iter()
            .copied()
            .find(|&l| self.links[l].remote == to)
    }

    /// The link carrying traffic back from `to` to `from`. Its absence for a
    /// committed forward link is a broken topology.
    pub(crate) fn find_rev_link(&self, from: NodeRef, to: NodeRef) -> Result<LinkIdx> {
        self.find_link(to, from).ok_or_else(|| {
            tracing::warn!(
                "could not find rev link for {}/{} -> {}/{}",
                from.kind,
                self.node(from).id,
                to.kind,
                self.node(to).id
            );
            TopoError::internal("reverse link not found")
        })
    }

    /// GDR availability between a GPU and a NIC, as reported by discovery.
    pub fn check_gdr(&self, _gpu: usize, net: usize) -> Result<bool> {
        Ok(self.net_info(net)?.gdr)
    }
}

/// Incremental construction of a [`TopoSystem`]. Nodes and links are added
/// first; paths may reference any link already added and are installed at
/// [`TopoBuilder::build`].
pub struct TopoBuilder {
    platform: Platform,
    nodes: [Vec<TopoNode>; NODE_TYPE_COUNT],
    links: Vec<TopoLink>,
    pending_paths: Vec<(NodeRef, NodeRef, Path)>,
}

impl TopoBuilder {
    pub fn new(platform: Platform) -> Self {
        TopoBuilder {
            platform,
            nodes: Default::default(),
            links: Vec::new(),
            pending_paths: Vec::new(),
        }
    }

    fn add_node(&mut self, id: i64, kind: NodeKind) -> NodeRef {
        let t = kind.node_type();
        let index = self.nodes[t as usize].len();
        self.nodes[t as usize].push(TopoNode::new(id, kind));
        NodeRef { kind: t, index }
    }

    pub fn gpu(&mut self, id: i64, dev: i32, ranks: &[i32], comp_cap: i32) -> NodeRef {
        self.add_node(
            id,
            NodeKind::Gpu(GpuInfo { dev, ranks: ranks.to_vec(), comp_cap }),
        )
    }

    pub fn cpu(&mut self, id: i64, arch: CpuArch, vendor: CpuVendor) -> NodeRef {
        self.add_node(id, NodeKind::Cpu(CpuInfo { arch, vendor }))
    }

    pub fn net(&mut self, id: i64, info: NetInfo) -> NodeRef {
        self.add_node(id, NodeKind::Net(info))
    }

    pub fn switch(&mut self, id: i64) -> NodeRef {
        self.add_node(id, NodeKind::Switch)
    }

    /// Add one directed link.
    pub fn link(&mut self, from: NodeRef, to: NodeRef, kind: LinkType, bw: f32) -> LinkIdx {
        let idx = self.links.len();
        self.links.push(TopoLink { kind, bw, remote: to });
        self.nodes[from.kind as usize][from.index].links.push(idx);
        idx
    }

    /// Add a link in each direction with the same bandwidth.
    pub fn connect(
        &mut self,
        a: NodeRef,
        b: NodeRef,
        kind: LinkType,
        bw: f32,
    ) -> (LinkIdx, LinkIdx) {
        (self.link(a, b, kind, bw), self.link(b, a, kind, bw))
    }

    /// Install a precomputed path with an explicit link sequence.
    pub fn path(&mut self, from: NodeRef, to: NodeRef, kind: PathType, bw: f32, links: Vec<LinkIdx>) {
        self.pending_paths.push((from, to, Path { kind, bw, links }));
    }

    /// Install a path following existing links through `hops` (first element
    /// is the source, last the destination).
    pub fn route(&mut self, kind: PathType, bw: f32, hops: &[NodeRef]) -> Result<()> {
        let mut links = Vec::with_capacity(hops.len().saturating_sub(1));
        for pair in hops.windows(2) {
            let found = self.nodes[pair[0].kind as usize][pair[0].index]
                .links
                .iter()
                .copied()
                .find(|&l| self.links[l].remote == pair[1]);
            let Some(l) = found else {
                return Err(TopoError::invalid(format!(
                    "no link from {}/{} to {}/{}",
                    pair[0].kind, pair[0].index, pair[1].kind, pair[1].index
                )));
            };
            links.push(l);
        }
        let (from, to) = (hops[0], hops[hops.len() - 1]);
        self.path(from, to, kind, bw, links);
        Ok(())
    }

    pub fn build(mut self, n_ranks: usize) -> TopoSystem {
        // Size every path table, then install the pending entries.
        let counts: Vec<usize> = NodeType::ALL.iter().map(|&t| self.nodes[t as usize].len()).collect();
        for t in 0..NODE_TYPE_COUNT {
            for node in &mut self.nodes[t] {
                for (u, &count) in counts.iter().enumerate() {
                    node.paths[u] = vec![Path::default(); count];
                }
            }
        }
        for (from, to, path) in self.pending_paths {
            self.nodes[from.kind as usize][from.index].paths[to.kind as usize][to.index] = path;
        }
        TopoSystem {
            nodes: self.nodes,
            links: self.links,
            n_ranks,
            max_bw: 0.0,
            total_bw: 0.0,
            platform: self.platform,
            rome_4p2h: false,
        }
    }
}
