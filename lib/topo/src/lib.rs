// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topology-aware channel planner for collective communication.
//!
//! Given a discovered topology of GPUs, CPUs, PCI switches and NICs connected
//! by typed links, the planner computes channel layouts — ordered rings or
//! trees of GPUs, optionally entering and exiting through NICs — that
//! maximize aggregate bandwidth under per-link capacity, path-type, and
//! pattern constraints.
//!
//! The engine is single-threaded and non-suspending: one caller enters
//! [`planner::Planner::compute`], it runs to completion or timeout, and the
//! caller owns the [`topo::TopoSystem`] and [`graph::TopoGraph`] for the
//! duration. The residual-bandwidth ledger mutates in place throughout the
//! recursion and is restored on every return path.

pub mod config;
pub mod error;
pub mod graph;
mod ledger;
pub mod matchers;
mod nets;
pub mod planner;
pub mod query;
mod score;
mod search;
pub mod topo;
pub mod xml;

pub use config::{ConfigError, PlannerConfig};
pub use error::{Result, TopoError};
pub use graph::{Pattern, TopoGraph};
pub use matchers::{ModelMatcher, RingSpecParser};
pub use planner::{print_graph, Planner};
pub use query::{
    get_intra_net_dev, get_link_type, get_net_dev, CommView, PeerInfo, MAX_XGMI_INTER_GPUS,
};
pub use search::search_init;
pub use topo::{
    CpuArch, CpuVendor, GpuInfo, LinkType, NetInfo, NodeKind, NodeRef, NodeType, Path, PathType,
    Platform, TopoBuilder, TopoSystem, LOC_BW, MAX_CHANNELS,
};
