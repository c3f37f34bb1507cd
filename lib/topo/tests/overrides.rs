// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Declarative inputs around the search: XML overrides, graph dumps, model
//! matchers, and the user ring specification.

mod common;

use std::io::Write as _;

use anyhow::Result;
use common::nvlink_clique;
use weave_topo::{
    ModelMatcher, Pattern, PathType, Planner, PlannerConfig, RingSpecParser, TopoGraph, TopoSystem,
};

#[test]
fn graph_file_override_skips_the_search() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"<graphs version="1">
  <graph id="0" pattern="4" crossnic="0" nchannels="1" speedintra="7" speedinter="7" latencyinter="0" typeintra="SYS" typeinter="SYS" samechannels="1">
    <channel>
      <gpu dev="1"/>
      <gpu dev="0"/>
    </channel>
  </graph>
</graphs>"#
    )?;

    let mut config = PlannerConfig::default();
    config.graph_file = Some(file.path().to_path_buf());

    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    Planner::new(config).compute(&mut system, &mut graph)?;

    // The override wins over anything the search would have found.
    assert_eq!(graph.n_channels, 1);
    assert_eq!(graph.channel_ranks(0), &[1, 0]);
    assert_eq!(graph.bw_intra, 7.0);
    assert_eq!(graph.type_intra, PathType::Sys);
    Ok(())
}

#[test]
fn broken_override_is_ignored_and_the_search_proceeds() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    // dev 9 does not exist in the topology.
    write!(
        file,
        r#"<graphs version="1">
  <graph id="0" pattern="4" crossnic="0" nchannels="1" speedintra="7" speedinter="7" latencyinter="0" typeintra="SYS" typeinter="SYS" samechannels="1">
    <channel>
      <gpu dev="9"/>
      <gpu dev="0"/>
    </channel>
  </graph>
</graphs>"#
    )?;

    let mut config = PlannerConfig::default();
    config.graph_file = Some(file.path().to_path_buf());

    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    graph.max_channels = 1;
    Planner::new(config).compute(&mut system, &mut graph)?;

    // The computed graph, not the broken override.
    assert_eq!(graph.n_channels, 1);
    assert_eq!(graph.bw_intra, 22.0);
    assert_eq!(graph.channel_ranks(0), &[0, 1]);
    Ok(())
}

#[test]
fn dump_file_round_trips_through_the_xml_bridge() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump_path = dir.path().join("graphs.xml");

    let mut config = PlannerConfig::default();
    config.graph_dump_file = Some(dump_path.clone());

    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    graph.max_channels = 1;
    let planner = Planner::new(config);
    planner.compute(&mut system, &mut graph)?;
    planner.dump_graphs(&system, &[&graph])?;

    let text = std::fs::read_to_string(&dump_path)?;
    let mut restored = TopoGraph::new(0, Pattern::Tree);
    let channels = weave_topo::xml::graphs_from_xml(&system, &text, &mut restored)?;
    assert_eq!(channels, graph.n_channels);
    assert_eq!(restored.bw_intra, graph.bw_intra);
    assert_eq!(restored.channel_ranks(0), graph.channel_ranks(0));
    Ok(())
}

struct FixedLayout;

impl ModelMatcher for FixedLayout {
    fn name(&self) -> &'static str {
        "fixed-layout"
    }

    fn try_match(&self, system: &TopoSystem, graph: &mut TopoGraph) -> weave_topo::Result<bool> {
        if system.ngpus() != 2 {
            return Ok(false);
        }
        graph.n_channels = 1;
        graph.bw_intra = 30.0;
        graph.bw_inter = 30.0;
        graph.type_intra = PathType::Nvl;
        graph.type_inter = PathType::Nvl;
        graph.set_channel_ranks(0, &[1, 0]);
        Ok(true)
    }
}

struct NeverMatches;

impl ModelMatcher for NeverMatches {
    fn name(&self) -> &'static str {
        "never-matches"
    }

    fn try_match(&self, _system: &TopoSystem, _graph: &mut TopoGraph) -> weave_topo::Result<bool> {
        Ok(false)
    }
}

#[test]
fn matchers_are_consulted_in_order_and_win_on_match() -> Result<()> {
    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    Planner::new(PlannerConfig::default())
        .with_matcher(Box::new(NeverMatches))
        .with_matcher(Box::new(FixedLayout))
        .compute(&mut system, &mut graph)?;

    assert_eq!(graph.n_channels, 1);
    assert_eq!(graph.bw_intra, 30.0);
    assert_eq!(graph.channel_ranks(0), &[1, 0]);
    Ok(())
}

#[test]
fn disabled_matching_falls_through_to_the_search() -> Result<()> {
    let mut config = PlannerConfig::default();
    config.model_matching_disable = 1;

    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    graph.max_channels = 1;
    Planner::new(config).with_matcher(Box::new(FixedLayout)).compute(&mut system, &mut graph)?;

    // The searched layout, not the matcher's.
    assert_eq!(graph.bw_intra, 22.0);
    Ok(())
}

struct TrivialRings;

impl RingSpecParser for TrivialRings {
    fn parse(
        &self,
        spec: &str,
        system: &TopoSystem,
        graph: &mut TopoGraph,
    ) -> weave_topo::Result<bool> {
        if spec != "0|1" || system.ngpus() != 2 {
            return Ok(false);
        }
        graph.n_channels = 1;
        graph.bw_intra = 20.0;
        graph.bw_inter = 20.0;
        graph.type_intra = PathType::Nvl;
        graph.type_inter = PathType::Nvl;
        graph.set_channel_ranks(0, &[0, 1]);
        Ok(true)
    }
}

#[test]
fn ring_spec_marks_the_system_and_wins() -> Result<()> {
    let mut config = PlannerConfig::default();
    config.rings = Some("0|1".to_string());

    let mut system = nvlink_clique(2, 24.0);
    let mut graph = TopoGraph::new(0, Pattern::Ring);
    Planner::new(config)
        .with_ring_parser(Box::new(TrivialRings))
        .compute(&mut system, &mut graph)?;

    assert!(system.rome_4p2h);
    assert_eq!(graph.n_channels, 1);
    assert_eq!(graph.channel_ranks(0), &[0, 1]);
    Ok(())
}
