// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! XML round-trip of channel graphs, for user overrides and diagnostic dumps.
//!
//! Schema: `<graphs version=N>` containing `<graph id pattern crossnic
//! nchannels speedintra speedinter latencyinter typeintra typeinter
//! samechannels>` elements, each with ordered `<channel>` children holding an
//! optional entry `<net dev>`, the `<gpu dev>` sequence, and an optional exit
//! `<net dev>`.

use std::str::FromStr;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Result, TopoError};
use crate::graph::{Pattern, TopoGraph};
use crate::topo::{NodeKind, NodeType, TopoSystem, MAX_CHANNELS};

const GRAPH_XML_VERSION: u32 = 1;

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| TopoError::invalid(format!("bad attribute: {err}")))?;
        if a.key.as_ref() == name.as_bytes() {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_attr<T: FromStr>(e: &BytesStart<'_>, name: &str) -> Result<T> {
    let raw = attr(e, name)?
        .ok_or_else(|| TopoError::invalid(format!("missing attribute '{name}'")))?;
    raw.parse::<T>()
        .map_err(|_| TopoError::invalid(format!("bad value '{raw}' for attribute '{name}'")))
}

/// Serialize `graphs` to the XML form.
pub fn graphs_to_xml(system: &TopoSystem, graphs: &[&TopoGraph]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let mut root = BytesStart::new("graphs");
    root.push_attribute(("version", GRAPH_XML_VERSION.to_string().as_str()));
    writer.write_event(Event::Start(root))?;

    for graph in graphs {
        let mut el = BytesStart::new("graph");
        el.push_attribute(("id", graph.id.to_string().as_str()));
        el.push_attribute(("pattern", graph.pattern.code().to_string().as_str()));
        el.push_attribute(("crossnic", if graph.cross_nic { "1" } else { "0" }));
        el.push_attribute(("nchannels", graph.n_channels.to_string().as_str()));
        el.push_attribute(("speedintra", graph.bw_intra.to_string().as_str()));
        el.push_attribute(("speedinter", graph.bw_inter.to_string().as_str()));
        el.push_attribute(("latencyinter", graph.latency_inter.to_string().as_str()));
        el.push_attribute(("typeintra", graph.type_intra.to_string().as_str()));
        el.push_attribute(("typeinter", graph.type_inter.to_string().as_str()));
        el.push_attribute(("samechannels", if graph.same_channels { "1" } else { "0" }));
        writer.write_event(Event::Start(el))?;

        for c in 0..graph.n_channels {
            writer.write_event(Event::Start(BytesStart::new("channel")))?;
            if system.nnets() > 0 {
                let mut net = BytesStart::new("net");
                net.push_attribute(("dev", graph.inter[c * 2].to_string().as_str()));
                writer.write_event(Event::Empty(net))?;
            }
            for &rank in graph.channel_ranks(c) {
                let dev = system
                    .nodes(NodeType::Gpu)
                    .iter()
                    .find_map(|node| match &node.kind {
                        NodeKind::Gpu(info) if info.ranks.contains(&rank) => Some(info.dev),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        tracing::warn!("xml export: rank {rank} not found");
                        TopoError::internal(format!("rank {rank} not hosted by any GPU"))
                    })?;
                let mut gpu = BytesStart::new("gpu");
                gpu.push_attribute(("dev", dev.to_string().as_str()));
                writer.write_event(Event::Empty(gpu))?;
            }
            if system.nnets() > 0 {
                let mut net = BytesStart::new("net");
                net.push_attribute(("dev", graph.inter[c * 2 + 1].to_string().as_str()));
                writer.write_event(Event::Empty(net))?;
            }
            writer.write_event(Event::End(BytesEnd::new("channel")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("graph")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("graphs")))?;

    String::from_utf8(writer.into_inner())
        .map_err(|err| TopoError::internal(format!("non-utf8 xml output: {err}")))
}

/// Populate `graph` from the `<graph>` element whose id matches. Returns the
/// number of channels read for the matched graph (0 when none matched).
///
/// A `<graph crossnic="1">` is skipped when the planner forbids cross-NIC
/// layouts.
pub fn graphs_from_xml(
    system: &TopoSystem,
    text: &str,
    graph: &mut TopoGraph,
) -> Result<usize> {
    let ngpus = system.ngpus();
    if graph.intra.is_empty() {
        graph.alloc(ngpus, system.n_ranks);
    }
    let mut reader = Reader::from_str(text);

    let mut matching = false;
    let mut channels_seen = 0usize;
    let mut net_count = 0usize;
    let mut gpu_count = 0usize;

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"graphs" => {}
                b"graph" => {
                    let id: usize = parse_attr(e, "id")?;
                    if id != graph.id {
                        continue;
                    }
                    let cross_nic: u8 = parse_attr(e, "crossnic")?;
                    if !graph.cross_nic && cross_nic == 1 {
                        continue;
                    }
                    graph.cross_nic = cross_nic != 0;
                    graph.pattern = Pattern::from_code(parse_attr(e, "pattern")?)?;
                    let n_channels: usize = parse_attr(e, "nchannels")?;
                    if n_channels > MAX_CHANNELS {
                        return Err(TopoError::invalid(format!(
                            "nchannels {n_channels} exceeds the limit of {MAX_CHANNELS}"
                        )));
                    }
                    graph.n_channels = n_channels;
                    graph.bw_intra = parse_attr(e, "speedintra")?;
                    graph.bw_inter = parse_attr(e, "speedinter")?;
                    graph.latency_inter =
                        attr(e, "latencyinter")?.and_then(|v| v.parse().ok()).unwrap_or(0.0);
                    graph.type_intra = attr(e, "typeintra")?
                        .ok_or_else(|| TopoError::invalid("missing attribute 'typeintra'"))?
                        .parse()?;
                    graph.type_inter = attr(e, "typeinter")?
                        .ok_or_else(|| TopoError::invalid("missing attribute 'typeinter'"))?
                        .parse()?;
                    graph.same_channels = parse_attr::<u8>(e, "samechannels")? != 0;
                    matching = true;
                    channels_seen = 0;
                }
                b"channel" if matching => {
                    if channels_seen == MAX_CHANNELS {
                        return Err(TopoError::invalid(format!(
                            "more than {MAX_CHANNELS} channels in the override"
                        )));
                    }
                    net_count = 0;
                    gpu_count = 0;
                    channels_seen += 1;
                }
                b"net" if matching && channels_seen > 0 => {
                    let dev: i64 = parse_attr(e, "dev")?;
                    if net_count < 2 {
                        graph.inter[(channels_seen - 1) * 2 + net_count] = dev;
                    }
                    net_count += 1;
                }
                b"gpu" if matching && channels_seen > 0 => {
                    let dev: i32 = parse_attr(e, "dev")?;
                    let Some(g) = system.gpu_index_of_dev(dev) else {
                        tracing::warn!("xml import channel: dev {dev} not found");
                        return Err(TopoError::invalid(format!("unknown GPU dev {dev}")));
                    };
                    let rank = system.gpu_info(g)?.ranks[0];
                    if gpu_count >= ngpus {
                        return Err(TopoError::invalid(format!(
                            "channel {} lists more than {ngpus} GPUs",
                            channels_seen - 1
                        )));
                    }
                    graph.set_intra(channels_seen - 1, gpu_count, rank);
                    gpu_count += 1;
                }
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"channel" if matching && channels_seen > 0 => {
                    if gpu_count != ngpus {
                        return Err(TopoError::invalid(format!(
                            "channel {} lists {gpu_count} GPUs, expected {ngpus}",
                            channels_seen - 1
                        )));
                    }
                }
                b"graph" if matching => {
                    matching = false;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(channels_seen)
}
