// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error type for the channel planner.
//!
//! Two failure kinds matter to callers: `InvalidInput` (the caller or an
//! override file referenced a device/rank the topology does not contain) and
//! `Internal` (a broken invariant, e.g. a committed forward link with no
//! reverse link). Running out of search time is deliberately *not* an error;
//! it surfaces as a graph with zero channels.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum TopoError {
    /// The input topology, an override file, or a query argument referenced
    /// something the system does not contain.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A broken internal invariant. These are fatal: the bandwidth ledger can
    /// no longer be trusted.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, TopoError>;

impl TopoError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        TopoError::Internal(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TopoError::InvalidInput(msg.into())
    }
}
