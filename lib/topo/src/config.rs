// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Planner configuration.
//!
//! All tunables are read once, at planner construction, from `WEAVE_*`
//! environment variables merged over code defaults. The search itself never
//! consults the environment; it only sees this struct.
//!
//! Recognized variables:
//! - `WEAVE_CROSS_NIC` — 0 forbid, 1 require, 2 allow when multiple NICs
//!   exist (default 2).
//! - `WEAVE_P2P_PXN_LEVEL` — 0 off, 1 use PXN if needed, 2 use PXN as much
//!   as possible to maximize aggregation (default 2).
//! - `WEAVE_GRAPH_FILE` — XML channel layout override (input).
//! - `WEAVE_RINGS` — textual ring specification (input).
//! - `WEAVE_GRAPH_DUMP_FILE` — write computed graphs as XML (output).
//! - `WEAVE_MODEL_MATCHING_DISABLE` — 1 skips the canonical-shape matchers.

use std::path::PathBuf;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const ENV_PREFIX: &str = "WEAVE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Planner tunables, dependency-injected into [`crate::planner::Planner`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PlannerConfig {
    /// Cross-NIC policy: 0 forbid, 1 require, 2 allow if multi-NIC.
    #[validate(range(min = 0, max = 2))]
    pub cross_nic: u8,

    /// PXN proxy policy for point-to-point traffic: 0 off, 1 if needed,
    /// 2 aggressive.
    #[validate(range(min = 0, max = 2))]
    pub p2p_pxn_level: u8,

    /// XML layout override; when it yields channels, the search is skipped.
    pub graph_file: Option<PathBuf>,

    /// Textual ring specification, handed to the injected ring parser.
    pub rings: Option<String>,

    /// When set, computed graphs are dumped here as XML.
    pub graph_dump_file: Option<PathBuf>,

    /// 1 skips the canonical server-shape matchers.
    #[validate(range(min = 0, max = 1))]
    pub model_matching_disable: u8,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            cross_nic: 2,
            p2p_pxn_level: 2,
            graph_file: None,
            rings: None,
            graph_dump_file: None,
            model_matching_disable: 0,
        }
    }
}

impl PlannerConfig {
    /// Figment with defaults merged under `WEAVE_*` environment overrides.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(PlannerConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load and validate the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: PlannerConfig = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn model_matching_disabled(&self) -> bool {
        self.model_matching_disable != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PlannerConfig::default();
        assert_eq!(config.cross_nic, 2);
        assert_eq!(config.p2p_pxn_level, 2);
        assert_eq!(config.model_matching_disable, 0);
        assert!(config.graph_file.is_none());
        assert!(config.rings.is_none());
        assert!(config.graph_dump_file.is_none());
    }

    #[test]
    fn env_overrides_are_applied() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("WEAVE_CROSS_NIC", "1");
            jail.set_env("WEAVE_GRAPH_FILE", "/tmp/graph.xml");
            jail.set_env("WEAVE_MODEL_MATCHING_DISABLE", "1");
            let config = PlannerConfig::from_env().expect("config");
            assert_eq!(config.cross_nic, 1);
            assert_eq!(config.graph_file, Some(PathBuf::from("/tmp/graph.xml")));
            assert!(config.model_matching_disabled());
            Ok(())
        });
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("WEAVE_CROSS_NIC", "3");
            let err = PlannerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
            Ok(())
        });
    }
}
