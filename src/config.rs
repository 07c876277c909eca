//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Strategy
//! entries are validated here so a bad definition fails at startup rather
//! than at registration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::engine::pipeline::PipelineConfig;
use crate::engine::positions::Payouts;
use crate::engine::rounds::PhaseDurations;
use crate::strategy::conflict::ConflictConfig;
use crate::strategy::risk::RiskConfig;
use crate::strategy::StrategyDefinition;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub payouts: Payouts,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    #[serde(default)]
    pub durations: PhaseDurations,
    #[serde(default)]
    pub round_history: Option<usize>,
    #[serde(default)]
    pub signal_history: Option<usize>,
    #[serde(default)]
    pub settlement_history: Option<usize>,
    /// Log decisions instead of handing them to a live sink.
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Audit ledger file; no ledger is written when unset.
    #[serde(default)]
    pub ledger_path: Option<String>,
}

fn default_dry_run() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.risk
            .validate()
            .map_err(|msg| anyhow::anyhow!("Invalid [risk] section: {msg}"))?;
        for def in &self.strategies {
            def.validate()
                .with_context(|| format!("Strategy '{}' is invalid", def.key))?;
        }
        for (i, def) in self.strategies.iter().enumerate() {
            if self.strategies[..i].iter().any(|d| d.key == def.key) {
                anyhow::bail!("Strategy '{}' is declared twice", def.key);
            }
        }
        Ok(())
    }

    /// Tunables handed to the decision pipeline.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            payouts: self.payouts,
            risk: self.risk.clone(),
            conflict: self.conflict.clone(),
            signal_history: self.engine.signal_history,
            round_history: self.engine.round_history,
            settlement_history: self.engine.settlement_history,
        }
    }
}
