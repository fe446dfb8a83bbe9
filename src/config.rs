//! Engine configuration
//!
//! All knobs the reconciliation engine needs live in one validated struct
//! constructed at the boundary (env vars or a TOML file). Nothing inside
//! the engine reads the environment at point of use.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How a cost-basis figure is derived from the rows contributing to one
/// (ticker, account) aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostMode {
    /// Sum of per-row cost basis (default).
    TotalBasis,
    /// Quantity-weighted average cost per share.
    #[serde(alias = "avg_per_share")]
    AverageCost,
}

impl CostMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostMode::TotalBasis => "total_basis",
            CostMode::AverageCost => "average_cost",
        }
    }
}

impl FromStr for CostMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "total_basis" => Ok(CostMode::TotalBasis),
            // "avg_per_share" is the legacy spelling from older exports
            "average_cost" | "avg_per_share" => Ok(CostMode::AverageCost),
            other => bail!("unknown cost mode: {other} (expected total_basis or average_cost)"),
        }
    }
}

/// Validated configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key prefix under which input objects live, e.g. "source/".
    pub source_prefix: String,
    /// Key prefix for output workbooks and reports, e.g. "output/".
    pub output_prefix: String,
    /// CSV filename prefix inside the source prefix, e.g. "positions-".
    pub csv_prefix: String,
    /// Fixed key of the template workbook.
    pub template_key: String,
    /// Dataset the durable override table is scoped to.
    pub dataset_id: String,
    /// 1-based row holding the canonical account codes on each ticker sheet.
    pub header_row: u32,
    /// 1-based row the aggregate quantity is written to.
    pub quantity_row: u32,
    /// 1-based row the aggregate cost figure is written to.
    pub cost_row: u32,
    pub cost_mode: CostMode,
    /// Minimum similarity score for a fuzzy account match, in (0, 1].
    pub fuzzy_threshold: f64,
    /// Static alias table: raw CSV account label -> canonical account code.
    pub aliases: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_prefix: "source/".to_string(),
            output_prefix: "output/".to_string(),
            csv_prefix: "positions-".to_string(),
            template_key: "source/portfolio-template.xlsx".to_string(),
            dataset_id: "default".to_string(),
            header_row: 1,
            quantity_row: 24,
            cost_row: 39,
            cost_mode: CostMode::TotalBasis,
            fuzzy_threshold: 0.85,
            aliases: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Build a config from the process environment, starting from defaults.
    ///
    /// Unset variables keep their default; set-but-invalid variables are
    /// errors rather than silent fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = read_env("SOURCE_PREFIX") {
            cfg.source_prefix = v;
        }
        if let Some(v) = read_env("OUTPUT_PREFIX") {
            cfg.output_prefix = v;
        }
        if let Some(v) = read_env("DEFAULT_CSV_PREFIX") {
            cfg.csv_prefix = v;
        }
        if let Some(v) = read_env("TEMPLATE_KEY") {
            cfg.template_key = v;
        }
        if let Some(v) = read_env("DEFAULT_DATASET_ID") {
            cfg.dataset_id = v;
        }
        if let Some(v) = read_env("HEADER_ROW") {
            cfg.header_row = v.parse().context("HEADER_ROW must be an integer")?;
        }
        if let Some(v) = read_env("ROW_QTY") {
            cfg.quantity_row = v.parse().context("ROW_QTY must be an integer")?;
        }
        if let Some(v) = read_env("ROW_COST") {
            cfg.cost_row = v.parse().context("ROW_COST must be an integer")?;
        }
        if let Some(v) = read_env("COST_MODE") {
            cfg.cost_mode = v.parse()?;
        }
        if let Some(v) = read_env("FUZZY_THRESHOLD") {
            cfg.fuzzy_threshold = v.parse().context("FUZZY_THRESHOLD must be a number")?;
        }
        if let Some(v) = read_env("ACCOUNT_ALIASES_JSON") {
            cfg.aliases =
                serde_json::from_str(&v).context("ACCOUNT_ALIASES_JSON is not a valid JSON map")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config from a TOML file, with env-style defaults for any
    /// omitted field.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_prefix.is_empty() || self.output_prefix.is_empty() {
            bail!("source_prefix and output_prefix must be non-empty");
        }
        if self.template_key.is_empty() {
            bail!("template_key must be non-empty");
        }
        if self.dataset_id.is_empty() {
            bail!("dataset_id must be non-empty");
        }
        if self.header_row == 0 || self.quantity_row == 0 || self.cost_row == 0 {
            bail!("row numbers are 1-based and must be >= 1");
        }
        if self.quantity_row == self.cost_row {
            bail!("quantity_row and cost_row must differ");
        }
        if !(self.fuzzy_threshold > 0.0 && self.fuzzy_threshold <= 1.0) {
            bail!(
                "fuzzy_threshold must be in (0, 1], got {}",
                self.fuzzy_threshold
            );
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quantity_row, 24);
        assert_eq!(cfg.cost_row, 39);
        assert_eq!(cfg.cost_mode, CostMode::TotalBasis);
    }

    #[test]
    fn test_cost_mode_parsing_accepts_legacy_spelling() {
        assert_eq!(
            "avg_per_share".parse::<CostMode>().unwrap(),
            CostMode::AverageCost
        );
        assert_eq!(
            "TOTAL_BASIS".parse::<CostMode>().unwrap(),
            CostMode::TotalBasis
        );
        assert!("fifo".parse::<CostMode>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_rows_and_threshold() {
        let mut cfg = EngineConfig {
            quantity_row: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        cfg.quantity_row = 24;
        cfg.cost_row = 24;
        assert!(cfg.validate().is_err());

        cfg.cost_row = 39;
        cfg.fuzzy_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_aliases() {
        let toml_text = r#"
            csv_prefix = "holdings-"
            cost_mode = "average_cost"

            [aliases]
            "BrokerageLink" = "401K"
        "#;
        let cfg: EngineConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.csv_prefix, "holdings-");
        assert_eq!(cfg.cost_mode, CostMode::AverageCost);
        assert_eq!(cfg.aliases.get("BrokerageLink").unwrap(), "401K");
        // omitted fields fall back to defaults
        assert_eq!(cfg.quantity_row, 24);
    }
}
