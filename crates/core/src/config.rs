use crate::domain::MarketPair;
use crate::{Error, Result};
use anyhow::Context;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides, e.g. `RELAY_MINER__WALLET_SPLIT=0.6`
pub const ENV_PREFIX: &str = "RELAY_MINER";

/// Miner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Account that broadcasts ring transactions
    pub miner: Address,

    /// Account collecting fees and funding margin-split rebates
    pub fee_receiver: Address,

    /// Token order fees are denominated in
    pub fee_token: Address,

    /// Token gas is paid in, for cost conversion
    pub native_token: Address,

    /// Settlement contract
    pub protocol_address: Address,

    /// Ring hash registry contract
    pub registry_address: Address,

    /// Markets matched every round
    pub markets: Vec<MarketPair>,

    /// Blocks between two rounds
    pub round_interval_blocks: u64,

    /// Orders fetched per direction per round
    pub round_order_count: usize,

    /// Upper bound of the randomized fetch delay
    pub max_fetch_delay: u64,

    /// Ceiling on the rate-ratio fairness statistic
    pub rate_ratio_cvs_threshold: u64,

    /// Fraction of the gas cost charged against a ring's fees
    pub real_cost_rate: f64,

    /// Fraction of the net fee the miner keeps
    pub wallet_split: f64,

    /// Margin split applied to orders that do not carry one
    pub default_margin_split_percentage: u8,

    /// Register the ring hash in a separate transaction before settling
    pub pre_registration: bool,

    /// Gas floor for each call (0 disables)
    pub min_gas_limit: u64,

    /// Gas ceiling for each call (0 disables)
    pub max_gas_limit: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            miner: Address::zero(),
            fee_receiver: Address::zero(),
            fee_token: Address::zero(),
            native_token: Address::zero(),
            protocol_address: Address::zero(),
            registry_address: Address::zero(),
            markets: Vec::new(),
            round_interval_blocks: 1,
            round_order_count: 20,
            max_fetch_delay: 10,
            rate_ratio_cvs_threshold: 62_500,
            real_cost_rate: 1.0,
            wallet_split: 0.8,
            default_margin_split_percentage: 50,
            pre_registration: false,
            min_gas_limit: 0,
            max_gas_limit: 2_000_000,
        }
    }
}

impl MinerConfig {
    /// Loads a config file, then applies `RELAY_MINER__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading miner config {}", path.display()))?;

        let config: MinerConfig = settings
            .try_deserialize()
            .with_context(|| format!("parsing miner config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the miner cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            return Err(Error::ConfigError("at least one market is required".to_string()));
        }
        if self.round_interval_blocks == 0 {
            return Err(Error::ConfigError("round_interval_blocks must be positive".to_string()));
        }
        if self.round_order_count == 0 {
            return Err(Error::ConfigError("round_order_count must be positive".to_string()));
        }
        for (name, value) in [
            ("real_cost_rate", self.real_cost_rate),
            ("wallet_split", self.wallet_split),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::ConfigError(format!("{name} {value} outside [0, 1]")));
            }
        }
        if self.default_margin_split_percentage > 100 {
            return Err(Error::ConfigError(format!(
                "default_margin_split_percentage {} exceeds 100",
                self.default_margin_split_percentage
            )));
        }
        if self.max_gas_limit > 0 && self.min_gas_limit > self.max_gas_limit {
            return Err(Error::ConfigError(format!(
                "min_gas_limit {} above max_gas_limit {}",
                self.min_gas_limit, self.max_gas_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_market() -> MinerConfig {
        MinerConfig {
            markets: vec![MarketPair::new(
                Address::from_low_u64_be(1),
                Address::from_low_u64_be(2),
            )],
            ..MinerConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = MinerConfig::default();
        assert_eq!(config.round_interval_blocks, 1);
        assert!(!config.pre_registration);
        // no markets yet
        assert!(config.validate().is_err());
        assert!(with_market().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_fractions_and_gas_bounds() {
        let mut config = with_market();
        config.wallet_split = 1.5;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = with_market();
        config.min_gas_limit = 3_000_000;
        assert!(config.validate().is_err());

        config.max_gas_limit = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_toml_file() {
        let path = std::env::temp_dir().join(format!("miner-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
miner = "0x0000000000000000000000000000000000000009"
round_interval_blocks = 3
wallet_split = 0.5
pre_registration = true

[[markets]]
token_a = "0x0000000000000000000000000000000000000001"
token_b = "0x0000000000000000000000000000000000000002"
"#,
        )
        .unwrap();

        let config = MinerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.miner, Address::from_low_u64_be(9));
        assert_eq!(config.round_interval_blocks, 3);
        assert_eq!(config.wallet_split, 0.5);
        assert!(config.pre_registration);
        assert_eq!(config.markets.len(), 1);
        // untouched fields keep their defaults
        assert_eq!(config.round_order_count, 20);
    }
}
