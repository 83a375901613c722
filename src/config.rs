use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::{fs, path::Path};

/// Environment variable naming the config file when no CLI argument is given
pub const CONFIG_ENV: &str = "CHAIN_SIM_CONFIG";

pub const MIN_DIFFICULTY: usize = 2;
pub const MAX_DIFFICULTY: usize = 10;

/// Out-of-range tunables
#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("Difficulty must be between 2 and 10, got {0}")]
    Difficulty(usize),

    #[error("Block reward must be a finite value >= 0, got {0}")]
    BlockReward(f64),

    #[error("Fee rate must be between 0 and 1, got {0}")]
    FeeRate(f64),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chain: ChainParameters,
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How often the driver drains mining messages
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            poll_interval_ms: 50,
        }
    }
}

/// Tunables adjustable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ChainParameters {
    /// Leading zero hex digits a block hash needs
    pub difficulty: usize,
    /// Pause after each nonce batch, for visualisation
    pub mining_throttle_ms: u64,
    /// Fixed amount paid to the miner per block
    pub block_reward: f64,
    /// Fraction of each transfer charged to the sender
    pub fee_rate: f64,
}

impl Default for ChainParameters {
    fn default() -> Self {
        ChainParameters {
            difficulty: 4,
            mining_throttle_ms: 0,
            block_reward: 6.25,
            fee_rate: 0.001,
        }
    }
}

impl ChainParameters {
    pub fn validate(&self) -> Result<(), ParameterError> {
        check_difficulty(self.difficulty)?;
        check_block_reward(self.block_reward)?;
        check_fee_rate(self.fee_rate)
    }
}

pub fn check_difficulty(difficulty: usize) -> Result<(), ParameterError> {
    if (MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
        Ok(())
    } else {
        Err(ParameterError::Difficulty(difficulty))
    }
}

pub fn check_block_reward(block_reward: f64) -> Result<(), ParameterError> {
    if block_reward.is_finite() && block_reward >= 0.0 {
        Ok(())
    } else {
        Err(ParameterError::BlockReward(block_reward))
    }
}

pub fn check_fee_rate(fee_rate: f64) -> Result<(), ParameterError> {
    if (0.0..=1.0).contains(&fee_rate) {
        Ok(())
    } else {
        Err(ParameterError::FeeRate(fee_rate))
    }
}

/// An account created at start-up
#[derive(Debug, Clone, Deserialize)]
pub struct SeedAccount {
    pub name: String,
    #[serde(default)]
    pub balance: f64,
}

impl SeedAccount {
    fn new(name: &str, balance: f64) -> Self {
        SeedAccount {
            name: name.to_string(),
            balance,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub wallets: Vec<SeedAccount>,
    pub miners: Vec<SeedAccount>,
    /// Defaults to the first seed miner
    pub current_miner: Option<String>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            wallets: vec![SeedAccount::new("Alice", 100.0), SeedAccount::new("Bob", 100.0)],
            miners: vec![SeedAccount::new("Miner 1", 0.0)],
            current_miner: None,
        }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed or holds
///   out-of-range chain parameters.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    parse(&text)
}

fn parse(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text).context("invalid TOML in config file")?;
    config.chain.validate().context("invalid [chain] section")?;
    Ok(config)
}

/// Config from the first CLI argument, else `CHAIN_SIM_CONFIG`, else defaults
pub fn from_env() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());

    match path {
        Some(path) => load(path),
        None => Ok(Config::default()),
    }
}
