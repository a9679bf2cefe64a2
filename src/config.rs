//! Node configuration
//!
//! Everything consensus-relevant lives in [`ConsensusParams`]; the remaining
//! sections size the in-memory pools and the checkpoint policy. A config file
//! is TOML and every field has a per-network default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::constants::{COIN, MAX_DIFFICULTY};
use crate::crypto::PublicKey;

/// Difficulty cap applied when fast mining is requested on a test network
pub const FAST_MINING_DIFFICULTY_CAP: u32 = 4;

/// Configuration errors. The node refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fast mining override is not allowed on {0:?}")]
    FastMiningOnProduction(Network),
    #[error("mining difficulty cap is not allowed on {0:?}")]
    DifficultyCapOnProduction(Network),
    #[error("invalid consensus parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid trusted signer key: {0}")]
    InvalidSigner(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render defaults: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Network the node participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Whether this network carries real value
    pub fn is_production(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

/// Consensus rules. Two nodes agree only if these match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub network: Network,
    /// Reward of the first block in base units
    pub initial_reward: u64,
    /// Blocks between reward halvings
    pub halving_interval: u64,
    /// Hard cap on circulating supply in base units
    pub max_supply: u64,
    /// Desired seconds between blocks
    pub target_block_time: u64,
    /// Blocks between difficulty retargets
    pub adjustment_interval: u64,
    /// Maximum factor a single retarget may move difficulty
    pub max_adjustment_factor: u64,
    /// Difficulty (leading zero bits) of genesis and the first period
    pub initial_difficulty: u32,
    /// Seconds a header timestamp may run ahead of the local clock
    pub max_future_drift: u64,
    /// Minimum fee per transaction in base units
    pub min_fee: u64,
    /// Test-network override that keeps difficulty trivially low
    pub fast_mining: bool,
    /// Test-network cap on the difficulty a block may be required to meet
    pub max_mining_difficulty: Option<u32>,
    /// Deepest reorganization the node will perform
    pub max_reorg_depth: u64,
}

impl ConsensusParams {
    /// Defaults for a network
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                initial_reward: 50 * COIN,
                halving_interval: 210_000,
                max_supply: 21_000_000 * COIN,
                target_block_time: 600,
                adjustment_interval: 2016,
                max_adjustment_factor: 4,
                initial_difficulty: 20,
                max_future_drift: 2 * 60 * 60,
                min_fee: 1_000,
                fast_mining: false,
                max_mining_difficulty: None,
                max_reorg_depth: 100,
            },
            Network::Testnet => Self {
                network,
                initial_reward: 50 * COIN,
                halving_interval: 210_000,
                max_supply: 21_000_000 * COIN,
                target_block_time: 120,
                adjustment_interval: 720,
                max_adjustment_factor: 4,
                initial_difficulty: 16,
                max_future_drift: 2 * 60 * 60,
                min_fee: 1_000,
                fast_mining: false,
                max_mining_difficulty: None,
                max_reorg_depth: 100,
            },
            Network::Regtest => Self {
                network,
                initial_reward: 50 * COIN,
                halving_interval: 150,
                max_supply: 21_000_000 * COIN,
                target_block_time: 10,
                adjustment_interval: 100,
                max_adjustment_factor: 4,
                initial_difficulty: 1,
                max_future_drift: 2 * 60 * 60,
                min_fee: 0,
                fast_mining: false,
                max_mining_difficulty: None,
                max_reorg_depth: 1_000,
            },
        }
    }

    /// Difficulty ceiling enforced on retargets, if any
    pub fn difficulty_cap(&self) -> Option<u32> {
        let fast = self.fast_mining.then_some(FAST_MINING_DIFFICULTY_CAP);
        match (fast, self.max_mining_difficulty) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fail-closed sanity checks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.is_production() {
            if self.fast_mining {
                return Err(ConfigError::FastMiningOnProduction(self.network));
            }
            if self.max_mining_difficulty.is_some() {
                return Err(ConfigError::DifficultyCapOnProduction(self.network));
            }
        }
        if self.halving_interval == 0 {
            return Err(ConfigError::InvalidParameter("halving_interval must be > 0".into()));
        }
        if self.adjustment_interval == 0 {
            return Err(ConfigError::InvalidParameter("adjustment_interval must be > 0".into()));
        }
        if self.target_block_time == 0 {
            return Err(ConfigError::InvalidParameter("target_block_time must be > 0".into()));
        }
        if self.max_adjustment_factor < 1 {
            return Err(ConfigError::InvalidParameter("max_adjustment_factor must be >= 1".into()));
        }
        if self.initial_difficulty == 0 || self.initial_difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::InvalidParameter(format!(
                "initial_difficulty must be in 1..={}",
                MAX_DIFFICULTY
            )));
        }
        if self.initial_reward > self.max_supply {
            return Err(ConfigError::InvalidParameter("initial_reward exceeds max_supply".into()));
        }
        Ok(())
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self::for_network(Network::Regtest)
    }
}

/// Mempool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum validated transactions held
    pub capacity: usize,
    /// Maximum transactions waiting for unseen inputs
    pub orphan_capacity: usize,
    /// Age after which an unconfirmed transaction is dropped
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// How often the node sweeps expired transactions between blocks
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            orphan_capacity: 1_000,
            max_age: Duration::from_secs(3 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Orphan block pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Total orphan blocks held
    pub capacity: usize,
    /// Orphan blocks held per block index
    pub per_index: usize,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            per_index: 8,
        }
    }
}

/// Checkpoint creation and peer-sync policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Blocks between local checkpoints
    pub interval: u64,
    /// Distinct peers that must report the same payload
    pub min_peers: usize,
    /// Distinct network groups those peers must span
    pub min_peer_groups: usize,
    /// Hex x-only public keys whose signatures are trusted
    pub trusted_signers: Vec<String>,
    /// Per-peer fetch deadline
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
    /// Blocks behind a peer checkpoint before fast sync is used
    pub fast_sync_lag: u64,
    /// Hex secret used to sign local checkpoints
    pub signing_key: Option<String>,
}

impl CheckpointConfig {
    /// Parse the trusted signer set
    pub fn trusted_keys(&self) -> Result<Vec<PublicKey>, ConfigError> {
        self.trusted_signers
            .iter()
            .map(|s| PublicKey::from_hex(s).map_err(|_| ConfigError::InvalidSigner(s.clone())))
            .collect()
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 1_000,
            min_peers: 3,
            min_peer_groups: 2,
            trusted_signers: Vec::new(),
            peer_timeout: Duration::from_secs(10),
            fast_sync_lag: 500,
            signing_key: None,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root of blocks/, utxo_snapshot.json and checkpoints/
    pub data_dir: PathBuf,
    pub consensus: ConsensusParams,
    pub mempool: MempoolConfig,
    pub orphans: OrphanConfig,
    pub checkpoint: CheckpointConfig,
    /// Address credited by the built-in miner
    pub miner_address: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("ledger-data"),
            consensus: ConsensusParams::default(),
            mempool: MempoolConfig::default(),
            orphans: OrphanConfig::default(),
            checkpoint: CheckpointConfig::default(),
            miner_address: None,
        }
    }
}

impl NodeConfig {
    /// Defaults for a network rooted at `data_dir`
    pub fn for_network<P: AsRef<Path>>(network: Network, data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            consensus: ConsensusParams::for_network(network),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Consensus fields left out of the file take
    /// the defaults of the network the file names.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut doc: toml::Value = toml::from_str(text)?;

        let network = match doc.get("consensus").and_then(|c| c.get("network")) {
            Some(value) => Network::deserialize(value.clone())?,
            None => Network::Regtest,
        };
        let mut consensus = toml::Value::try_from(ConsensusParams::for_network(network))?;
        if let (Some(base), Some(overrides)) = (
            consensus.as_table_mut(),
            doc.get("consensus").and_then(|c| c.as_table()),
        ) {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        if let Some(table) = doc.as_table_mut() {
            table.insert("consensus".to_string(), consensus);
        }

        let config = NodeConfig::deserialize(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consensus.validate()?;
        self.checkpoint.trusted_keys()?;
        if self.checkpoint.interval == 0 {
            return Err(ConfigError::InvalidParameter("checkpoint interval must be > 0".into()));
        }
        if self.orphans.per_index == 0 {
            return Err(ConfigError::InvalidParameter("orphans.per_index must be > 0".into()));
        }
        if self.mempool.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidParameter("mempool.sweep_interval must be > 0".into()));
        }
        Ok(())
    }
}
