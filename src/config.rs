// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::path::PathBuf;

use clap::Parser;

use crate::chain::RawAddress;
use crate::constants::{DEFAULT_FEE_RATE, DEFAULT_REQUEST_TIMEOUT_SECS, DUST_LIMIT};
use crate::BootstrapError;

/// Command-line arguments of the settlement daemon.
#[derive(Parser, Clone, Debug)]
#[clap(
    name = "settled",
    version = "0.1.0",
    about = "Settle Node: multi-contract settlement engine for tokenized assets"
)]
pub struct Opts {
    /// Path and name of the configuration file
    #[clap(short, long, default_value = "./settled.json", env = "SETTLED_CONFIG")]
    pub config: String,

    /// Sets verbosity level; can be used multiple times to increase verbosity
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// Data directory for the storage backend
    #[clap(short, long, env = "SETTLED_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Hex-encoded secret key controlling the contract address
    #[clap(short = 'k', long, env = "SETTLED_CONTRACT_KEY")]
    pub contract_key: Option<String>,

    /// Use the test-network payload magic
    #[clap(long)]
    pub test_mode: bool,
}

/// Full daemon configuration; not every parameter is reachable from the
/// command line, so the daemon also reads a configuration file which the
/// command-line arguments override.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Selects the test-network payload magic.
    pub is_test: bool,
    pub dust_limit: u64,
    /// Miner fee rate, satoshis per byte.
    pub fee_rate: f32,
    /// Time allowed for peer contracts to respond before a pending transfer
    /// is aborted, seconds.
    pub request_timeout_secs: u64,
    /// Address collecting this node's contract fees.
    pub fee_address: Option<RawAddress>,
    /// Hex-encoded secret key controlling the contract address.
    pub contract_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            is_test: false,
            dust_limit: DUST_LIMIT,
            fee_rate: DEFAULT_FEE_RATE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            fee_address: None,
            contract_key: None,
        }
    }
}

impl Config {
    /// Reads the configuration file when present and applies command-line
    /// overrides on top.
    pub fn load(opts: &Opts) -> Result<Config, BootstrapError> {
        let mut config = match std::fs::read(&opts.config) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|err| BootstrapError::Config(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err.into()),
        };
        if let Some(data_dir) = &opts.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(contract_key) = &opts.contract_key {
            config.contract_key = Some(contract_key.clone());
        }
        if opts.test_mode {
            config.is_test = true;
        }
        Ok(config)
    }
}
