//! Configuration management for the zero-confirmation keeper
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::lifecycle::UtxoSelection;

use anyhow::{Context, Result};
use ethers::types::{Address, H256};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub keeper: KeeperConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub ethereum: EthereumConfig,
    pub bitcoin: BitcoinConfig,
    pub attestation: AttestationConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeeperConfig {
    pub instance_id: String,
    /// Poll interval for deposit and attestation waits
    pub poll_interval_ms: u64,
    /// Give up a wait after this many polls; unset means wait forever
    pub max_poll_attempts: Option<u32>,
    pub required_confirmations: u32,
    #[serde(default)]
    pub utxo_selection: UtxoSelection,
    /// Bond pledged on every executed borrow, in token base units
    pub bond: String,
    /// Blocks after the borrow until default is permitted
    pub loan_timeout_blocks: u64,
    /// Execute the borrow as soon as the deposit confirms, before the signature lands
    pub lend_before_attestation: bool,
    pub default_sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    pub rpc_url: String,
    pub network: bitcoin::Network,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationConfig {
    pub rpc_url: String,
    /// Destination chain identifier used in attestation payloads
    pub destination_chain: String,
}

/// Addresses and constants of the deployed settlement system
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub shifter_pool: Address,
    /// Hex-encoded 20-byte hash of the attestation network's public key
    pub mpkh: String,
    /// keccak256 of the borrow proxy creation code; fetched from the pool when unset
    #[serde(default)]
    pub borrow_proxy_code_hash: Option<H256>,
    /// Payload hash committed to by every deposit
    pub phash: H256,
    /// Peer keeper that also receives published liquidity requests
    #[serde(default)]
    pub relay_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ZERO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ethereum.rpc_urls.is_empty() {
            anyhow::bail!("Ethereum has no RPC URLs configured");
        }

        if self.keeper.poll_interval_ms == 0 {
            anyhow::bail!("keeper.poll_interval_ms must be positive");
        }

        if self.keeper.default_sweep_interval_secs == 0 || self.keeper.health_check_interval_secs == 0 {
            anyhow::bail!("keeper sweep and health check intervals must be positive");
        }

        let mpkh = hex::decode(self.network.mpkh.trim_start_matches("0x"))
            .with_context(|| "network.mpkh is not valid hex")?;
        if mpkh.len() != 20 {
            anyhow::bail!("network.mpkh must be 20 bytes, got {}", mpkh.len());
        }

        if self.network.shifter_pool == Address::zero() {
            tracing::warn!("network.shifter_pool is the zero address");
        }

        if self.database.is_none() {
            tracing::warn!("No database configured - parcel progress will not survive restarts");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[keeper]
instance_id = "keeper-1"
poll_interval_ms = 3000
required_confirmations = 6
bond = "100000000"
loan_timeout_blocks = 10000
lend_before_attestation = true
default_sweep_interval_secs = 60
health_check_interval_secs = 30

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[ethereum]
chain_id = 1337
rpc_urls = ["http://localhost:8545"]
confirmation_blocks = 1

[bitcoin]
rpc_url = "http://localhost:18443"
network = "regtest"

[attestation]
rpc_url = "http://localhost:18515"
destination_chain = "Ethereum"

[network]
shifter_pool = "0x1111111111111111111111111111111111111111"
mpkh = "${ZERO_TEST_MPKH}"
borrow_proxy_code_hash = "0x2222222222222222222222222222222222222222222222222222222222222222"
phash = "0x3333333333333333333333333333333333333333333333333333333333333333"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("ZERO_TEST_MPKH", "44".repeat(20));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.keeper.required_confirmations, 6);
        assert_eq!(settings.keeper.utxo_selection, UtxoSelection::First);
        assert_eq!(settings.bitcoin.network, bitcoin::Network::Regtest);
        assert!(settings.database.is_none());
        assert!(settings.keeper.max_poll_attempts.is_none());
        assert_eq!(settings.network.borrow_proxy_code_hash, Some(H256::repeat_byte(0x22)));
    }

    #[test]
    fn test_code_hash_is_optional() {
        env::set_var("ZERO_TEST_MPKH", "44".repeat(20));
        let input = SAMPLE.replace(
            "borrow_proxy_code_hash = \"0x2222222222222222222222222222222222222222222222222222222222222222\"\n",
            "",
        );
        assert!(!input.contains("borrow_proxy_code_hash"));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(input.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.network.borrow_proxy_code_hash.is_none());
    }

    #[test]
    fn test_rejects_short_mpkh() {
        let input = SAMPLE.replace("${ZERO_TEST_MPKH}", "abcd");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(input.as_bytes()).unwrap();

        assert!(Settings::load_from(file.path()).is_err());
    }
}
