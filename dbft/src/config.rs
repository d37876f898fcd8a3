use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dbft_consensus::ConsensusConfig;
use multisig::{Committee, Keypair, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("config error {0}: {1}")]
    File(PathBuf, #[source] Box<dyn Error + Send + Sync>),

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("committee must have between 1 and 256 members, got {0}")]
    CommitteeSize(usize),

    #[error("public key does not match the secret key")]
    KeyMismatch,
}

/// Everything a node needs to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// The committee in validator index order.
    pub committee: Vec<PublicKey>,

    /// Location of the round snapshot.
    pub recovery_store: PathBuf,

    pub keys: NodeKeypair,

    #[serde(default)]
    pub consensus: ConsensusConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKeypair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl NodeConfig {
    pub async fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::File(path.into(), Box::new(e)))?
            .parse()
            .map_err(|e| ConfigError::File(path.into(), Box::new(e)))
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from(self.keys.secret.clone())
    }

    pub fn committee(&self) -> Committee {
        Committee::new(self.committee.iter().copied())
    }
}

impl FromStr for NodeConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let c: Self = toml::from_str(s)?;
        if c.committee.is_empty() || c.committee.len() > 256 {
            return Err(ConfigError::CommitteeSize(c.committee.len()));
        }
        if c.keys.secret.public_key() != c.keys.public {
            return Err(ConfigError::KeyMismatch);
        }
        Ok(c)
    }
}

impl fmt::Display for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = toml::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}
