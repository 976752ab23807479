//! Ecosystems and environments

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ModelError;

/// A chain family a token or wallet lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemId {
    Solana,
    Ethereum,
    Bnb,
    Avalanche,
    Polygon,
    Aurora,
    Fantom,
    Karura,
    Acala,
}

impl EcosystemId {
    pub const ALL: [EcosystemId; 9] = [
        EcosystemId::Solana,
        EcosystemId::Ethereum,
        EcosystemId::Bnb,
        EcosystemId::Avalanche,
        EcosystemId::Polygon,
        EcosystemId::Aurora,
        EcosystemId::Fantom,
        EcosystemId::Karura,
        EcosystemId::Acala,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EcosystemId::Solana => "solana",
            EcosystemId::Ethereum => "ethereum",
            EcosystemId::Bnb => "bnb",
            EcosystemId::Avalanche => "avalanche",
            EcosystemId::Polygon => "polygon",
            EcosystemId::Aurora => "aurora",
            EcosystemId::Fantom => "fantom",
            EcosystemId::Karura => "karura",
            EcosystemId::Acala => "acala",
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, EcosystemId::Solana)
    }

    /// Address comparison rules of the ecosystem (EVM hex is case-insensitive)
    pub fn same_address(&self, a: &str, b: &str) -> bool {
        if self.is_evm() {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }
}

impl fmt::Display for EcosystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EcosystemId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EcosystemId::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ModelError::UnknownEcosystem(s.to_string()))
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Mainnet,
    Devnet,
    Local,
    Custom,
}

impl Env {
    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Mainnet => "mainnet",
            Env::Devnet => "devnet",
            Env::Local => "local",
            Env::Custom => "custom",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Env {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "mainnet-beta" => Ok(Env::Mainnet),
            "devnet" => Ok(Env::Devnet),
            "local" | "localnet" => Ok(Env::Local),
            "custom" => Ok(Env::Custom),
            other => Err(ModelError::UnknownEnv(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecosystem_round_trip() {
        for ecosystem in EcosystemId::ALL {
            assert_eq!(ecosystem.as_str().parse::<EcosystemId>().unwrap(), ecosystem);
        }
        assert!("near".parse::<EcosystemId>().is_err());
    }

    #[test]
    fn test_env_aliases() {
        assert_eq!("mainnet-beta".parse::<Env>().unwrap(), Env::Mainnet);
        assert_eq!("localnet".parse::<Env>().unwrap(), Env::Local);
    }

    #[test]
    fn test_evm_addresses_compare_case_insensitively() {
        assert!(EcosystemId::Ethereum.same_address("0xAbC", "0xabc"));
        assert!(!EcosystemId::Solana.same_address("AbC", "abc"));
    }
}
