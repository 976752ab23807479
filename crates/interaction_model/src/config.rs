//! Static configuration: tokens, pools and bridges
//!
//! Tokens and pools are defined by configuration and never created at
//! runtime. Everything downstream holds `Arc<TokenSpec>` handles into the
//! same [`Config`].

use pool_math::{Decimal, PoolParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ecosystem::{EcosystemId, Env};
use crate::{ModelError, Result};

/// Per-ecosystem representation of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    /// Mint (Solana) or contract (EVM) address
    pub address: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    pub id: String,
    pub symbol: String,
    pub native_ecosystem: EcosystemId,
    #[serde(default)]
    pub details: BTreeMap<EcosystemId, TokenDetails>,
}

impl TokenSpec {
    pub fn details_for(&self, ecosystem: EcosystemId) -> Option<&TokenDetails> {
        self.details.get(&ecosystem)
    }

    pub fn address_on(&self, ecosystem: EcosystemId) -> Option<&str> {
        self.details.get(&ecosystem).map(|d| d.address.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    /// Settlement (home) ecosystem where the pool program lives
    pub ecosystem: EcosystemId,
    pub program_id: String,
    /// Pool state account
    pub address: String,
    /// LP token id
    pub lp_token: String,
    /// Pool token ids, in pool index order
    pub tokens: Vec<String>,
    /// Pool-owned token accounts, in pool index order
    #[serde(default)]
    pub token_accounts: Vec<String>,
    /// Hub pool whose LP token trades in other pools
    #[serde(default)]
    pub is_hub: bool,
    #[serde(default)]
    pub amp_factor: Decimal,
    #[serde(default)]
    pub lp_fee: Decimal,
    #[serde(default)]
    pub governance_fee: Decimal,
}

impl PoolSpec {
    pub fn params(&self) -> PoolParams {
        PoolParams::new(self.amp_factor, self.lp_fee, self.governance_fee)
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.tokens.iter().any(|t| t == token_id)
    }

    pub fn token_index(&self, token_id: &str) -> Result<usize> {
        self.tokens
            .iter()
            .position(|t| t == token_id)
            .ok_or_else(|| ModelError::TokenNotInPool {
                token: token_id.to_string(),
                pool: self.id.clone(),
            })
    }
}

/// Bridge contracts deployed on one ecosystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSpec {
    pub ecosystem: EcosystemId,
    pub core_bridge: String,
    pub token_bridge: String,
}

/// Resolved tokens of one pool
#[derive(Debug, Clone)]
pub struct PoolTokens {
    pub tokens: Vec<Arc<TokenSpec>>,
    pub lp_token: Arc<TokenSpec>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: Env,
    pub tokens: Vec<Arc<TokenSpec>>,
    pub pools: Vec<PoolSpec>,
    pub bridges: Vec<BridgeSpec>,
    /// Token program owning token accounts on the settlement chain
    pub token_account_program: String,
}

impl Config {
    pub fn token(&self, id: &str) -> Result<&Arc<TokenSpec>> {
        self.tokens
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ModelError::UnknownToken(id.to_string()))
    }

    pub fn pool(&self, id: &str) -> Result<&PoolSpec> {
        self.pools
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ModelError::UnknownPool(id.to_string()))
    }

    pub fn bridge(&self, ecosystem: EcosystemId) -> Result<&BridgeSpec> {
        self.bridges
            .iter()
            .find(|b| b.ecosystem == ecosystem)
            .ok_or(ModelError::UnknownBridge(ecosystem))
    }

    pub fn pool_tokens(&self, pool_id: &str) -> Result<PoolTokens> {
        let pool = self.pool(pool_id)?;
        let tokens = pool
            .tokens
            .iter()
            .map(|id| self.token(id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let lp_token = self.token(&pool.lp_token)?.clone();
        Ok(PoolTokens { tokens, lp_token })
    }

    pub fn hub_pool(&self) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.is_hub)
    }

    /// Check cross references and per-pool parameters
    pub fn validate(&self) -> Result<()> {
        for pool in &self.pools {
            let tokens = self.pool_tokens(&pool.id)?;
            for token in tokens.tokens.iter().chain(std::iter::once(&tokens.lp_token)) {
                if token.details_for(pool.ecosystem).is_none() {
                    return Err(ModelError::InvalidConfig(format!(
                        "token {} has no {} details but is used by pool {}",
                        token.id, pool.ecosystem, pool.id
                    )));
                }
            }
            if !pool.token_accounts.is_empty() && pool.token_accounts.len() != pool.tokens.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "pool {} lists {} token accounts for {} tokens",
                    pool.id,
                    pool.token_accounts.len(),
                    pool.tokens.len()
                )));
            }
            pool_math::PoolMath::empty(pool.tokens.len(), pool.params())?;
        }
        if self.pools.iter().filter(|p| p.is_hub).count() > 1 {
            return Err(ModelError::InvalidConfig("more than one hub pool".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared test configuration: a hub pool on Solana with three stablecoins
    //! plus two metapools pairing the hub LP token with a bridged token.

    use super::*;

    fn details(entries: &[(EcosystemId, &str, u8)]) -> BTreeMap<EcosystemId, TokenDetails> {
        entries
            .iter()
            .map(|(e, a, d)| {
                (
                    *e,
                    TokenDetails {
                        address: a.to_string(),
                        decimals: *d,
                    },
                )
            })
            .collect()
    }

    fn token(
        id: &str,
        native: EcosystemId,
        entries: &[(EcosystemId, &str, u8)],
    ) -> Arc<TokenSpec> {
        Arc::new(TokenSpec {
            id: id.to_string(),
            symbol: id.rsplit('-').next().unwrap_or(id).to_uppercase(),
            native_ecosystem: native,
            details: details(entries),
        })
    }

    fn pool(id: &str, lp: &str, tokens: &[&str], is_hub: bool) -> PoolSpec {
        PoolSpec {
            id: id.to_string(),
            ecosystem: EcosystemId::Solana,
            program_id: "SwimProgram1111111111111111111111111111111".to_string(),
            address: format!("{id}-state"),
            lp_token: lp.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            token_accounts: tokens.iter().map(|t| format!("{id}-{t}-account")).collect(),
            is_hub,
            amp_factor: Decimal::from(1000),
            lp_fee: Decimal::new(3, 4),
            governance_fee: Decimal::new(1, 4),
        }
    }

    pub(crate) fn config() -> Config {
        use EcosystemId::*;
        let tokens = vec![
            token(
                "solana-usdc",
                Solana,
                &[(Solana, "UsdcMint", 6)],
            ),
            token(
                "ethereum-usdc",
                Ethereum,
                &[(Ethereum, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6), (Solana, "EthUsdcMint", 6)],
            ),
            token(
                "bnb-busd",
                Bnb,
                &[(Bnb, "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56", 18), (Solana, "BnbBusdMint", 8)],
            ),
            token(
                "solana-hub-lp",
                Solana,
                &[(Solana, "HubLpMint", 8), (Ethereum, "0x00000000000000000000000000000000000000aa", 8)],
            ),
            token(
                "avalanche-usdc",
                Avalanche,
                &[(Avalanche, "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E", 6), (Solana, "AvaxUsdcMint", 6)],
            ),
            token(
                "solana-avalanche-lp",
                Solana,
                &[(Solana, "AvaxLpMint", 8)],
            ),
            token(
                "polygon-usdc",
                Polygon,
                &[(Polygon, "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174", 6), (Solana, "PolyUsdcMint", 6)],
            ),
            token(
                "solana-polygon-lp",
                Solana,
                &[(Solana, "PolyLpMint", 8)],
            ),
        ];
        let pools = vec![
            pool(
                "hub",
                "solana-hub-lp",
                &["solana-usdc", "ethereum-usdc", "bnb-busd"],
                true,
            ),
            pool(
                "meta-avalanche",
                "solana-avalanche-lp",
                &["avalanche-usdc", "solana-hub-lp"],
                false,
            ),
            pool(
                "meta-polygon",
                "solana-polygon-lp",
                &["polygon-usdc", "solana-hub-lp"],
                false,
            ),
        ];
        let bridges = vec![
            BridgeSpec {
                ecosystem: Solana,
                core_bridge: "SolCoreBridge".to_string(),
                token_bridge: "SolTokenBridge".to_string(),
            },
            BridgeSpec {
                ecosystem: Ethereum,
                core_bridge: "0x98f3c9e6E3fAce36bAAd05FE09d375Ef1464288B".to_string(),
                token_bridge: "0x3ee18B2214AFF97000D974cf647E7C347E8fa585".to_string(),
            },
            BridgeSpec {
                ecosystem: Bnb,
                core_bridge: "0x98f3c9e6E3fAce36bAAd05FE09d375Ef1464288B".to_string(),
                token_bridge: "0xB6F6D86a8f9879A9c87f643768d9efc38c1Da6E7".to_string(),
            },
            BridgeSpec {
                ecosystem: Avalanche,
                core_bridge: "0x54a8e5f9c4CbA08F9943965859F6c34eAF03E26c".to_string(),
                token_bridge: "0x0e082F06FF657D94310cB8cE8B0D9a04541d8052".to_string(),
            },
            BridgeSpec {
                ecosystem: Polygon,
                core_bridge: "0x7A4B5a56256163F07b2C80A7cA55aBE66c4ec4d7".to_string(),
                token_bridge: "0x5a58505a96D1dbf8dF91cB21B54419FC36e93fdE".to_string(),
            },
        ];
        Config {
            env: Env::Local,
            tokens,
            pools,
            bridges,
            token_account_program: "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_config_is_valid() {
        let config = fixtures::config();
        config.validate().unwrap();
        assert_eq!(config.hub_pool().unwrap().id, "hub");
    }

    #[test]
    fn test_pool_tokens_resolves_in_index_order() {
        let config = fixtures::config();
        let tokens = config.pool_tokens("meta-avalanche").unwrap();
        let ids: Vec<&str> = tokens.tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["avalanche-usdc", "solana-hub-lp"]);
        assert_eq!(tokens.lp_token.id, "solana-avalanche-lp");
    }

    #[test]
    fn test_lookup_failures() {
        let config = fixtures::config();
        assert!(matches!(config.token("nope"), Err(ModelError::UnknownToken(_))));
        assert!(matches!(config.pool("nope"), Err(ModelError::UnknownPool(_))));
        assert!(matches!(
            config.bridge(EcosystemId::Karura),
            Err(ModelError::UnknownBridge(EcosystemId::Karura))
        ));
        assert!(matches!(
            config.pool("hub").unwrap().token_index("avalanche-usdc"),
            Err(ModelError::TokenNotInPool { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_settlement_details() {
        let mut config = fixtures::config();
        let mut avax = (*config.tokens[4]).clone();
        avax.details.remove(&EcosystemId::Solana);
        config.tokens[4] = Arc::new(avax);
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pool_params() {
        let mut config = fixtures::config();
        config.pools[0].lp_fee = Decimal::ONE;
        assert!(matches!(config.validate(), Err(ModelError::PoolMath(_))));
    }
}
