//! User interactions and their pure derivations
//!
//! An [`Interaction`] is created once at submission time and is the unit that
//! gets persisted. Everything else (operations, state) is derived from it.

use pool_math::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::amount::Amount;
use crate::config::{Config, TokenSpec};
use crate::ecosystem::{EcosystemId, Env};
use crate::route;
use crate::signature_set::SignatureSets;
use crate::{ModelError, Result};

/// Number of random bytes in an interaction id
pub const INTERACTION_ID_LENGTH: usize = 16;

/// Hex length of an interaction id
pub const INTERACTION_ID_LENGTH_HEX: usize = INTERACTION_ID_LENGTH * 2;

const MEMO_LOG_PREFIX: &str = "Program log: Memo (len 32): \"";

// ============================================================================
// Interaction id
// ============================================================================

/// Correlation tag embedded as an on-chain memo in every transaction of an
/// interaction
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionId(String);

impl InteractionId {
    pub fn generate() -> Self {
        let bytes: [u8; INTERACTION_ID_LENGTH] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn parse(value: &str) -> Result<Self> {
        let valid = value.len() == INTERACTION_ID_LENGTH_HEX
            && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(ModelError::InvalidInteractionId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interaction id from a signature memo. Some RPC nodes return memos as
/// `[32] <memo>`; the length prefix is stripped.
pub fn memo_interaction_id(memo: &str) -> Option<InteractionId> {
    let memo = memo.trim();
    let stripped = memo
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .filter(|(len, tail)| {
            !len.is_empty()
                && len.bytes().all(|b| b.is_ascii_digit())
                && tail.starts_with(char::is_whitespace)
        })
        .map(|(_, tail)| tail.trim_start())
        .unwrap_or(memo);
    InteractionId::parse(stripped).ok()
}

/// Interaction id from the memo program's log line
pub fn interaction_id_from_logs<S: AsRef<str>>(logs: &[S]) -> Option<InteractionId> {
    logs.iter().find_map(|line| {
        line.as_ref()
            .strip_prefix(MEMO_LOG_PREFIX)
            .and_then(|rest| rest.strip_suffix('"'))
            .and_then(|id| InteractionId::parse(id).ok())
    })
}

/// Interaction id appended to EVM calldata
pub fn interaction_id_from_evm_data(data: &str) -> Option<InteractionId> {
    let hex = data.strip_prefix("0x").unwrap_or(data);
    if hex.len() < INTERACTION_ID_LENGTH_HEX || !hex.is_ascii() {
        return None;
    }
    InteractionId::parse(&hex[hex.len() - INTERACTION_ID_LENGTH_HEX..]).ok()
}

// ============================================================================
// Interaction spec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionKind {
    Swap,
    Add,
    RemoveUniform,
    RemoveExactBurn,
    RemoveExactOutput,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InteractionKind::Swap => "swap",
            InteractionKind::Add => "add",
            InteractionKind::RemoveUniform => "remove-uniform",
            InteractionKind::RemoveExactBurn => "remove-exact-burn",
            InteractionKind::RemoveExactOutput => "remove-exact-output",
        };
        f.write_str(name)
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionSpec {
    Swap {
        exact_input_amount: Amount,
        minimum_output_amount: Amount,
    },
    Add {
        pool_id: String,
        input_amounts: Vec<Amount>,
        minimum_mint_amount: Amount,
        lp_token_target_ecosystem: EcosystemId,
    },
    RemoveUniform {
        pool_id: String,
        exact_burn_amount: Amount,
        minimum_output_amounts: Vec<Amount>,
        lp_token_source_ecosystem: EcosystemId,
    },
    RemoveExactBurn {
        pool_id: String,
        exact_burn_amount: Amount,
        minimum_output_amount: Amount,
        lp_token_source_ecosystem: EcosystemId,
    },
    RemoveExactOutput {
        pool_id: String,
        maximum_burn_amount: Amount,
        exact_output_amounts: Vec<Amount>,
        lp_token_source_ecosystem: EcosystemId,
    },
}

/// A planned transfer into the settlement ecosystem
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPlan {
    pub amount: Amount,
    pub from_ecosystem: EcosystemId,
}

/// A planned transfer out of the settlement ecosystem. The value is unknown
/// until the pool operations confirm, except for exact-output removes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPlan {
    pub token: Arc<TokenSpec>,
    pub to_ecosystem: EcosystemId,
    pub value: Option<Amount>,
}

impl InteractionSpec {
    pub fn kind(&self) -> InteractionKind {
        match self {
            InteractionSpec::Swap { .. } => InteractionKind::Swap,
            InteractionSpec::Add { .. } => InteractionKind::Add,
            InteractionSpec::RemoveUniform { .. } => InteractionKind::RemoveUniform,
            InteractionSpec::RemoveExactBurn { .. } => InteractionKind::RemoveExactBurn,
            InteractionSpec::RemoveExactOutput { .. } => InteractionKind::RemoveExactOutput,
        }
    }

    /// Pool named by add and remove interactions
    pub fn pool_id(&self) -> Option<&str> {
        match self {
            InteractionSpec::Swap { .. } => None,
            InteractionSpec::Add { pool_id, .. }
            | InteractionSpec::RemoveUniform { pool_id, .. }
            | InteractionSpec::RemoveExactBurn { pool_id, .. }
            | InteractionSpec::RemoveExactOutput { pool_id, .. } => Some(pool_id),
        }
    }

    /// Ecosystem where the pool operations execute
    pub fn settlement_ecosystem(&self, config: &Config) -> Result<EcosystemId> {
        let pools = route::required_pools(config, self)?;
        pools
            .first()
            .map(|pool| pool.ecosystem)
            .ok_or_else(|| ModelError::UnknownPool(self.kind().to_string()))
    }

    /// Ecosystems that need a connected wallet: the settlement ecosystem, the
    /// LP source or target ecosystem and the native ecosystems of every
    /// non-zero amount moved in or out.
    pub fn required_ecosystems(&self, config: &Config) -> Result<BTreeSet<EcosystemId>> {
        let settlement = self.settlement_ecosystem(config)?;
        let native_of_non_zero = |amounts: &[Amount]| -> Vec<EcosystemId> {
            amounts
                .iter()
                .filter(|a| !a.is_zero())
                .map(|a| a.token().native_ecosystem)
                .collect()
        };

        let mut ecosystems = BTreeSet::from([settlement]);
        match self {
            InteractionSpec::Swap {
                exact_input_amount,
                minimum_output_amount,
            } => {
                ecosystems.insert(exact_input_amount.token().native_ecosystem);
                ecosystems.insert(minimum_output_amount.token().native_ecosystem);
            }
            InteractionSpec::Add {
                input_amounts,
                lp_token_target_ecosystem,
                ..
            } => {
                ecosystems.insert(*lp_token_target_ecosystem);
                ecosystems.extend(native_of_non_zero(input_amounts));
            }
            InteractionSpec::RemoveUniform {
                minimum_output_amounts,
                lp_token_source_ecosystem,
                ..
            } => {
                ecosystems.insert(*lp_token_source_ecosystem);
                ecosystems.extend(native_of_non_zero(minimum_output_amounts));
            }
            InteractionSpec::RemoveExactBurn {
                minimum_output_amount,
                lp_token_source_ecosystem,
                ..
            } => {
                ecosystems.insert(*lp_token_source_ecosystem);
                ecosystems.insert(minimum_output_amount.token().native_ecosystem);
            }
            InteractionSpec::RemoveExactOutput {
                exact_output_amounts,
                lp_token_source_ecosystem,
                ..
            } => {
                ecosystems.insert(*lp_token_source_ecosystem);
                ecosystems.extend(native_of_non_zero(exact_output_amounts));
            }
        }
        Ok(ecosystems)
    }

    /// Amounts that must be bridged into `settlement` before the pool
    /// operations can run
    pub fn inbound_plans(&self, settlement: EcosystemId) -> Vec<InboundPlan> {
        let bridged = |amount: &Amount, from_ecosystem: EcosystemId| {
            (from_ecosystem != settlement && amount.is_positive()).then(|| InboundPlan {
                amount: amount.clone(),
                from_ecosystem,
            })
        };
        match self {
            InteractionSpec::Swap {
                exact_input_amount, ..
            } => bridged(exact_input_amount, exact_input_amount.token().native_ecosystem)
                .into_iter()
                .collect(),
            InteractionSpec::Add { input_amounts, .. } => input_amounts
                .iter()
                .filter_map(|a| bridged(a, a.token().native_ecosystem))
                .collect(),
            InteractionSpec::RemoveUniform {
                exact_burn_amount: burn,
                lp_token_source_ecosystem,
                ..
            }
            | InteractionSpec::RemoveExactBurn {
                exact_burn_amount: burn,
                lp_token_source_ecosystem,
                ..
            }
            | InteractionSpec::RemoveExactOutput {
                maximum_burn_amount: burn,
                lp_token_source_ecosystem,
                ..
            } => bridged(burn, *lp_token_source_ecosystem).into_iter().collect(),
        }
    }

    /// Tokens that leave `settlement` after the pool operations
    pub fn outbound_plans(&self, settlement: EcosystemId) -> Vec<OutboundPlan> {
        let unknown = |amount: &Amount| {
            let to_ecosystem = amount.token().native_ecosystem;
            (to_ecosystem != settlement).then(|| OutboundPlan {
                token: amount.token().clone(),
                to_ecosystem,
                value: None,
            })
        };
        match self {
            InteractionSpec::Swap {
                minimum_output_amount,
                ..
            }
            | InteractionSpec::RemoveExactBurn {
                minimum_output_amount,
                ..
            } => unknown(minimum_output_amount).into_iter().collect(),
            InteractionSpec::Add {
                minimum_mint_amount,
                lp_token_target_ecosystem,
                ..
            } => (*lp_token_target_ecosystem != settlement)
                .then(|| OutboundPlan {
                    token: minimum_mint_amount.token().clone(),
                    to_ecosystem: *lp_token_target_ecosystem,
                    value: None,
                })
                .into_iter()
                .collect(),
            InteractionSpec::RemoveUniform {
                minimum_output_amounts,
                ..
            } => minimum_output_amounts
                .iter()
                .filter(|a| !a.is_zero())
                .filter_map(unknown)
                .collect(),
            InteractionSpec::RemoveExactOutput {
                exact_output_amounts,
                ..
            } => exact_output_amounts
                .iter()
                .filter(|a| !a.is_zero())
                .filter_map(|a| {
                    unknown(a).map(|plan| OutboundPlan {
                        value: Some(a.clone()),
                        ..plan
                    })
                })
                .collect(),
        }
    }
}

// ============================================================================
// Interaction
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub id: InteractionId,
    pub spec: InteractionSpec,
    pub pool_ids: Vec<String>,
    pub env: Env,
    /// Unix milliseconds
    pub submitted_at: i64,
    /// Wallets connected at submission, keyed for every ecosystem
    pub connected_wallets: BTreeMap<EcosystemId, Option<String>>,
    pub signature_sets: SignatureSets,
}

impl Interaction {
    /// Build a new interaction for `spec`
    ///
    /// # Arguments
    /// * `config` - Token and pool configuration
    /// * `spec` - The user's request
    /// * `wallets` - Currently connected wallet addresses
    /// * `submitted_at` - Unix milliseconds
    ///
    /// # Returns
    /// An interaction with a fresh id and one signature-set keypair per
    /// inbound transfer
    pub fn new(
        config: &Config,
        spec: InteractionSpec,
        wallets: &BTreeMap<EcosystemId, String>,
        submitted_at: i64,
    ) -> Result<Self> {
        let pool_ids = route::required_pools(config, &spec)?
            .iter()
            .map(|p| p.id.clone())
            .collect();
        let required = spec.required_ecosystems(config)?;
        if let Some(missing) = required.iter().find(|e| !wallets.contains_key(*e)) {
            return Err(ModelError::MissingWallet(*missing));
        }
        let connected_wallets = connected_wallets(config, &spec, wallets)?;

        let settlement = spec.settlement_ecosystem(config)?;
        let signature_sets = SignatureSets::generate(
            spec.inbound_plans(settlement)
                .iter()
                .map(|plan| plan.amount.token_id().to_string()),
        );

        let interaction = Self {
            id: InteractionId::generate(),
            spec,
            pool_ids,
            env: config.env,
            submitted_at,
            connected_wallets,
            signature_sets,
        };
        log::debug!(
            "created {} interaction {} over pools {:?}",
            interaction.kind(),
            interaction.id,
            interaction.pool_ids
        );
        Ok(interaction)
    }

    pub fn kind(&self) -> InteractionKind {
        self.spec.kind()
    }

    pub fn wallet(&self, ecosystem: EcosystemId) -> Option<&str> {
        self.connected_wallets.get(&ecosystem).and_then(|w| w.as_deref())
    }
}

/// Wallet addresses restricted to the ecosystems `spec` requires. Every
/// ecosystem is present as a key.
pub fn connected_wallets(
    config: &Config,
    spec: &InteractionSpec,
    wallets: &BTreeMap<EcosystemId, String>,
) -> Result<BTreeMap<EcosystemId, Option<String>>> {
    let required = spec.required_ecosystems(config)?;
    Ok(EcosystemId::ALL
        .into_iter()
        .map(|ecosystem| {
            let address = required
                .contains(&ecosystem)
                .then(|| wallets.get(&ecosystem).cloned())
                .flatten();
            (ecosystem, address)
        })
        .collect())
}

// ============================================================================
// Slippage
// ============================================================================

pub fn is_valid_slippage_fraction(fraction: Decimal) -> bool {
    fraction >= Decimal::ZERO && fraction < Decimal::ONE
}

/// `amount * (1 - slippage)`
pub fn minimum_output_with_slippage(amount: &Amount, slippage: Decimal) -> Result<Amount> {
    if !is_valid_slippage_fraction(slippage) {
        return Err(ModelError::InvalidConfig(format!(
            "slippage fraction {slippage} outside [0, 1)"
        )));
    }
    Ok(amount.mul_scalar(Decimal::ONE - slippage)?)
}
