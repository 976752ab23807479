//! Interaction persistence and resume
//!
//! Interactions are stored per `(env, account)` as a JSON array, newest
//! first, capped at [`MAX_STORED_INTERACTIONS`]. Signature-set private keys
//! are never stored; only their public keys survive, as previous addresses,
//! so that history scans can still match attestations posted before a reload.

use pool_math::{Decimal, PoolMath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Mutex;

use crate::amount::Amount;
use crate::config::Config;
use crate::ecosystem::{EcosystemId, Env};
use crate::history::{self, TxRecord};
use crate::interaction::{Interaction, InteractionId, InteractionSpec};
use crate::signature_set::SignatureSets;
use crate::state::InteractionState;
use crate::{AmountError, ModelError};

/// Bumped whenever the stored layout changes; older records are dropped
pub const SCHEMA_VERSION: u32 = 1;

pub const MAX_STORED_INTERACTIONS: usize = 10;

pub fn storage_key(env: Env, account: &str) -> String {
    format!("interactions:{env}:{account}")
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// String key-value storage
pub trait InteractionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn invalidate(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InteractionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed stored interaction: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema version {0:?}")]
    Version(Option<u64>),
    #[error("interaction belongs to {0}")]
    EnvMismatch(Env),
    #[error(transparent)]
    Model(#[from] ModelError),
}

// ============================================================================
// Stored layout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAmount {
    pub token_id: String,
    /// Human value as a decimal string
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum StoredSpec {
    #[serde(rename_all = "camelCase")]
    Swap {
        exact_input_amount: StoredAmount,
        minimum_output_amount: StoredAmount,
    },
    #[serde(rename_all = "camelCase")]
    Add {
        pool_id: String,
        input_amounts: Vec<StoredAmount>,
        minimum_mint_amount: StoredAmount,
        lp_token_target_ecosystem: EcosystemId,
    },
    #[serde(rename_all = "camelCase")]
    RemoveUniform {
        pool_id: String,
        exact_burn_amount: StoredAmount,
        minimum_output_amounts: Vec<StoredAmount>,
        lp_token_source_ecosystem: EcosystemId,
    },
    #[serde(rename_all = "camelCase")]
    RemoveExactBurn {
        pool_id: String,
        exact_burn_amount: StoredAmount,
        minimum_output_amount: StoredAmount,
        lp_token_source_ecosystem: EcosystemId,
    },
    #[serde(rename_all = "camelCase")]
    RemoveExactOutput {
        pool_id: String,
        maximum_burn_amount: StoredAmount,
        exact_output_amounts: Vec<StoredAmount>,
        lp_token_source_ecosystem: EcosystemId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredInteraction {
    pub version: u32,
    pub id: InteractionId,
    pub env: Env,
    pub submitted_at: i64,
    pub pool_ids: Vec<String>,
    pub connected_wallets: BTreeMap<EcosystemId, Option<String>>,
    #[serde(default)]
    pub previous_signature_set_addresses: BTreeMap<String, Vec<String>>,
    #[serde(flatten)]
    pub spec: StoredSpec,
}

fn store_amount(amount: &Amount) -> StoredAmount {
    StoredAmount {
        token_id: amount.token_id().to_string(),
        value: amount.value().to_string(),
    }
}

fn store_amounts(amounts: &[Amount]) -> Vec<StoredAmount> {
    amounts.iter().map(store_amount).collect()
}

fn restore_amount(config: &Config, stored: &StoredAmount) -> Result<Amount, ModelError> {
    let token = config.token(&stored.token_id)?.clone();
    let value = Decimal::from_str(&stored.value).map_err(|_| AmountError::Parse(stored.value.clone()))?;
    Ok(Amount::from_human(token, value))
}

fn restore_amounts(config: &Config, stored: &[StoredAmount]) -> Result<Vec<Amount>, ModelError> {
    stored.iter().map(|a| restore_amount(config, a)).collect()
}

impl StoredSpec {
    fn from_spec(spec: &InteractionSpec) -> Self {
        match spec {
            InteractionSpec::Swap {
                exact_input_amount,
                minimum_output_amount,
            } => StoredSpec::Swap {
                exact_input_amount: store_amount(exact_input_amount),
                minimum_output_amount: store_amount(minimum_output_amount),
            },
            InteractionSpec::Add {
                pool_id,
                input_amounts,
                minimum_mint_amount,
                lp_token_target_ecosystem,
            } => StoredSpec::Add {
                pool_id: pool_id.clone(),
                input_amounts: store_amounts(input_amounts),
                minimum_mint_amount: store_amount(minimum_mint_amount),
                lp_token_target_ecosystem: *lp_token_target_ecosystem,
            },
            InteractionSpec::RemoveUniform {
                pool_id,
                exact_burn_amount,
                minimum_output_amounts,
                lp_token_source_ecosystem,
            } => StoredSpec::RemoveUniform {
                pool_id: pool_id.clone(),
                exact_burn_amount: store_amount(exact_burn_amount),
                minimum_output_amounts: store_amounts(minimum_output_amounts),
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
            InteractionSpec::RemoveExactBurn {
                pool_id,
                exact_burn_amount,
                minimum_output_amount,
                lp_token_source_ecosystem,
            } => StoredSpec::RemoveExactBurn {
                pool_id: pool_id.clone(),
                exact_burn_amount: store_amount(exact_burn_amount),
                minimum_output_amount: store_amount(minimum_output_amount),
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
            InteractionSpec::RemoveExactOutput {
                pool_id,
                maximum_burn_amount,
                exact_output_amounts,
                lp_token_source_ecosystem,
            } => StoredSpec::RemoveExactOutput {
                pool_id: pool_id.clone(),
                maximum_burn_amount: store_amount(maximum_burn_amount),
                exact_output_amounts: store_amounts(exact_output_amounts),
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
        }
    }

    fn to_spec(&self, config: &Config) -> Result<InteractionSpec, ModelError> {
        Ok(match self {
            StoredSpec::Swap {
                exact_input_amount,
                minimum_output_amount,
            } => InteractionSpec::Swap {
                exact_input_amount: restore_amount(config, exact_input_amount)?,
                minimum_output_amount: restore_amount(config, minimum_output_amount)?,
            },
            StoredSpec::Add {
                pool_id,
                input_amounts,
                minimum_mint_amount,
                lp_token_target_ecosystem,
            } => InteractionSpec::Add {
                pool_id: pool_id.clone(),
                input_amounts: restore_amounts(config, input_amounts)?,
                minimum_mint_amount: restore_amount(config, minimum_mint_amount)?,
                lp_token_target_ecosystem: *lp_token_target_ecosystem,
            },
            StoredSpec::RemoveUniform {
                pool_id,
                exact_burn_amount,
                minimum_output_amounts,
                lp_token_source_ecosystem,
            } => InteractionSpec::RemoveUniform {
                pool_id: pool_id.clone(),
                exact_burn_amount: restore_amount(config, exact_burn_amount)?,
                minimum_output_amounts: restore_amounts(config, minimum_output_amounts)?,
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
            StoredSpec::RemoveExactBurn {
                pool_id,
                exact_burn_amount,
                minimum_output_amount,
                lp_token_source_ecosystem,
            } => InteractionSpec::RemoveExactBurn {
                pool_id: pool_id.clone(),
                exact_burn_amount: restore_amount(config, exact_burn_amount)?,
                minimum_output_amount: restore_amount(config, minimum_output_amount)?,
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
            StoredSpec::RemoveExactOutput {
                pool_id,
                maximum_burn_amount,
                exact_output_amounts,
                lp_token_source_ecosystem,
            } => InteractionSpec::RemoveExactOutput {
                pool_id: pool_id.clone(),
                maximum_burn_amount: restore_amount(config, maximum_burn_amount)?,
                exact_output_amounts: restore_amounts(config, exact_output_amounts)?,
                lp_token_source_ecosystem: *lp_token_source_ecosystem,
            },
        })
    }
}

impl StoredInteraction {
    /// Current signature-set keys are folded into the previous addresses
    pub fn from_interaction(interaction: &Interaction) -> Self {
        Self {
            version: SCHEMA_VERSION,
            id: interaction.id.clone(),
            env: interaction.env,
            submitted_at: interaction.submitted_at,
            pool_ids: interaction.pool_ids.clone(),
            connected_wallets: interaction.connected_wallets.clone(),
            previous_signature_set_addresses: interaction.signature_sets.folded_addresses(),
            spec: StoredSpec::from_spec(&interaction.spec),
        }
    }

    /// Rebuild the interaction. It carries no signature-set keypairs until
    /// [`reload_state`] issues fresh ones.
    pub fn to_interaction(&self, config: &Config) -> Result<Interaction, ModelError> {
        Ok(Interaction {
            id: self.id.clone(),
            spec: self.spec.to_spec(config)?,
            pool_ids: self.pool_ids.clone(),
            env: self.env,
            submitted_at: self.submitted_at,
            connected_wallets: self.connected_wallets.clone(),
            signature_sets: SignatureSets::default()
                .with_previous_addresses(self.previous_signature_set_addresses.clone()),
        })
    }
}

// ============================================================================
// Load / store
// ============================================================================

fn load_records(store: &dyn InteractionStore, key: &str) -> Result<Vec<serde_json::Value>, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
        Ok(records) => Ok(records),
        Err(err) => {
            log::warn!("discarding unreadable interaction list {key}: {err}");
            Ok(Vec::new())
        }
    }
}

fn parse_record(config: &Config, record: serde_json::Value) -> Result<Interaction, PersistError> {
    let version = record.get("version").and_then(serde_json::Value::as_u64);
    if version != Some(u64::from(SCHEMA_VERSION)) {
        return Err(PersistError::Version(version));
    }
    let stored: StoredInteraction = serde_json::from_value(record)?;
    if stored.env != config.env {
        return Err(PersistError::EnvMismatch(stored.env));
    }
    Ok(stored.to_interaction(config)?)
}

fn parse_records(config: &Config, records: Vec<serde_json::Value>) -> Vec<Interaction> {
    let mut interactions: Vec<Interaction> = records
        .into_iter()
        .filter_map(|record| match parse_record(config, record) {
            Ok(interaction) => Some(interaction),
            Err(err) => {
                log::warn!("dropping stored interaction: {err}");
                None
            }
        })
        .collect();
    interactions.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    interactions
}

/// Stored interactions of `account`, newest first
///
/// Records with another schema version or that no longer resolve against
/// `config` are dropped with a warning.
pub fn load_interactions(
    store: &dyn InteractionStore,
    config: &Config,
    account: &str,
) -> Result<Vec<Interaction>, PersistError> {
    let key = storage_key(config.env, account);
    Ok(parse_records(config, load_records(store, &key)?))
}

fn save(
    store: &dyn InteractionStore,
    key: &str,
    interactions: &[StoredInteraction],
) -> Result<(), PersistError> {
    let raw = serde_json::to_string(interactions)?;
    store.set(key, &raw)?;
    Ok(())
}

/// Insert or update `interaction`, keeping the newest
/// [`MAX_STORED_INTERACTIONS`]
pub fn store_interaction(
    store: &dyn InteractionStore,
    config: &Config,
    account: &str,
    interaction: &Interaction,
) -> Result<(), PersistError> {
    let key = storage_key(config.env, account);
    let mut stored: Vec<StoredInteraction> = load_interactions(store, config, account)?
        .iter()
        .map(StoredInteraction::from_interaction)
        .collect();

    let record = StoredInteraction::from_interaction(interaction);
    match stored.iter_mut().find(|s| s.id == record.id) {
        Some(existing) => *existing = record,
        None => stored.insert(0, record),
    }
    stored.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    stored.truncate(MAX_STORED_INTERACTIONS);
    log::debug!("storing {} interactions under {key}", stored.len());
    save(store, &key, &stored)
}

/// Remove one interaction; returns whether it was stored
pub fn forget_interaction(
    store: &dyn InteractionStore,
    config: &Config,
    account: &str,
    id: &InteractionId,
) -> Result<bool, PersistError> {
    let key = storage_key(config.env, account);
    let interactions = load_interactions(store, config, account)?;
    let before = interactions.len();
    let kept: Vec<StoredInteraction> = interactions
        .iter()
        .filter(|i| &i.id != id)
        .map(StoredInteraction::from_interaction)
        .collect();
    if kept.len() == before {
        return Ok(false);
    }
    if kept.is_empty() {
        store.invalidate(&key)?;
    } else {
        save(store, &key, &kept)?;
    }
    Ok(true)
}

/// Rebuild the state of a stored interaction from chain history
///
/// Issues fresh signature-set keys (any current ones move to the previous
/// addresses), creates the initial state and replays `txs` over it.
pub fn reload_state(
    config: &Config,
    pool_maths: &[PoolMath],
    interaction: &Interaction,
    existing_accounts: &BTreeSet<String>,
    txs: &[TxRecord],
) -> Result<InteractionState, ModelError> {
    let settlement = interaction.spec.settlement_ecosystem(config)?;
    let inbound_tokens: Vec<String> = interaction
        .spec
        .inbound_plans(settlement)
        .iter()
        .map(|plan| plan.amount.token_id().to_string())
        .collect();

    let mut interaction = interaction.clone();
    interaction.signature_sets = interaction
        .signature_sets
        .regenerate()
        .with_keys_for(inbound_tokens);

    let initial = InteractionState::create(config, pool_maths, &interaction, existing_accounts)?;
    Ok(history::replay(config, &initial, txs))
}
