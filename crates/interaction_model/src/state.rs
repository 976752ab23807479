//! Progress of one interaction through the cross-chain pipeline
//!
//! ```text
//! RequiredAccounts → InboundTransfers → PoolOperations → OutboundTransfers → Done
//! ```
//!
//! Each group is complete when every member's terminal tx id is set (or the
//! account already existed). The state is only changed through
//! [`crate::transition::apply`].

use pool_math::PoolMath;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::amount::Amount;
use crate::config::{Config, TokenSpec};
use crate::ecosystem::EcosystemId;
use crate::interaction::Interaction;
use crate::operation::OperationSpec;
use crate::route;
use crate::{AmountError, ModelError, Result};

// ============================================================================
// Sub-states
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountState {
    pub is_existing_account: bool,
    pub tx_id: Option<String>,
}

impl TokenAccountState {
    pub fn is_complete(&self) -> bool {
        self.is_existing_account || self.tx_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundTxIds {
    /// Approval and lock on the source chain (EVM needs two transactions)
    pub approve_and_transfer: Vec<String>,
    /// Signature verification and VAA posting on the settlement chain
    pub post_vaa: Vec<String>,
    pub claim: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundTransferState {
    pub token: Arc<TokenSpec>,
    pub from_ecosystem: EcosystemId,
    pub value: Amount,
    pub signature_set_address: Option<String>,
    pub tx_ids: InboundTxIds,
}

impl InboundTransferState {
    pub fn is_complete(&self) -> bool {
        self.value.is_zero() || self.tx_ids.claim.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolOperationState {
    pub operation: OperationSpec,
    pub tx_id: Option<String>,
}

impl PoolOperationState {
    pub fn is_complete(&self) -> bool {
        self.tx_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundTxIds {
    pub transfer: Option<String>,
    pub claim: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTransferState {
    pub token: Arc<TokenSpec>,
    pub to_ecosystem: EcosystemId,
    /// Unknown until the pool operations confirm
    pub value: Option<Amount>,
    pub tx_ids: OutboundTxIds,
}

impl OutboundTransferState {
    pub fn is_complete(&self) -> bool {
        self.tx_ids.claim.is_some() || self.value.as_ref().map_or(false, Amount::is_zero)
    }
}

// ============================================================================
// Stage, status and actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    RequiredAccounts,
    InboundTransfers,
    PoolOperations,
    OutboundTransfers,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RequiredAccounts => "required accounts",
            Stage::InboundTransfers => "inbound transfers",
            Stage::PoolOperations => "pool operations",
            Stage::OutboundTransfers => "outbound transfers",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Incomplete,
    Completed,
    Error,
}

/// The next transaction the interaction needs, and the ecosystem whose
/// wallet must sign it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredAction {
    CreateTokenAccount {
        mint: String,
        ecosystem: EcosystemId,
    },
    ApproveAndTransfer {
        transfer_index: usize,
        token_id: String,
        ecosystem: EcosystemId,
    },
    PostVaa {
        transfer_index: usize,
        token_id: String,
        ecosystem: EcosystemId,
    },
    ClaimInbound {
        transfer_index: usize,
        token_id: String,
        ecosystem: EcosystemId,
    },
    PoolOperation {
        operation_index: usize,
        ecosystem: EcosystemId,
    },
    TransferOut {
        transfer_index: usize,
        token_id: String,
        ecosystem: EcosystemId,
    },
    ClaimOutbound {
        transfer_index: usize,
        token_id: String,
        ecosystem: EcosystemId,
    },
}

impl RequiredAction {
    /// Ecosystem whose wallet signs the action
    pub fn ecosystem(&self) -> EcosystemId {
        match self {
            RequiredAction::CreateTokenAccount { ecosystem, .. }
            | RequiredAction::ApproveAndTransfer { ecosystem, .. }
            | RequiredAction::PostVaa { ecosystem, .. }
            | RequiredAction::ClaimInbound { ecosystem, .. }
            | RequiredAction::PoolOperation { ecosystem, .. }
            | RequiredAction::TransferOut { ecosystem, .. }
            | RequiredAction::ClaimOutbound { ecosystem, .. } => *ecosystem,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            RequiredAction::CreateTokenAccount { .. } => Stage::RequiredAccounts,
            RequiredAction::ApproveAndTransfer { .. }
            | RequiredAction::PostVaa { .. }
            | RequiredAction::ClaimInbound { .. } => Stage::InboundTransfers,
            RequiredAction::PoolOperation { .. } => Stage::PoolOperations,
            RequiredAction::TransferOut { .. } | RequiredAction::ClaimOutbound { .. } => {
                Stage::OutboundTransfers
            }
        }
    }
}

impl fmt::Display for RequiredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredAction::CreateTokenAccount { mint, ecosystem } => {
                write!(f, "create token account for {mint} on {ecosystem}")
            }
            RequiredAction::ApproveAndTransfer {
                token_id, ecosystem, ..
            } => write!(f, "approve and transfer {token_id} on {ecosystem}"),
            RequiredAction::PostVaa {
                token_id, ecosystem, ..
            } => write!(f, "post attestation for {token_id} on {ecosystem}"),
            RequiredAction::ClaimInbound {
                token_id, ecosystem, ..
            } => write!(f, "claim {token_id} on {ecosystem}"),
            RequiredAction::PoolOperation {
                operation_index,
                ecosystem,
            } => write!(f, "pool operation #{operation_index} on {ecosystem}"),
            RequiredAction::TransferOut {
                token_id, ecosystem, ..
            } => write!(f, "transfer {token_id} out of {ecosystem}"),
            RequiredAction::ClaimOutbound {
                token_id, ecosystem, ..
            } => write!(f, "claim {token_id} on {ecosystem}"),
        }
    }
}

// ============================================================================
// Interaction state
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionState {
    pub interaction: Interaction,
    pub settlement_ecosystem: EcosystemId,
    /// Keyed by mint address on the settlement ecosystem
    pub required_token_accounts: BTreeMap<String, TokenAccountState>,
    pub inbound_transfers: Vec<InboundTransferState>,
    pub pool_operations: Vec<PoolOperationState>,
    pub outbound_transfers: Vec<OutboundTransferState>,
    pub error: Option<String>,
}

impl InteractionState {
    /// Initial state of `interaction`, before any transaction
    ///
    /// # Arguments
    /// * `config` - Token and pool configuration
    /// * `pool_maths` - Current math of the required pools, in route order
    /// * `interaction` - The interaction to track
    /// * `existing_accounts` - Mints the settlement wallet already holds accounts for
    pub fn create(
        config: &Config,
        pool_maths: &[PoolMath],
        interaction: &Interaction,
        existing_accounts: &BTreeSet<String>,
    ) -> Result<Self> {
        let settlement = interaction.spec.settlement_ecosystem(config)?;
        let pools = route::required_pools(config, &interaction.spec)?;

        let mut required_token_accounts = BTreeMap::new();
        for token in route::required_tokens(config, &pools, &interaction.spec)? {
            let mint = token
                .address_on(settlement)
                .ok_or_else(|| AmountError::MissingDetails {
                    token: token.id.clone(),
                    ecosystem: settlement,
                })?
                .to_string();
            let is_existing_account = existing_accounts.contains(&mint);
            required_token_accounts.insert(
                mint,
                TokenAccountState {
                    is_existing_account,
                    tx_id: None,
                },
            );
        }

        let inbound_transfers = interaction
            .spec
            .inbound_plans(settlement)
            .into_iter()
            .map(|plan| {
                let token_id = plan.amount.token_id().to_string();
                let signature_set_address = interaction
                    .signature_sets
                    .address(&token_id)
                    .ok_or(ModelError::MissingSignatureSet(token_id))?;
                Ok(InboundTransferState {
                    token: plan.amount.token().clone(),
                    from_ecosystem: plan.from_ecosystem,
                    value: plan.amount,
                    signature_set_address: Some(signature_set_address),
                    tx_ids: InboundTxIds::default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pool_operations = route::create_operation_specs(config, &pools, pool_maths, interaction)?
            .into_iter()
            .map(|operation| PoolOperationState {
                operation,
                tx_id: None,
            })
            .collect();

        let outbound_transfers = interaction
            .spec
            .outbound_plans(settlement)
            .into_iter()
            .map(|plan| OutboundTransferState {
                token: plan.token,
                to_ecosystem: plan.to_ecosystem,
                value: plan.value,
                tx_ids: OutboundTxIds::default(),
            })
            .collect();

        Ok(Self {
            interaction: interaction.clone(),
            settlement_ecosystem: settlement,
            required_token_accounts,
            inbound_transfers,
            pool_operations,
            outbound_transfers,
            error: None,
        })
    }

    pub fn is_required_accounts_complete(&self) -> bool {
        self.required_token_accounts.values().all(TokenAccountState::is_complete)
    }

    pub fn is_inbound_complete(&self) -> bool {
        self.inbound_transfers.iter().all(InboundTransferState::is_complete)
    }

    pub fn is_pool_operations_complete(&self) -> bool {
        self.pool_operations.iter().all(PoolOperationState::is_complete)
    }

    pub fn is_outbound_complete(&self) -> bool {
        self.outbound_transfers.iter().all(OutboundTransferState::is_complete)
    }

    pub fn is_complete(&self) -> bool {
        self.is_required_accounts_complete()
            && self.is_inbound_complete()
            && self.is_pool_operations_complete()
            && self.is_outbound_complete()
    }

    /// First incomplete group in pipeline order
    pub fn stage(&self) -> Stage {
        if !self.is_required_accounts_complete() {
            Stage::RequiredAccounts
        } else if !self.is_inbound_complete() {
            Stage::InboundTransfers
        } else if !self.is_pool_operations_complete() {
            Stage::PoolOperations
        } else if !self.is_outbound_complete() {
            Stage::OutboundTransfers
        } else {
            Stage::Done
        }
    }

    pub fn status(&self) -> Status {
        if self.is_complete() {
            Status::Completed
        } else if self.error.is_some() {
            Status::Error
        } else {
            Status::Incomplete
        }
    }

    /// The wallet address the settlement ecosystem signs with
    pub fn settlement_wallet(&self) -> Option<&str> {
        self.interaction.wallet(self.settlement_ecosystem)
    }
}

/// The first incomplete item in pipeline order
///
/// Pure: repeated calls on the same state give the same answer. Later tx ids
/// that happen to be set never cause an earlier incomplete item to be skipped.
pub fn next_required_action(state: &InteractionState) -> Option<RequiredAction> {
    let settlement = state.settlement_ecosystem;

    if let Some((mint, _)) = state
        .required_token_accounts
        .iter()
        .find(|(_, account)| !account.is_complete())
    {
        return Some(RequiredAction::CreateTokenAccount {
            mint: mint.clone(),
            ecosystem: settlement,
        });
    }

    if let Some((transfer_index, transfer)) = state
        .inbound_transfers
        .iter()
        .enumerate()
        .find(|(_, t)| !t.is_complete())
    {
        let token_id = transfer.token.id.clone();
        return Some(if transfer.tx_ids.approve_and_transfer.is_empty() {
            RequiredAction::ApproveAndTransfer {
                transfer_index,
                token_id,
                ecosystem: transfer.from_ecosystem,
            }
        } else if transfer.tx_ids.post_vaa.is_empty() {
            RequiredAction::PostVaa {
                transfer_index,
                token_id,
                ecosystem: settlement,
            }
        } else {
            RequiredAction::ClaimInbound {
                transfer_index,
                token_id,
                ecosystem: settlement,
            }
        });
    }

    if let Some(operation_index) = state.pool_operations.iter().position(|op| !op.is_complete()) {
        return Some(RequiredAction::PoolOperation {
            operation_index,
            ecosystem: settlement,
        });
    }

    state
        .outbound_transfers
        .iter()
        .enumerate()
        .find(|(_, t)| !t.is_complete())
        .map(|(transfer_index, transfer)| {
            let token_id = transfer.token.id.clone();
            if transfer.tx_ids.transfer.is_none() {
                RequiredAction::TransferOut {
                    transfer_index,
                    token_id,
                    ecosystem: settlement,
                }
            } else {
                RequiredAction::ClaimOutbound {
                    transfer_index,
                    token_id,
                    ecosystem: transfer.to_ecosystem,
                }
            }
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::fixtures;
    use crate::interaction::InteractionSpec;
    use pool_math::Decimal;
    use std::collections::BTreeMap;

    pub(crate) fn amount(config: &Config, token: &str, value: Decimal) -> Amount {
        Amount::from_human(config.token(token).unwrap().clone(), value)
    }

    pub(crate) fn wallets() -> BTreeMap<EcosystemId, String> {
        BTreeMap::from([
            (EcosystemId::Solana, "SolWallet".to_string()),
            (EcosystemId::Ethereum, "0xEthWallet".to_string()),
            (EcosystemId::Bnb, "0xBnbWallet".to_string()),
            (EcosystemId::Avalanche, "0xAvaxWallet".to_string()),
            (EcosystemId::Polygon, "0xPolyWallet".to_string()),
        ])
    }

    pub(crate) fn pool_maths(config: &Config, spec: &InteractionSpec) -> Vec<PoolMath> {
        route::required_pools(config, spec)
            .unwrap()
            .iter()
            .map(|pool| {
                let balances = vec![Decimal::from(1_000_000); pool.tokens.len()];
                PoolMath::new(balances, pool.params(), None).unwrap()
            })
            .collect()
    }

    /// Ethereum USDC to Avalanche USDC: one inbound transfer, add-then-swap,
    /// one outbound transfer
    pub(crate) fn cross_chain_swap() -> (Config, InteractionState) {
        let config = fixtures::config();
        let spec = InteractionSpec::Swap {
            exact_input_amount: amount(&config, "ethereum-usdc", Decimal::from(100)),
            minimum_output_amount: amount(&config, "avalanche-usdc", Decimal::from(99)),
        };
        let interaction = Interaction::new(&config, spec.clone(), &wallets(), 1_650_000_000_000).unwrap();
        let existing = BTreeSet::from(["EthUsdcMint".to_string()]);
        let state =
            InteractionState::create(&config, &pool_maths(&config, &spec), &interaction, &existing).unwrap();
        (config, state)
    }
}
