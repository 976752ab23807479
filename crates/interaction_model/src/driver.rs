//! Interaction driver
//!
//! Turns the next required action into a transaction request, hands it to
//! the chain client of the signing ecosystem and records the outcome through
//! [`apply`]. Before every step the driver rescans chain history, so a step
//! whose transaction already landed (memo match) is never submitted twice.

use async_trait::async_trait;
use solana_sdk::signature::Keypair;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{Config, TokenSpec};
use crate::ecosystem::EcosystemId;
use crate::history::{self, TxRecord};
use crate::instruction;
use crate::interaction::InteractionId;
use crate::state::{next_required_action, InteractionState, RequiredAction};
use crate::transition::{apply, Event, TransitionError};
use crate::{AmountError, ModelError};

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The wallet or the chain refused the transaction
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Signed attestation of a bridge transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub emitter_ecosystem: EcosystemId,
    pub sequence: u64,
    pub vaa: Vec<u8>,
}

/// What a transaction must do. Amounts are atomic units on the signing
/// ecosystem.
#[derive(Debug, Clone)]
pub enum TxKind {
    CreateTokenAccount {
        mint: String,
        owner: String,
        token_program: String,
    },
    ApproveAndTransfer {
        token_bridge: String,
        token_address: String,
        amount: u64,
        target_ecosystem: EcosystemId,
        recipient: String,
    },
    PostVaa {
        core_bridge: String,
        signature_set: Arc<Keypair>,
        attestation: Attestation,
    },
    Redeem {
        token_bridge: String,
        mint: String,
        amount: u64,
        attestation: Attestation,
    },
    PoolInstruction {
        program_id: String,
        pool_address: String,
        token_accounts: Vec<String>,
        data: Vec<u8>,
    },
    TransferOut {
        token_bridge: String,
        mint: String,
        amount: u64,
        target_ecosystem: EcosystemId,
        recipient: String,
    },
    ClaimOutbound {
        token_bridge: String,
        token_address: String,
        amount: u64,
        attestation: Attestation,
    },
}

#[derive(Debug, Clone)]
pub struct TxRequest {
    /// Attached as memo or calldata suffix
    pub interaction_id: InteractionId,
    pub action: RequiredAction,
    pub kind: TxKind,
}

/// One ecosystem's RPC and wallet
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn ecosystem(&self) -> EcosystemId;

    fn wallet_address(&self) -> Option<String>;

    /// Sign, send and confirm `request`
    async fn submit(&self, request: TxRequest) -> std::result::Result<TxRecord, ClientError>;

    /// Confirmed transactions of `address` tagged with `interaction_id`
    async fn history(
        &self,
        address: &str,
        interaction_id: &InteractionId,
    ) -> std::result::Result<Vec<TxRecord>, ClientError>;
}

#[async_trait]
pub trait BridgeService: Send + Sync {
    /// Attestation of the bridge transfer made in `tx_id`, once guardians
    /// have signed it
    async fn attestation(
        &self,
        ecosystem: EcosystemId,
        tx_id: &str,
    ) -> std::result::Result<Option<Attestation>, ClientError>;
}

/// Cooperative cancellation shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no client for {0}")]
    MissingClient(EcosystemId),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<AmountError> for DriverError {
    fn from(err: AmountError) -> Self {
        DriverError::Model(err.into())
    }
}

type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transaction for the action confirmed
    Submitted(RequiredAction),
    /// The action needs a bridge attestation that is not signed yet
    AwaitingAttestation(RequiredAction),
    /// The interaction carries an error; clear it to retry
    Failed(String),
    Done,
    Cancelled,
}

pub struct Driver {
    config: Arc<Config>,
    clients: BTreeMap<EcosystemId, Arc<dyn ChainClient>>,
    bridge: Arc<dyn BridgeService>,
}

impl Driver {
    pub fn new(config: Arc<Config>, bridge: Arc<dyn BridgeService>) -> Self {
        Self {
            config,
            clients: BTreeMap::new(),
            bridge,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(client.ecosystem(), client);
        self
    }

    fn client(&self, ecosystem: EcosystemId) -> Result<&Arc<dyn ChainClient>> {
        self.clients
            .get(&ecosystem)
            .ok_or(DriverError::MissingClient(ecosystem))
    }

    /// Scan the history of every connected wallet and signature-set address,
    /// then replay it over `state`
    ///
    /// Records that did arrive are replayed even when a scan fails; the
    /// failure is then registered as the state's error.
    pub async fn sync(&self, state: &InteractionState) -> Result<InteractionState> {
        let id = &state.interaction.id;
        let mut scans: Vec<(Arc<dyn ChainClient>, String)> = Vec::new();
        for (ecosystem, wallet) in &state.interaction.connected_wallets {
            if let (Some(wallet), Some(client)) = (wallet, self.clients.get(ecosystem)) {
                scans.push((client.clone(), wallet.clone()));
            }
        }
        if let Some(client) = self.clients.get(&state.settlement_ecosystem) {
            for transfer in &state.inbound_transfers {
                for address in state.interaction.signature_sets.known_addresses(&transfer.token.id) {
                    scans.push((client.clone(), address));
                }
            }
        }

        let results = futures::future::join_all(
            scans
                .iter()
                .map(|(client, address)| client.history(address, id)),
        )
        .await;
        let mut txs = Vec::new();
        let mut failure = None;
        for ((_, address), result) in scans.iter().zip(results) {
            match result {
                Ok(records) => txs.extend(records),
                Err(err) => {
                    log::warn!("interaction {}: history of {} unavailable: {}", id, address, err);
                    if failure.is_none() {
                        failure = Some(format!("history of {address}: {err}"));
                    }
                }
            }
        }
        log::debug!("interaction {}: {} history records", id, txs.len());
        let synced = history::replay(&self.config, state, &txs);
        match failure {
            Some(message) => Ok(apply(&synced, &Event::ErrorRegistered { message })?),
            None => Ok(synced),
        }
    }

    /// Sync, then submit the single next required action
    ///
    /// Chain failures are recorded on the state as an error instead of being
    /// returned; only missing collaborators and model errors are `Err`.
    pub async fn step(&self, state: &InteractionState) -> Result<(InteractionState, StepOutcome)> {
        let state = self.sync(state).await?;
        if state.is_complete() {
            return Ok((state, StepOutcome::Done));
        }
        if let Some(message) = &state.error {
            let message = message.clone();
            return Ok((state, StepOutcome::Failed(message)));
        }
        let Some(action) = next_required_action(&state) else {
            return Ok((state, StepOutcome::Done));
        };

        let kind = match self.build_request(&state, &action).await {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                log::info!("interaction {}: waiting for attestation before {}", state.interaction.id, action);
                return Ok((state, StepOutcome::AwaitingAttestation(action)));
            }
            Err(DriverError::Client(err)) => return self.fail(&state, &action, err),
            Err(err) => return Err(err),
        };
        let request = TxRequest {
            interaction_id: state.interaction.id.clone(),
            action: action.clone(),
            kind,
        };

        log::info!("interaction {}: {}", state.interaction.id, action);
        match self.client(action.ecosystem())?.submit(request).await {
            Ok(record) => {
                let event = self.event_for(&state, &action, &record);
                let next = apply(&state, &event)?;
                Ok((next, StepOutcome::Submitted(action)))
            }
            Err(err) => self.fail(&state, &action, err),
        }
    }

    fn fail(
        &self,
        state: &InteractionState,
        action: &RequiredAction,
        err: ClientError,
    ) -> Result<(InteractionState, StepOutcome)> {
        let message = format!("{action}: {err}");
        let next = apply(state, &Event::ErrorRegistered { message: message.clone() })?;
        Ok((next, StepOutcome::Failed(message)))
    }

    /// Step until the interaction completes, fails, waits on an attestation
    /// or `cancel` is raised
    pub async fn run(&self, state: &InteractionState, cancel: &CancelFlag) -> Result<(InteractionState, StepOutcome)> {
        let mut state = state.clone();
        loop {
            if cancel.is_cancelled() {
                log::info!("interaction {}: cancelled", state.interaction.id);
                return Ok((state, StepOutcome::Cancelled));
            }
            let (next, outcome) = self.step(&state).await?;
            state = next;
            if !matches!(outcome, StepOutcome::Submitted(_)) {
                return Ok((state, outcome));
            }
        }
    }

    fn event_for(&self, state: &InteractionState, action: &RequiredAction, record: &TxRecord) -> Event {
        let tx_id = record.tx_id.clone();
        match action {
            RequiredAction::CreateTokenAccount { mint, .. } => Event::TokenAccountCreated {
                mint: mint.clone(),
                tx_id,
            },
            RequiredAction::ApproveAndTransfer { token_id, .. } => Event::InboundLocked {
                token_id: token_id.clone(),
                tx_ids: vec![tx_id],
            },
            RequiredAction::PostVaa { token_id, .. } => Event::VaaPosted {
                token_id: token_id.clone(),
                tx_ids: vec![tx_id],
            },
            RequiredAction::ClaimInbound { token_id, .. } => Event::InboundClaimed {
                token_id: token_id.clone(),
                tx_id,
            },
            RequiredAction::PoolOperation { operation_index, .. } => Event::PoolOperationCompleted {
                operation_index: *operation_index,
                tx_id,
                received: history::received_amounts(&self.config, state, record),
            },
            RequiredAction::TransferOut { token_id, .. } => Event::OutboundTransferred {
                token_id: token_id.clone(),
                tx_id,
            },
            RequiredAction::ClaimOutbound { token_id, .. } => Event::OutboundClaimed {
                token_id: token_id.clone(),
                tx_id,
            },
        }
    }

    fn address_on(token: &TokenSpec, ecosystem: EcosystemId) -> std::result::Result<String, AmountError> {
        token
            .address_on(ecosystem)
            .map(str::to_string)
            .ok_or_else(|| AmountError::MissingDetails {
                token: token.id.clone(),
                ecosystem,
            })
    }

    async fn attestation_of(&self, ecosystem: EcosystemId, tx_id: Option<&String>) -> Result<Option<Attestation>> {
        match tx_id {
            Some(tx_id) => Ok(self.bridge.attestation(ecosystem, tx_id).await?),
            None => Ok(None),
        }
    }

    /// Request for `action`, or `None` while its attestation is unsigned
    async fn build_request(&self, state: &InteractionState, action: &RequiredAction) -> Result<Option<TxKind>> {
        let config = &self.config;
        let settlement = state.settlement_ecosystem;
        let wallet_on = |ecosystem: EcosystemId| {
            state
                .interaction
                .wallet(ecosystem)
                .map(str::to_string)
                .ok_or(ModelError::MissingWallet(ecosystem))
        };

        let kind = match action {
            RequiredAction::CreateTokenAccount { mint, .. } => TxKind::CreateTokenAccount {
                mint: mint.clone(),
                owner: wallet_on(settlement)?,
                token_program: config.token_account_program.clone(),
            },

            RequiredAction::ApproveAndTransfer { transfer_index, .. } => {
                let transfer = &state.inbound_transfers[*transfer_index];
                let source = transfer.from_ecosystem;
                TxKind::ApproveAndTransfer {
                    token_bridge: config.bridge(source)?.token_bridge.clone(),
                    token_address: Self::address_on(&transfer.token, source)?,
                    amount: transfer.value.to_atomic_u64(source)?,
                    target_ecosystem: settlement,
                    recipient: wallet_on(settlement)?,
                }
            }

            RequiredAction::PostVaa {
                transfer_index,
                token_id,
                ..
            } => {
                let transfer = &state.inbound_transfers[*transfer_index];
                let lock = transfer.tx_ids.approve_and_transfer.last();
                let Some(attestation) = self.attestation_of(transfer.from_ecosystem, lock).await? else {
                    return Ok(None);
                };
                let signature_set = state
                    .interaction
                    .signature_sets
                    .keypair(token_id)
                    .ok_or_else(|| ModelError::MissingSignatureSet(token_id.clone()))?;
                TxKind::PostVaa {
                    core_bridge: config.bridge(settlement)?.core_bridge.clone(),
                    signature_set,
                    attestation,
                }
            }

            RequiredAction::ClaimInbound { transfer_index, .. } => {
                let transfer = &state.inbound_transfers[*transfer_index];
                let lock = transfer.tx_ids.approve_and_transfer.last();
                let Some(attestation) = self.attestation_of(transfer.from_ecosystem, lock).await? else {
                    return Ok(None);
                };
                TxKind::Redeem {
                    token_bridge: config.bridge(settlement)?.token_bridge.clone(),
                    mint: Self::address_on(&transfer.token, settlement)?,
                    amount: transfer.value.to_atomic_u64(settlement)?,
                    attestation,
                }
            }

            RequiredAction::PoolOperation { operation_index, .. } => {
                let operation = &state.pool_operations[*operation_index].operation;
                let pool = config.pool(&operation.pool_id)?;
                TxKind::PoolInstruction {
                    program_id: pool.program_id.clone(),
                    pool_address: pool.address.clone(),
                    token_accounts: pool.token_accounts.clone(),
                    data: instruction::encode(&operation.operation, pool.ecosystem)?,
                }
            }

            RequiredAction::TransferOut { transfer_index, .. } => {
                let transfer = &state.outbound_transfers[*transfer_index];
                let value = transfer
                    .value
                    .as_ref()
                    .ok_or_else(|| ModelError::MissingObservedAmount(transfer.token.id.clone()))?;
                TxKind::TransferOut {
                    token_bridge: config.bridge(settlement)?.token_bridge.clone(),
                    mint: Self::address_on(&transfer.token, settlement)?,
                    amount: value.to_atomic_u64(settlement)?,
                    target_ecosystem: transfer.to_ecosystem,
                    recipient: wallet_on(transfer.to_ecosystem)?,
                }
            }

            RequiredAction::ClaimOutbound { transfer_index, .. } => {
                let transfer = &state.outbound_transfers[*transfer_index];
                let destination = transfer.to_ecosystem;
                let Some(attestation) = self
                    .attestation_of(settlement, transfer.tx_ids.transfer.as_ref())
                    .await?
                else {
                    return Ok(None);
                };
                let value = transfer
                    .value
                    .as_ref()
                    .ok_or_else(|| ModelError::MissingObservedAmount(transfer.token.id.clone()))?;
                TxKind::ClaimOutbound {
                    token_bridge: config.bridge(destination)?.token_bridge.clone(),
                    token_address: Self::address_on(&transfer.token, destination)?,
                    amount: value.to_atomic_u64(destination)?,
                    attestation,
                }
            }
        };
        Ok(Some(kind))
    }
}
