//! Chain history classification and replay
//!
//! A [`TxRecord`] is the chain-neutral summary of one confirmed transaction
//! that the chain clients produce. Classifiers recognise which pipeline step
//! a transaction performed; [`replay`] folds the resulting events through
//! [`crate::transition::apply`] to rebuild state after a reload.

use pool_math::Decimal;
use std::collections::BTreeSet;

use crate::amount::Amount;
use crate::config::Config;
use crate::ecosystem::EcosystemId;
use crate::instruction;
use crate::interaction::InteractionId;
use crate::operation::OperationSpec;
use crate::state::{InboundTransferState, InteractionState, OutboundTransferState};
use crate::transition::{apply, Event};

// ============================================================================
// Transaction records
// ============================================================================

/// Balance change of one token account, in atomic units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChange {
    pub mint: String,
    pub owner: String,
    pub delta: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountRef {
    pub mint: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInstruction {
    pub program_id: String,
    pub accounts: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub ecosystem: EcosystemId,
    pub tx_id: String,
    /// Unix milliseconds of the block, when known
    pub timestamp: Option<i64>,
    /// Memo or calldata tag
    pub interaction_id: Option<InteractionId>,
    pub account_keys: Vec<String>,
    pub instructions: Vec<TxInstruction>,
    pub token_changes: Vec<TokenChange>,
    pub created_accounts: Vec<TokenAccountRef>,
}

impl TxRecord {
    pub fn new(ecosystem: EcosystemId, tx_id: impl Into<String>) -> Self {
        Self {
            ecosystem,
            tx_id: tx_id.into(),
            timestamp: None,
            interaction_id: None,
            account_keys: Vec::new(),
            instructions: Vec::new(),
            token_changes: Vec::new(),
            created_accounts: Vec::new(),
        }
    }

    pub fn invokes(&self, program_id: &str) -> bool {
        self.instructions
            .iter()
            .any(|ix| self.ecosystem.same_address(&ix.program_id, program_id))
    }

    pub fn mentions(&self, address: &str) -> bool {
        self.account_keys
            .iter()
            .chain(self.instructions.iter().flat_map(|ix| ix.accounts.iter()))
            .any(|key| self.ecosystem.same_address(key, address))
    }

    /// Net atomic change of `owner`'s `mint` balance
    pub fn token_delta(&self, mint: &str, owner: &str) -> Decimal {
        self.token_changes
            .iter()
            .filter(|c| {
                self.ecosystem.same_address(&c.mint, mint) && self.ecosystem.same_address(&c.owner, owner)
            })
            .map(|c| c.delta)
            .sum()
    }

    fn belongs_to(&self, id: &InteractionId) -> bool {
        self.interaction_id.as_ref() == Some(id)
    }
}

/// Atomic amount of `mint` that `owner` received in `tx`, zero if it lost
/// tokens or was not involved
pub fn amount_received(tx: &TxRecord, mint: &str, owner: &str) -> Decimal {
    tx.token_delta(mint, owner).max(Decimal::ZERO)
}

// ============================================================================
// Classifiers
// ============================================================================

fn token_bridge(config: &Config, ecosystem: EcosystemId) -> Option<&str> {
    config.bridge(ecosystem).ok().map(|b| b.token_bridge.as_str())
}

fn core_bridge(config: &Config, ecosystem: EcosystemId) -> Option<&str> {
    config.bridge(ecosystem).ok().map(|b| b.core_bridge.as_str())
}

/// Creation of the settlement wallet's token account for `mint`
pub fn is_create_token_account_tx(state: &InteractionState, mint: &str, tx: &TxRecord) -> bool {
    let Some(wallet) = state.settlement_wallet() else {
        return false;
    };
    tx.ecosystem == state.settlement_ecosystem
        && tx.created_accounts.iter().any(|account| {
            tx.ecosystem.same_address(&account.mint, mint)
                && tx.ecosystem.same_address(&account.owner, wallet)
        })
}

/// Lock of an inbound transfer's tokens in the source chain's token bridge
pub fn is_lock_tx(
    config: &Config,
    state: &InteractionState,
    transfer: &InboundTransferState,
    tx: &TxRecord,
) -> bool {
    let source = transfer.from_ecosystem;
    let (Some(bridge), Some(wallet), Some(token)) = (
        token_bridge(config, source),
        state.interaction.wallet(source),
        transfer.token.address_on(source),
    ) else {
        return false;
    };
    tx.ecosystem == source && tx.invokes(bridge) && tx.token_delta(token, wallet) < Decimal::ZERO
}

/// Signature verification or VAA posting that used one of the transfer's
/// signature-set keys, current or abandoned
pub fn is_post_vaa_tx(
    config: &Config,
    state: &InteractionState,
    transfer: &InboundTransferState,
    tx: &TxRecord,
) -> bool {
    let settlement = state.settlement_ecosystem;
    let Some(bridge) = core_bridge(config, settlement) else {
        return false;
    };
    tx.ecosystem == settlement
        && tx.invokes(bridge)
        && state
            .interaction
            .signature_sets
            .known_addresses(&transfer.token.id)
            .iter()
            .any(|address| tx.mentions(address))
}

/// Claim of an inbound transfer on the settlement chain
pub fn is_redeem_tx(
    config: &Config,
    state: &InteractionState,
    transfer: &InboundTransferState,
    tx: &TxRecord,
) -> bool {
    let settlement = state.settlement_ecosystem;
    let (Some(bridge), Some(wallet), Some(mint)) = (
        token_bridge(config, settlement),
        state.settlement_wallet(),
        transfer.token.address_on(settlement),
    ) else {
        return false;
    };
    tx.ecosystem == settlement && tx.invokes(bridge) && amount_received(tx, mint, wallet) > Decimal::ZERO
}

/// Execution of `operation` by its pool program
pub fn is_pool_tx(config: &Config, operation: &OperationSpec, tx: &TxRecord) -> bool {
    let Ok(pool) = config.pool(&operation.pool_id) else {
        return false;
    };
    let expected = operation.operation.defi_instruction();
    tx.ecosystem == pool.ecosystem
        && tx.instructions.iter().any(|ix| {
            tx.ecosystem.same_address(&ix.program_id, &pool.program_id)
                && ix.accounts.iter().any(|a| tx.ecosystem.same_address(a, &pool.address))
                && instruction::decode_defi_instruction(&ix.data) == Some(expected)
        })
}

/// Lock of an outbound transfer's tokens in the settlement token bridge
pub fn is_lock_on_settlement_tx(
    config: &Config,
    state: &InteractionState,
    transfer: &OutboundTransferState,
    tx: &TxRecord,
) -> bool {
    let settlement = state.settlement_ecosystem;
    let (Some(bridge), Some(wallet), Some(mint)) = (
        token_bridge(config, settlement),
        state.settlement_wallet(),
        transfer.token.address_on(settlement),
    ) else {
        return false;
    };
    let delta = tx.token_delta(mint, wallet);
    tx.ecosystem == settlement && tx.invokes(bridge) && delta < Decimal::ZERO
}

/// Claim of an outbound transfer on the destination chain
pub fn is_unlock_tx(
    config: &Config,
    state: &InteractionState,
    transfer: &OutboundTransferState,
    tx: &TxRecord,
) -> bool {
    let destination = transfer.to_ecosystem;
    let (Some(bridge), Some(wallet), Some(token)) = (
        token_bridge(config, destination),
        state.interaction.wallet(destination),
        transfer.token.address_on(destination),
    ) else {
        return false;
    };
    tx.ecosystem == destination && tx.invokes(bridge) && amount_received(tx, token, wallet) > Decimal::ZERO
}

// ============================================================================
// Events and replay
// ============================================================================

/// Amounts the settlement wallet received in `tx`, for tokens the
/// configuration knows on the settlement chain
pub fn received_amounts(config: &Config, state: &InteractionState, tx: &TxRecord) -> Vec<Amount> {
    let settlement = state.settlement_ecosystem;
    let Some(wallet) = state.settlement_wallet() else {
        return Vec::new();
    };
    let mints: BTreeSet<&str> = tx.token_changes.iter().map(|c| c.mint.as_str()).collect();
    mints
        .into_iter()
        .filter_map(|mint| {
            let received = amount_received(tx, mint, wallet);
            if received.is_zero() {
                return None;
            }
            let token = config
                .tokens
                .iter()
                .find(|t| t.address_on(settlement).map_or(false, |a| settlement.same_address(a, mint)))?;
            match Amount::from_atomic(token.clone(), received, settlement) {
                Ok(amount) => Some(amount),
                Err(err) => {
                    log::warn!("ignoring {mint} change in {}: {err}", tx.tx_id);
                    None
                }
            }
        })
        .collect()
}

/// Every pipeline event `tx` evidences for `state`'s interaction
pub fn events_for_tx(config: &Config, state: &InteractionState, tx: &TxRecord) -> Vec<Event> {
    if !tx.belongs_to(&state.interaction.id) {
        return Vec::new();
    }
    let tx_id = || tx.tx_id.clone();
    let mut events = Vec::new();

    for (mint, account) in &state.required_token_accounts {
        if !account.is_existing_account && is_create_token_account_tx(state, mint, tx) {
            events.push(Event::TokenAccountCreated {
                mint: mint.clone(),
                tx_id: tx_id(),
            });
        }
    }

    for transfer in &state.inbound_transfers {
        let token_id = transfer.token.id.clone();
        if is_lock_tx(config, state, transfer, tx) {
            events.push(Event::InboundLocked {
                token_id,
                tx_ids: vec![tx_id()],
            });
        } else if is_post_vaa_tx(config, state, transfer, tx) {
            events.push(Event::VaaPosted {
                token_id,
                tx_ids: vec![tx_id()],
            });
        } else if is_redeem_tx(config, state, transfer, tx) {
            events.push(Event::InboundClaimed {
                token_id,
                tx_id: tx_id(),
            });
        }
    }

    for (operation_index, operation) in state.pool_operations.iter().enumerate() {
        if is_pool_tx(config, &operation.operation, tx) {
            events.push(Event::PoolOperationCompleted {
                operation_index,
                tx_id: tx_id(),
                received: received_amounts(config, state, tx),
            });
        }
    }

    for transfer in &state.outbound_transfers {
        let token_id = transfer.token.id.clone();
        if is_lock_on_settlement_tx(config, state, transfer, tx) {
            events.push(Event::OutboundTransferred {
                token_id,
                tx_id: tx_id(),
            });
        } else if is_unlock_tx(config, state, transfer, tx) {
            events.push(Event::OutboundClaimed {
                token_id,
                tx_id: tx_id(),
            });
        }
    }
    events
}

/// Rebuild progress from chain history
///
/// Events are ordered by pipeline stage, then block time, and folded through
/// the same transition the live driver uses. Events that do not apply (for
/// instance a claim whose lock is missing from history) are skipped.
pub fn replay(config: &Config, state: &InteractionState, txs: &[TxRecord]) -> InteractionState {
    let mut seen = BTreeSet::new();
    let mut events: Vec<(Event, i64, usize)> = Vec::new();
    for tx in txs.iter().filter(|tx| seen.insert((tx.ecosystem, tx.tx_id.as_str()))) {
        let timestamp = tx.timestamp.unwrap_or(i64::MAX);
        for event in events_for_tx(config, state, tx) {
            let order = match &event {
                Event::PoolOperationCompleted { operation_index, .. } => *operation_index,
                _ => 0,
            };
            events.push((event, timestamp, order));
        }
    }
    events.sort_by_key(|(event, timestamp, order)| (event.stage(), *order, *timestamp));

    events.iter().fold(state.clone(), |current, (event, _, _)| {
        match apply(&current, event) {
            Ok(next) => next,
            Err(err) => {
                log::debug!("replay of {} skipped {}: {}", state.interaction.id, event.name(), err);
                current
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::state::test_support::cross_chain_swap;
    use crate::state::{Stage, Status};

    #[test]
    fn test_token_delta_sums_matching_changes() {
        let mut tx = TxRecord::new(EcosystemId::Ethereum, "0x1");
        tx.token_changes.push(change("0xAbC", "0xWallet", -5));
        tx.token_changes.push(change("0xabc", "0xwallet", 2));
        tx.token_changes.push(change("0xabc", "0xother", 7));
        assert_eq!(tx.token_delta("0xABC", "0xWALLET"), Decimal::from(-3));
        assert_eq!(amount_received(&tx, "0xabc", "0xwallet"), Decimal::ZERO);
        assert_eq!(amount_received(&tx, "0xabc", "0xother"), Decimal::from(7));
    }

    #[test]
    fn test_untagged_transactions_are_ignored() {
        let (config, state) = cross_chain_swap();
        let mut txs = cross_chain_swap_history(&config, &state);
        for tx in &mut txs {
            tx.interaction_id = Some(InteractionId::generate());
        }
        assert!(txs.iter().all(|tx| events_for_tx(&config, &state, tx).is_empty()));
    }

    #[test]
    fn test_classifiers_recognise_each_step() {
        let (config, state) = cross_chain_swap();
        let txs = cross_chain_swap_history(&config, &state);
        let by_id = |id: &str| txs.iter().find(|tx| tx.tx_id == id).unwrap();
        let inbound = &state.inbound_transfers[0];
        let outbound = &state.outbound_transfers[0];

        assert!(is_create_token_account_tx(&state, "HubLpMint", by_id("create-lp")));
        assert!(!is_create_token_account_tx(&state, "AvaxUsdcMint", by_id("create-lp")));
        assert!(is_lock_tx(&config, &state, inbound, by_id("lock")));
        assert!(!is_lock_tx(&config, &state, inbound, by_id("redeem")));
        assert!(is_post_vaa_tx(&config, &state, inbound, by_id("post-vaa")));
        assert!(is_redeem_tx(&config, &state, inbound, by_id("redeem")));
        assert!(is_pool_tx(&config, &state.pool_operations[0].operation, by_id("pool-add")));
        assert!(!is_pool_tx(&config, &state.pool_operations[1].operation, by_id("pool-add")));
        assert!(is_pool_tx(&config, &state.pool_operations[1].operation, by_id("pool-swap")));
        assert!(is_lock_on_settlement_tx(&config, &state, outbound, by_id("lock-out")));
        assert!(!is_lock_on_settlement_tx(&config, &state, outbound, by_id("redeem")));
        assert!(is_unlock_tx(&config, &state, outbound, by_id("unlock")));
    }

    #[test]
    fn test_post_vaa_matches_abandoned_signature_set() {
        let (config, mut state) = cross_chain_swap();
        let txs = cross_chain_swap_history(&config, &state);
        let post = txs.iter().find(|tx| tx.tx_id == "post-vaa").unwrap();

        state.interaction.signature_sets = state.interaction.signature_sets.regenerate();
        assert!(is_post_vaa_tx(&config, &state, &state.inbound_transfers[0], post));

        state.interaction.signature_sets = crate::SignatureSets::generate(["ethereum-usdc"]);
        assert!(!is_post_vaa_tx(&config, &state, &state.inbound_transfers[0], post));
    }

    #[test]
    fn test_pool_event_carries_received_amounts() {
        let (config, state) = cross_chain_swap();
        let txs = cross_chain_swap_history(&config, &state);
        let add = txs.iter().find(|tx| tx.tx_id == "pool-add").unwrap();
        let events = events_for_tx(&config, &state, add);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::PoolOperationCompleted {
                operation_index,
                received,
                ..
            } => {
                assert_eq!(*operation_index, 0);
                assert_eq!(received.len(), 1);
                assert_eq!(received[0].token_id(), "solana-hub-lp");
                assert_eq!(received[0].value(), Decimal::new(9981, 2));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_replay_of_full_history_completes() {
        let (config, state) = cross_chain_swap();
        let txs = cross_chain_swap_history(&config, &state);
        let replayed = replay(&config, &state, &txs);

        assert_eq!(replayed.status(), Status::Completed);
        assert_eq!(replayed.inbound_transfers[0].tx_ids.approve_and_transfer, vec!["lock"]);
        assert_eq!(replayed.pool_operations[1].tx_id.as_deref(), Some("pool-swap"));
        assert_eq!(
            replayed.pool_operations[1].operation.operation.input_amounts()[1].value(),
            Decimal::new(9981, 2)
        );
        assert_eq!(
            replayed.outbound_transfers[0].value.as_ref().map(Amount::value),
            Some(Decimal::new(997, 1))
        );
    }

    #[test]
    fn test_replay_of_partial_history_stops_at_gap() {
        let (config, state) = cross_chain_swap();
        let txs: Vec<TxRecord> = cross_chain_swap_history(&config, &state)
            .into_iter()
            .filter(|tx| tx.tx_id != "redeem")
            .collect();
        let replayed = replay(&config, &state, &txs);
        assert_eq!(replayed.stage(), Stage::InboundTransfers);
        assert_eq!(replayed.inbound_transfers[0].tx_ids.post_vaa, vec!["post-vaa"]);
        assert!(replayed.pool_operations.iter().all(|op| op.tx_id.is_none()));
    }

    #[test]
    fn test_replay_ignores_duplicate_records() {
        let (config, state) = cross_chain_swap();
        let mut txs = cross_chain_swap_history(&config, &state);
        txs.extend(cross_chain_swap_history(&config, &state));
        assert_eq!(replay(&config, &state, &txs).status(), Status::Completed);
    }
}
