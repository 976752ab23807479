//! Pure state transitions
//!
//! `apply(state, event)` is the only way an [`InteractionState`] changes. The
//! live driver applies one event per confirmed transaction; replay folds the
//! whole history through the same function.

use crate::amount::Amount;
use crate::route;
use crate::state::{InteractionState, Stage};
use crate::ModelError;

/// A confirmed fact about an interaction
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TokenAccountCreated {
        mint: String,
        tx_id: String,
    },
    InboundLocked {
        token_id: String,
        tx_ids: Vec<String>,
    },
    VaaPosted {
        token_id: String,
        tx_ids: Vec<String>,
    },
    InboundClaimed {
        token_id: String,
        tx_id: String,
    },
    PoolOperationCompleted {
        operation_index: usize,
        tx_id: String,
        /// Amounts the user received in the pool transaction
        received: Vec<Amount>,
    },
    OutboundTransferred {
        token_id: String,
        tx_id: String,
    },
    OutboundClaimed {
        token_id: String,
        tx_id: String,
    },
    ErrorRegistered {
        message: String,
    },
    ErrorCleared,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TokenAccountCreated { .. } => "token-account-created",
            Event::InboundLocked { .. } => "inbound-locked",
            Event::VaaPosted { .. } => "vaa-posted",
            Event::InboundClaimed { .. } => "inbound-claimed",
            Event::PoolOperationCompleted { .. } => "pool-operation-completed",
            Event::OutboundTransferred { .. } => "outbound-transferred",
            Event::OutboundClaimed { .. } => "outbound-claimed",
            Event::ErrorRegistered { .. } => "error-registered",
            Event::ErrorCleared => "error-cleared",
        }
    }

    /// Pipeline stage the event belongs to; error events belong to none
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Event::TokenAccountCreated { .. } => Some(Stage::RequiredAccounts),
            Event::InboundLocked { .. } | Event::VaaPosted { .. } | Event::InboundClaimed { .. } => {
                Some(Stage::InboundTransfers)
            }
            Event::PoolOperationCompleted { .. } => Some(Stage::PoolOperations),
            Event::OutboundTransferred { .. } | Event::OutboundClaimed { .. } => {
                Some(Stage::OutboundTransfers)
            }
            Event::ErrorRegistered { .. } | Event::ErrorCleared => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The event needs an upstream stage or sub-step that is not complete
    #[error("{event} is out of order: {pending} pending")]
    OutOfOrder { event: &'static str, pending: String },
    #[error("no required token account for mint {0}")]
    UnknownAccount(String),
    #[error("no transfer of token {0}")]
    UnknownTransfer(String),
    #[error("no pool operation #{0}")]
    UnknownOperation(usize),
    #[error(transparent)]
    Model(#[from] ModelError),
}

type Result<T> = std::result::Result<T, TransitionError>;

fn require_stage(state: &InteractionState, event: &Event, stage: Stage) -> Result<()> {
    let current = state.stage();
    if current < stage {
        return Err(TransitionError::OutOfOrder {
            event: event.name(),
            pending: current.to_string(),
        });
    }
    Ok(())
}

fn push_unique(target: &mut Vec<String>, tx_ids: &[String]) -> bool {
    let mut changed = false;
    for tx_id in tx_ids {
        if !target.contains(tx_id) {
            target.push(tx_id.clone());
            changed = true;
        }
    }
    changed
}

/// Apply one event, returning the next state
///
/// Events for a stage whose upstream stages are incomplete are rejected.
/// Re-applying an already recorded fact leaves the state unchanged.
pub fn apply(state: &InteractionState, event: &Event) -> Result<InteractionState> {
    let mut next = state.clone();
    match event {
        Event::TokenAccountCreated { mint, tx_id } => {
            let account = next
                .required_token_accounts
                .get_mut(mint)
                .ok_or_else(|| TransitionError::UnknownAccount(mint.clone()))?;
            if !account.is_complete() {
                account.tx_id = Some(tx_id.clone());
            }
        }

        Event::InboundLocked { token_id, tx_ids } => {
            require_stage(state, event, Stage::InboundTransfers)?;
            let transfer = inbound_mut(&mut next, token_id)?;
            push_unique(&mut transfer.tx_ids.approve_and_transfer, tx_ids);
        }

        Event::VaaPosted { token_id, tx_ids } => {
            require_stage(state, event, Stage::InboundTransfers)?;
            let transfer = inbound_mut(&mut next, token_id)?;
            if transfer.tx_ids.approve_and_transfer.is_empty() {
                return Err(TransitionError::OutOfOrder {
                    event: event.name(),
                    pending: format!("lock of {token_id}"),
                });
            }
            push_unique(&mut transfer.tx_ids.post_vaa, tx_ids);
        }

        Event::InboundClaimed { token_id, tx_id } => {
            require_stage(state, event, Stage::InboundTransfers)?;
            let transfer = inbound_mut(&mut next, token_id)?;
            if transfer.tx_ids.post_vaa.is_empty() {
                return Err(TransitionError::OutOfOrder {
                    event: event.name(),
                    pending: format!("attestation of {token_id}"),
                });
            }
            if transfer.tx_ids.claim.is_none() {
                transfer.tx_ids.claim = Some(tx_id.clone());
            }
        }

        Event::PoolOperationCompleted {
            operation_index,
            tx_id,
            received,
        } => {
            require_stage(state, event, Stage::PoolOperations)?;
            let index = *operation_index;
            if index >= next.pool_operations.len() {
                return Err(TransitionError::UnknownOperation(index));
            }
            if next.pool_operations[index].is_complete() {
                return Ok(next);
            }
            if let Some(pending) = next.pool_operations[..index].iter().position(|op| !op.is_complete()) {
                return Err(TransitionError::OutOfOrder {
                    event: event.name(),
                    pending: format!("pool operation #{pending}"),
                });
            }
            next.pool_operations[index].tx_id = Some(tx_id.clone());

            if let Some(following) = next.pool_operations.get(index + 1) {
                let patched = route::set_output_operation_input_amount(
                    &next.pool_operations[index].operation,
                    &following.operation,
                    received,
                )?;
                next.pool_operations[index + 1].operation = patched;
            } else {
                fill_outbound_values(&mut next, received);
            }
        }

        Event::OutboundTransferred { token_id, tx_id } => {
            require_stage(state, event, Stage::OutboundTransfers)?;
            let transfer = outbound_mut(&mut next, token_id)?;
            if transfer.tx_ids.transfer.is_none() {
                transfer.tx_ids.transfer = Some(tx_id.clone());
            }
        }

        Event::OutboundClaimed { token_id, tx_id } => {
            require_stage(state, event, Stage::OutboundTransfers)?;
            let transfer = outbound_mut(&mut next, token_id)?;
            if transfer.tx_ids.transfer.is_none() {
                return Err(TransitionError::OutOfOrder {
                    event: event.name(),
                    pending: format!("transfer of {token_id}"),
                });
            }
            if transfer.tx_ids.claim.is_none() {
                transfer.tx_ids.claim = Some(tx_id.clone());
            }
        }

        Event::ErrorRegistered { message } => {
            log::warn!("interaction {} failed: {}", next.interaction.id, message);
            next.error = Some(message.clone());
        }

        Event::ErrorCleared => {
            next.error = None;
            if state.stage() == Stage::InboundTransfers {
                regenerate_signature_sets(&mut next);
            }
        }
    }

    if next != *state {
        log::debug!(
            "interaction {}: {} -> stage {}",
            next.interaction.id,
            event.name(),
            next.stage()
        );
    }
    Ok(next)
}

fn inbound_mut<'a>(
    state: &'a mut InteractionState,
    token_id: &str,
) -> Result<&'a mut crate::state::InboundTransferState> {
    state
        .inbound_transfers
        .iter_mut()
        .find(|t| t.token.id == token_id)
        .ok_or_else(|| TransitionError::UnknownTransfer(token_id.to_string()))
}

fn outbound_mut<'a>(
    state: &'a mut InteractionState,
    token_id: &str,
) -> Result<&'a mut crate::state::OutboundTransferState> {
    state
        .outbound_transfers
        .iter_mut()
        .find(|t| t.token.id == token_id)
        .ok_or_else(|| TransitionError::UnknownTransfer(token_id.to_string()))
}

/// Outbound values become known once the last pool operation confirms
fn fill_outbound_values(state: &mut InteractionState, received: &[Amount]) {
    for transfer in state.outbound_transfers.iter_mut().filter(|t| t.value.is_none()) {
        let value = received
            .iter()
            .find(|a| a.token_id() == transfer.token.id)
            .cloned()
            .unwrap_or_else(|| {
                log::warn!("pool operation yielded no {}", transfer.token.id);
                Amount::zero(transfer.token.clone())
            });
        transfer.value = Some(value);
    }
}

/// Fresh signature-set keys for every inbound transfer that has not posted
/// its attestation yet
fn regenerate_signature_sets(state: &mut InteractionState) {
    let pending: Vec<String> = state
        .inbound_transfers
        .iter()
        .filter(|t| t.tx_ids.post_vaa.is_empty())
        .map(|t| t.token.id.clone())
        .collect();
    let signature_sets = state.interaction.signature_sets.regenerate_only(pending);
    for transfer in state
        .inbound_transfers
        .iter_mut()
        .filter(|t| t.tx_ids.post_vaa.is_empty())
    {
        transfer.signature_set_address = signature_sets.address(&transfer.token.id);
    }
    state.interaction.signature_sets = signature_sets;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;
    use crate::state::{next_required_action, RequiredAction, Status};
    use crate::EcosystemId;
    use pool_math::Decimal;

    fn create_accounts(state: &InteractionState) -> InteractionState {
        state
            .required_token_accounts
            .iter()
            .filter(|(_, a)| !a.is_complete())
            .map(|(mint, _)| Event::TokenAccountCreated {
                mint: mint.clone(),
                tx_id: format!("create-{mint}"),
            })
            .collect::<Vec<_>>()
            .iter()
            .fold(state.clone(), |s, e| apply(&s, e).unwrap())
    }

    fn complete_inbound(state: &InteractionState) -> InteractionState {
        let token_id = "ethereum-usdc".to_string();
        let events = [
            Event::InboundLocked {
                token_id: token_id.clone(),
                tx_ids: vec!["approve".into(), "lock".into()],
            },
            Event::VaaPosted {
                token_id: token_id.clone(),
                tx_ids: vec!["verify".into(), "post".into()],
            },
            Event::InboundClaimed {
                token_id,
                tx_id: "claim".into(),
            },
        ];
        events.iter().fold(state.clone(), |s, e| apply(&s, e).unwrap())
    }

    #[test]
    fn test_full_pipeline() {
        let (config, state) = cross_chain_swap();
        let state = complete_inbound(&create_accounts(&state));
        assert_eq!(state.stage(), Stage::PoolOperations);

        let minted = amount(&config, "solana-hub-lp", Decimal::new(9981, 2));
        let state = apply(
            &state,
            &Event::PoolOperationCompleted {
                operation_index: 0,
                tx_id: "add".into(),
                received: vec![minted],
            },
        )
        .unwrap();
        assert!(!state.pool_operations[1]
            .operation
            .operation
            .has_placeholder_input(EcosystemId::Solana));
        assert_eq!(
            state.pool_operations[1].operation.operation.input_amounts()[1].value(),
            Decimal::new(9981, 2)
        );

        let out = amount(&config, "avalanche-usdc", Decimal::new(9975, 2));
        let state = apply(
            &state,
            &Event::PoolOperationCompleted {
                operation_index: 1,
                tx_id: "swap".into(),
                received: vec![out.clone()],
            },
        )
        .unwrap();
        assert_eq!(state.outbound_transfers[0].value, Some(out));

        let state = apply(
            &state,
            &Event::OutboundTransferred {
                token_id: "avalanche-usdc".into(),
                tx_id: "lock-out".into(),
            },
        )
        .unwrap();
        let state = apply(
            &state,
            &Event::OutboundClaimed {
                token_id: "avalanche-usdc".into(),
                tx_id: "unlock".into(),
            },
        )
        .unwrap();
        assert!(state.is_complete());
        assert_eq!(state.status(), Status::Completed);
    }

    #[test]
    fn test_downstream_events_rejected_until_upstream_completes() {
        let (config, state) = cross_chain_swap();
        let lock = Event::InboundLocked {
            token_id: "ethereum-usdc".into(),
            tx_ids: vec!["lock".into()],
        };
        assert!(matches!(
            apply(&state, &lock),
            Err(TransitionError::OutOfOrder { .. })
        ));

        let state = create_accounts(&state);
        let pool = Event::PoolOperationCompleted {
            operation_index: 0,
            tx_id: "add".into(),
            received: vec![amount(&config, "solana-hub-lp", Decimal::ONE)],
        };
        assert!(matches!(
            apply(&state, &pool),
            Err(TransitionError::OutOfOrder { .. })
        ));

        let claim = Event::InboundClaimed {
            token_id: "ethereum-usdc".into(),
            tx_id: "claim".into(),
        };
        assert!(matches!(
            apply(&state, &claim),
            Err(TransitionError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_second_pool_operation_waits_for_first() {
        let (config, state) = cross_chain_swap();
        let state = complete_inbound(&create_accounts(&state));
        let result = apply(
            &state,
            &Event::PoolOperationCompleted {
                operation_index: 1,
                tx_id: "swap".into(),
                received: vec![amount(&config, "avalanche-usdc", Decimal::ONE)],
            },
        );
        assert!(matches!(result, Err(TransitionError::OutOfOrder { .. })));
        assert!(matches!(
            apply(
                &state,
                &Event::PoolOperationCompleted {
                    operation_index: 7,
                    tx_id: "x".into(),
                    received: vec![],
                }
            ),
            Err(TransitionError::UnknownOperation(7))
        ));
    }

    #[test]
    fn test_reapplying_recorded_facts_is_idempotent() {
        let (_, state) = cross_chain_swap();
        let state = create_accounts(&state);
        let lock = Event::InboundLocked {
            token_id: "ethereum-usdc".into(),
            tx_ids: vec!["approve".into(), "lock".into()],
        };
        let once = apply(&state, &lock).unwrap();
        let twice = apply(&once, &lock).unwrap();
        assert_eq!(once, twice);

        let created = Event::TokenAccountCreated {
            mint: "AvaxUsdcMint".into(),
            tx_id: "other".into(),
        };
        let unchanged = apply(&twice, &created).unwrap();
        assert_eq!(
            unchanged.required_token_accounts["AvaxUsdcMint"].tx_id.as_deref(),
            Some("create-AvaxUsdcMint")
        );
    }

    #[test]
    fn test_missing_intermediate_amount_is_an_error() {
        let (config, state) = cross_chain_swap();
        let state = complete_inbound(&create_accounts(&state));
        let result = apply(
            &state,
            &Event::PoolOperationCompleted {
                operation_index: 0,
                tx_id: "add".into(),
                received: vec![amount(&config, "solana-usdc", Decimal::ONE)],
            },
        );
        assert!(matches!(
            result,
            Err(TransitionError::Model(ModelError::MissingObservedAmount(_)))
        ));
    }

    #[test]
    fn test_error_in_inbound_stage_regenerates_signature_set() {
        let (_, state) = cross_chain_swap();
        let state = create_accounts(&state);
        let old_address = state.inbound_transfers[0].signature_set_address.clone().unwrap();

        let failed = apply(
            &state,
            &Event::ErrorRegistered {
                message: "post vaa failed".into(),
            },
        )
        .unwrap();
        assert_eq!(failed.status(), Status::Error);
        assert!(matches!(
            next_required_action(&failed),
            Some(RequiredAction::ApproveAndTransfer { .. })
        ));

        let cleared = apply(&failed, &Event::ErrorCleared).unwrap();
        assert_eq!(cleared.status(), Status::Incomplete);
        let new_address = cleared.inbound_transfers[0].signature_set_address.clone().unwrap();
        assert_ne!(old_address, new_address);
        assert_eq!(
            cleared.interaction.signature_sets.known_addresses("ethereum-usdc"),
            vec![new_address, old_address]
        );
    }

    #[test]
    fn test_error_after_post_vaa_keeps_posted_key() {
        let (_, state) = cross_chain_swap();
        let mut state = create_accounts(&state);
        state.inbound_transfers[0].tx_ids.post_vaa.push("post-vaa-tx".into());
        let address = state.inbound_transfers[0].signature_set_address.clone();

        let failed = apply(
            &state,
            &Event::ErrorRegistered {
                message: "redeem failed".into(),
            },
        )
        .unwrap();
        let cleared = apply(&failed, &Event::ErrorCleared).unwrap();
        assert_eq!(cleared.inbound_transfers[0].signature_set_address, address);
        assert_eq!(
            cleared.interaction.signature_sets,
            state.interaction.signature_sets
        );
    }

    #[test]
    fn test_error_outside_inbound_stage_keeps_keys() {
        let (_, state) = cross_chain_swap();
        let failed = apply(
            &state,
            &Event::ErrorRegistered {
                message: "rpc timeout".into(),
            },
        )
        .unwrap();
        let cleared = apply(&failed, &Event::ErrorCleared).unwrap();
        assert_eq!(
            cleared.interaction.signature_sets,
            state.interaction.signature_sets
        );
    }
}
