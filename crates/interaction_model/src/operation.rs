//! Concrete pool operations
//!
//! One [`OperationSpec`] maps to one on-chain pool instruction. Amount vectors
//! are in pool token index order and always carry one entry per pool token.

use std::fmt;

use crate::amount::Amount;
use crate::ecosystem::EcosystemId;
use crate::interaction::InteractionId;
use crate::{ModelError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PoolOperation {
    Add {
        input_amounts: Vec<Amount>,
        minimum_mint_amount: Amount,
    },
    Swap {
        exact_input_amounts: Vec<Amount>,
        output_token_index: usize,
        minimum_output_amount: Amount,
    },
    RemoveUniform {
        exact_burn_amount: Amount,
        minimum_output_amounts: Vec<Amount>,
    },
    RemoveExactBurn {
        exact_burn_amount: Amount,
        output_token_index: usize,
        minimum_output_amount: Amount,
    },
    RemoveExactOutput {
        maximum_burn_amount: Amount,
        exact_output_amounts: Vec<Amount>,
    },
}

impl PoolOperation {
    pub fn name(&self) -> &'static str {
        match self {
            PoolOperation::Add { .. } => "add",
            PoolOperation::Swap { .. } => "swap",
            PoolOperation::RemoveUniform { .. } => "remove-uniform",
            PoolOperation::RemoveExactBurn { .. } => "remove-exact-burn",
            PoolOperation::RemoveExactOutput { .. } => "remove-exact-output",
        }
    }

    /// Lower bound on what the operation yields, when it has a single output
    pub fn minimum_output(&self) -> Option<&Amount> {
        match self {
            PoolOperation::Add {
                minimum_mint_amount,
                ..
            } => Some(minimum_mint_amount),
            PoolOperation::Swap {
                minimum_output_amount,
                ..
            }
            | PoolOperation::RemoveExactBurn {
                minimum_output_amount,
                ..
            } => Some(minimum_output_amount),
            PoolOperation::RemoveUniform { .. } | PoolOperation::RemoveExactOutput { .. } => None,
        }
    }

    /// Amounts the operation consumes, including zero entries
    pub fn input_amounts(&self) -> Vec<&Amount> {
        match self {
            PoolOperation::Add { input_amounts, .. } => input_amounts.iter().collect(),
            PoolOperation::Swap {
                exact_input_amounts,
                ..
            } => exact_input_amounts.iter().collect(),
            PoolOperation::RemoveUniform {
                exact_burn_amount, ..
            }
            | PoolOperation::RemoveExactBurn {
                exact_burn_amount, ..
            } => vec![exact_burn_amount],
            PoolOperation::RemoveExactOutput {
                maximum_burn_amount,
                ..
            } => vec![maximum_burn_amount],
        }
    }

    /// True while a second-hop input still holds the atomic `1` placeholder
    pub fn has_placeholder_input(&self, ecosystem: EcosystemId) -> bool {
        match self {
            PoolOperation::Swap { .. } | PoolOperation::RemoveExactBurn { .. } => self
                .input_amounts()
                .iter()
                .any(|amount| amount.is_placeholder(ecosystem)),
            _ => false,
        }
    }

    /// Replace the input of a second-hop operation with the confirmed amount
    pub fn with_input_amount(&self, amount: &Amount) -> Result<PoolOperation> {
        match self {
            PoolOperation::Swap {
                exact_input_amounts,
                output_token_index,
                minimum_output_amount,
            } => {
                let mut replaced = false;
                let exact_input_amounts = exact_input_amounts
                    .iter()
                    .map(|existing| {
                        if existing.token_id() == amount.token_id() {
                            replaced = true;
                            amount.clone()
                        } else {
                            existing.clone()
                        }
                    })
                    .collect();
                if !replaced {
                    return Err(ModelError::TokenNotInPool {
                        token: amount.token_id().to_string(),
                        pool: self.name().to_string(),
                    });
                }
                Ok(PoolOperation::Swap {
                    exact_input_amounts,
                    output_token_index: *output_token_index,
                    minimum_output_amount: minimum_output_amount.clone(),
                })
            }
            PoolOperation::RemoveExactBurn {
                exact_burn_amount,
                output_token_index,
                minimum_output_amount,
            } => {
                if exact_burn_amount.token_id() != amount.token_id() {
                    return Err(ModelError::TokenNotInPool {
                        token: amount.token_id().to_string(),
                        pool: self.name().to_string(),
                    });
                }
                Ok(PoolOperation::RemoveExactBurn {
                    exact_burn_amount: amount.clone(),
                    output_token_index: *output_token_index,
                    minimum_output_amount: minimum_output_amount.clone(),
                })
            }
            PoolOperation::Add { .. }
            | PoolOperation::RemoveUniform { .. }
            | PoolOperation::RemoveExactOutput { .. } => Err(ModelError::InvalidSecondOperation),
        }
    }
}

/// One pool operation of an interaction, tagged with the interaction id so
/// that its transaction can be recognised in history
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub interaction_id: InteractionId,
    pub pool_id: String,
    pub operation: PoolOperation,
}

impl fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.operation.name(), self.pool_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures;
    use rust_decimal_macros::dec;

    #[test]
    fn test_with_input_amount_replaces_placeholder() {
        let config = fixtures::config();
        let hub_lp = config.token("solana-hub-lp").unwrap().clone();
        let avax = config.token("avalanche-usdc").unwrap().clone();
        let operation = PoolOperation::Swap {
            exact_input_amounts: vec![
                Amount::zero(avax.clone()),
                Amount::placeholder(hub_lp.clone(), EcosystemId::Solana).unwrap(),
            ],
            output_token_index: 0,
            minimum_output_amount: Amount::from_human(avax, dec!(9)),
        };
        assert!(operation.has_placeholder_input(EcosystemId::Solana));

        let patched = operation
            .with_input_amount(&Amount::from_human(hub_lp, dec!(9.7)))
            .unwrap();
        assert!(!patched.has_placeholder_input(EcosystemId::Solana));
        assert_eq!(patched.input_amounts()[1].value(), dec!(9.7));
    }

    #[test]
    fn test_only_swap_and_exact_burn_take_patched_inputs() {
        let config = fixtures::config();
        let hub_lp = config.token("solana-hub-lp").unwrap().clone();
        let operation = PoolOperation::RemoveExactOutput {
            maximum_burn_amount: Amount::from_human(hub_lp.clone(), dec!(1)),
            exact_output_amounts: vec![],
        };
        assert!(matches!(
            operation.with_input_amount(&Amount::from_human(hub_lp, dec!(1))),
            Err(ModelError::InvalidSecondOperation)
        ));
    }

    #[test]
    fn test_exact_burn_rejects_other_tokens() {
        let config = fixtures::config();
        let hub_lp = config.token("solana-hub-lp").unwrap().clone();
        let usdc = config.token("solana-usdc").unwrap().clone();
        let operation = PoolOperation::RemoveExactBurn {
            exact_burn_amount: Amount::placeholder(hub_lp, EcosystemId::Solana).unwrap(),
            output_token_index: 0,
            minimum_output_amount: Amount::from_human(usdc.clone(), dec!(1)),
        };
        assert!(operation
            .with_input_amount(&Amount::from_human(usdc, dec!(1)))
            .is_err());
        assert_eq!(operation.minimum_output().unwrap().value(), dec!(1));
    }
}
