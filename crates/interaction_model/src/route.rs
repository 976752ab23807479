//! Operation decomposer
//!
//! Routes span one or two pools. With two pools the second pool's math
//! back-solves the smallest intermediate amount that still satisfies the
//! user's minimum output; the first operation is bounded by it and the second
//! operation starts with a placeholder input that is patched once the first
//! transaction confirms.
//!
//! ```text
//! add-then-swap     input pool is the hub, its LP token trades in the output pool
//! swap-then-remove  output pool is the hub, its LP token trades in the input pool
//! swap-then-swap    the pools share a token
//! ```

use pool_math::{Decimal, PoolMath};
use std::sync::Arc;

use crate::amount::Amount;
use crate::config::{Config, PoolSpec, PoolTokens, TokenSpec};
use crate::ecosystem::EcosystemId;
use crate::interaction::{Interaction, InteractionSpec};
use crate::operation::{OperationSpec, PoolOperation};
use crate::{ModelError, Result};

/// How two pools are chained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    AddThenSwap,
    SwapThenRemove,
    SwapThenSwap { shared_token: String },
}

/// Classify the route from `input_pool` to `output_pool`
pub fn topology(input_pool: &PoolSpec, output_pool: &PoolSpec) -> Result<Topology> {
    if input_pool.is_hub && output_pool.contains(&input_pool.lp_token) {
        return Ok(Topology::AddThenSwap);
    }
    if output_pool.is_hub && input_pool.contains(&output_pool.lp_token) {
        return Ok(Topology::SwapThenRemove);
    }
    input_pool
        .tokens
        .iter()
        .find(|token| output_pool.contains(token))
        .map(|shared| Topology::SwapThenSwap {
            shared_token: shared.clone(),
        })
        .ok_or_else(|| ModelError::NoRoute {
            input: input_pool.id.clone(),
            output: output_pool.id.clone(),
        })
}

/// Token passed from the first pool to the second
fn intermediate_token_id(input_pool: &PoolSpec, output_pool: &PoolSpec) -> Result<String> {
    Ok(match topology(input_pool, output_pool)? {
        Topology::AddThenSwap => input_pool.lp_token.clone(),
        Topology::SwapThenRemove => output_pool.lp_token.clone(),
        Topology::SwapThenSwap { shared_token } => shared_token,
    })
}

/// Pools an interaction touches, in execution order
pub fn required_pools<'a>(config: &'a Config, spec: &InteractionSpec) -> Result<Vec<&'a PoolSpec>> {
    let (input, output) = match spec {
        InteractionSpec::Swap {
            exact_input_amount,
            minimum_output_amount,
        } => (exact_input_amount.token_id(), minimum_output_amount.token_id()),
        _ => {
            let pool_id = spec.pool_id().unwrap_or_default();
            return Ok(vec![config.pool(pool_id)?]);
        }
    };

    if let Some(pool) = config
        .pools
        .iter()
        .find(|pool| pool.contains(input) && pool.contains(output))
    {
        return Ok(vec![pool]);
    }

    let no_route = || ModelError::NoRoute {
        input: input.to_string(),
        output: output.to_string(),
    };
    let input_pool = config
        .pools
        .iter()
        .find(|pool| pool.contains(input))
        .ok_or_else(no_route)?;
    let output_pool = config
        .pools
        .iter()
        .find(|pool| pool.contains(output))
        .ok_or_else(no_route)?;
    topology(input_pool, output_pool)?;
    Ok(vec![input_pool, output_pool])
}

/// Tokens whose accounts must exist on the settlement ecosystem
pub fn required_tokens(
    config: &Config,
    pools: &[&PoolSpec],
    spec: &InteractionSpec,
) -> Result<Vec<Arc<TokenSpec>>> {
    let first = pools.first().ok_or_else(|| ModelError::UnknownPool(spec.kind().to_string()))?;
    let PoolTokens { tokens, lp_token } = config.pool_tokens(&first.id)?;
    let non_zero_of = |amounts: &[Amount]| -> Vec<Arc<TokenSpec>> {
        tokens
            .iter()
            .filter(|token| {
                amounts
                    .iter()
                    .any(|a| a.token_id() == token.id && !a.is_zero())
            })
            .cloned()
            .collect()
    };

    let mut required = match spec {
        InteractionSpec::Add { input_amounts, .. } => non_zero_of(input_amounts),
        InteractionSpec::RemoveUniform {
            minimum_output_amounts,
            ..
        } => non_zero_of(minimum_output_amounts),
        InteractionSpec::RemoveExactOutput {
            exact_output_amounts,
            ..
        } => non_zero_of(exact_output_amounts),
        InteractionSpec::RemoveExactBurn {
            minimum_output_amount,
            ..
        } => tokens
            .iter()
            .filter(|token| token.id == minimum_output_amount.token_id())
            .cloned()
            .collect(),
        InteractionSpec::Swap {
            exact_input_amount,
            minimum_output_amount,
        } => {
            let mut swap_tokens = vec![exact_input_amount.token().clone()];
            if let [input_pool, output_pool] = pools {
                let intermediate = intermediate_token_id(input_pool, output_pool)?;
                swap_tokens.push(config.token(&intermediate)?.clone());
            }
            swap_tokens.push(minimum_output_amount.token().clone());
            return Ok(swap_tokens);
        }
    };
    required.push(lp_token);
    Ok(required)
}

/// Amounts in pool index order, zero for tokens not mentioned
fn amounts_in_pool_order(tokens: &[Arc<TokenSpec>], amounts: &[&Amount]) -> Vec<Amount> {
    tokens
        .iter()
        .map(|token| {
            amounts
                .iter()
                .find(|a| a.token_id() == token.id)
                .map(|a| (*a).clone())
                .unwrap_or_else(|| Amount::zero(token.clone()))
        })
        .collect()
}

fn index_of(tokens: &[Arc<TokenSpec>], token_id: &str, pool: &PoolSpec) -> Result<usize> {
    tokens
        .iter()
        .position(|t| t.id == token_id)
        .ok_or_else(|| ModelError::TokenNotInPool {
            token: token_id.to_string(),
            pool: pool.id.clone(),
        })
}

fn human_values(amounts: &[Amount], ecosystem: EcosystemId) -> Result<Vec<Decimal>> {
    amounts
        .iter()
        .map(|a| a.to_human(ecosystem).map_err(ModelError::from))
        .collect()
}

/// Decompose `interaction` into pool operations
///
/// # Arguments
/// * `config` - Token and pool configuration
/// * `pools` - Pools returned by [`required_pools`]
/// * `pool_maths` - Current math of each pool, required for two-pool routes
/// * `interaction` - The interaction to decompose
///
/// # Returns
/// One operation for single-pool routes, two for two-pool routes
pub fn create_operation_specs(
    config: &Config,
    pools: &[&PoolSpec],
    pool_maths: &[PoolMath],
    interaction: &Interaction,
) -> Result<Vec<OperationSpec>> {
    let input_pool = *pools
        .first()
        .ok_or_else(|| ModelError::UnknownPool(interaction.kind().to_string()))?;
    let output_pool = *pools.last().unwrap_or(&input_pool);
    let input_tokens = config.pool_tokens(&input_pool.id)?;
    let spec_for = |pool: &PoolSpec, operation: PoolOperation| OperationSpec {
        interaction_id: interaction.id.clone(),
        pool_id: pool.id.clone(),
        operation,
    };

    let single = match &interaction.spec {
        InteractionSpec::Add {
            input_amounts,
            minimum_mint_amount,
            ..
        } => PoolOperation::Add {
            input_amounts: amounts_in_pool_order(
                &input_tokens.tokens,
                &input_amounts.iter().collect::<Vec<_>>(),
            ),
            minimum_mint_amount: minimum_mint_amount.clone(),
        },
        InteractionSpec::RemoveUniform {
            exact_burn_amount,
            minimum_output_amounts,
            ..
        } => PoolOperation::RemoveUniform {
            exact_burn_amount: exact_burn_amount.clone(),
            minimum_output_amounts: amounts_in_pool_order(
                &input_tokens.tokens,
                &minimum_output_amounts.iter().collect::<Vec<_>>(),
            ),
        },
        InteractionSpec::RemoveExactBurn {
            exact_burn_amount,
            minimum_output_amount,
            ..
        } => PoolOperation::RemoveExactBurn {
            exact_burn_amount: exact_burn_amount.clone(),
            output_token_index: index_of(
                &input_tokens.tokens,
                minimum_output_amount.token_id(),
                input_pool,
            )?,
            minimum_output_amount: minimum_output_amount.clone(),
        },
        InteractionSpec::RemoveExactOutput {
            maximum_burn_amount,
            exact_output_amounts,
            ..
        } => PoolOperation::RemoveExactOutput {
            maximum_burn_amount: maximum_burn_amount.clone(),
            exact_output_amounts: amounts_in_pool_order(
                &input_tokens.tokens,
                &exact_output_amounts.iter().collect::<Vec<_>>(),
            ),
        },
        InteractionSpec::Swap {
            exact_input_amount,
            minimum_output_amount,
        } if pools.len() == 1 => PoolOperation::Swap {
            exact_input_amounts: amounts_in_pool_order(&input_tokens.tokens, &[exact_input_amount]),
            output_token_index: index_of(
                &input_tokens.tokens,
                minimum_output_amount.token_id(),
                input_pool,
            )?,
            minimum_output_amount: minimum_output_amount.clone(),
        },
        InteractionSpec::Swap {
            exact_input_amount,
            minimum_output_amount,
        } => {
            let [first, second] = two_pool_swap(
                config,
                input_pool,
                output_pool,
                pool_maths,
                exact_input_amount,
                minimum_output_amount,
            )?;
            return Ok(vec![spec_for(input_pool, first), spec_for(output_pool, second)]);
        }
    };
    Ok(vec![spec_for(input_pool, single)])
}

fn two_pool_swap(
    config: &Config,
    input_pool: &PoolSpec,
    output_pool: &PoolSpec,
    pool_maths: &[PoolMath],
    exact_input_amount: &Amount,
    minimum_output_amount: &Amount,
) -> Result<[PoolOperation; 2]> {
    let output_pool_math = match pool_maths {
        [_, second] => second,
        _ => {
            return Err(ModelError::MissingPoolMath {
                expected: 2,
                actual: pool_maths.len(),
            })
        }
    };
    let ecosystem = output_pool.ecosystem;
    let input_tokens = config.pool_tokens(&input_pool.id)?;
    let output_tokens = config.pool_tokens(&output_pool.id)?;
    let exact_input_amounts = amounts_in_pool_order(&input_tokens.tokens, &[exact_input_amount]);
    let minimum_output_amounts = amounts_in_pool_order(&output_tokens.tokens, &[minimum_output_amount]);
    let output_token_index = index_of(
        &output_tokens.tokens,
        minimum_output_amount.token_id(),
        output_pool,
    )?;
    let minimum_outputs_human = human_values(&minimum_output_amounts, ecosystem)?;

    let route = topology(input_pool, output_pool)?;
    log::debug!(
        "two pool route {} -> {}: {:?}",
        input_pool.id,
        output_pool.id,
        route
    );
    match route {
        Topology::AddThenSwap => {
            let input_index = index_of(&output_tokens.tokens, &input_pool.lp_token, output_pool)?;
            let stable_input = output_pool_math
                .swap_exact_output(input_index, &minimum_outputs_human)?
                .stable_input_amount;
            let lp_token = input_tokens.lp_token.clone();
            let placeholder = Amount::placeholder(lp_token.clone(), ecosystem)?;
            Ok([
                PoolOperation::Add {
                    input_amounts: exact_input_amounts,
                    minimum_mint_amount: Amount::from_human(lp_token, stable_input),
                },
                PoolOperation::Swap {
                    exact_input_amounts: amounts_in_pool_order(&output_tokens.tokens, &[&placeholder]),
                    output_token_index,
                    minimum_output_amount: minimum_output_amount.clone(),
                },
            ])
        }
        Topology::SwapThenRemove => {
            let lp_input = output_pool_math
                .remove_exact_output(&minimum_outputs_human)?
                .lp_input_amount;
            let lp_token = output_tokens.lp_token.clone();
            let first_output_index = index_of(&input_tokens.tokens, &lp_token.id, input_pool)?;
            check_distinct_hop(&exact_input_amounts, first_output_index, input_pool)?;
            Ok([
                PoolOperation::Swap {
                    exact_input_amounts,
                    output_token_index: first_output_index,
                    minimum_output_amount: Amount::from_human(lp_token.clone(), lp_input),
                },
                PoolOperation::RemoveExactBurn {
                    // overwritten by set_output_operation_input_amount once the swap confirms
                    exact_burn_amount: Amount::placeholder(lp_token, ecosystem)?,
                    output_token_index,
                    minimum_output_amount: minimum_output_amount.clone(),
                },
            ])
        }
        Topology::SwapThenSwap { shared_token } => {
            let shared = config.token(&shared_token)?.clone();
            let first_output_index = index_of(&input_tokens.tokens, &shared.id, input_pool)?;
            check_distinct_hop(&exact_input_amounts, first_output_index, input_pool)?;
            let second_input_index = index_of(&output_tokens.tokens, &shared.id, output_pool)?;
            let stable_input = output_pool_math
                .swap_exact_output(second_input_index, &minimum_outputs_human)?
                .stable_input_amount;
            let placeholder = Amount::placeholder(shared.clone(), ecosystem)?;
            Ok([
                PoolOperation::Swap {
                    exact_input_amounts,
                    output_token_index: first_output_index,
                    minimum_output_amount: Amount::from_human(shared, stable_input),
                },
                PoolOperation::Swap {
                    exact_input_amounts: amounts_in_pool_order(&output_tokens.tokens, &[&placeholder]),
                    output_token_index,
                    minimum_output_amount: minimum_output_amount.clone(),
                },
            ])
        }
    }
}

/// The first hop cannot swap a token into itself
fn check_distinct_hop(input_amounts: &[Amount], output_index: usize, pool: &PoolSpec) -> Result<()> {
    if input_amounts.get(output_index).map_or(false, |a| !a.is_zero()) {
        return Err(ModelError::NoRoute {
            input: input_amounts[output_index].token_id().to_string(),
            output: pool.id.clone(),
        });
    }
    Ok(())
}

/// Patch the second operation's placeholder input with the amount the first
/// operation actually produced
///
/// # Arguments
/// * `input_operation` - The confirmed first operation
/// * `output_operation` - The second operation still holding a placeholder
/// * `observed` - Amounts received by the user in the first transaction
pub fn set_output_operation_input_amount(
    input_operation: &OperationSpec,
    output_operation: &OperationSpec,
    observed: &[Amount],
) -> Result<OperationSpec> {
    let intermediate = input_operation
        .operation
        .minimum_output()
        .ok_or(ModelError::InvalidSecondOperation)?
        .token_id();
    let received = observed
        .iter()
        .find(|a| a.token_id() == intermediate)
        .ok_or_else(|| ModelError::MissingObservedAmount(intermediate.to_string()))?;
    log::debug!(
        "patching {} input with {}",
        output_operation,
        received
    );
    Ok(OperationSpec {
        interaction_id: output_operation.interaction_id.clone(),
        pool_id: output_operation.pool_id.clone(),
        operation: output_operation.operation.with_input_amount(received)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures;
    use crate::interaction::InteractionId;
    use crate::signature_set::SignatureSets;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn amount(config: &Config, token: &str, value: Decimal) -> Amount {
        Amount::from_human(config.token(token).unwrap().clone(), value)
    }

    fn interaction(config: &Config, spec: InteractionSpec) -> Interaction {
        let pool_ids = required_pools(config, &spec)
            .unwrap()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        Interaction {
            id: InteractionId::generate(),
            spec,
            pool_ids,
            env: config.env,
            submitted_at: 0,
            connected_wallets: BTreeMap::new(),
            signature_sets: SignatureSets::default(),
        }
    }

    fn pool_math(pool: &PoolSpec) -> PoolMath {
        let balances = vec![dec!(1000000); pool.tokens.len()];
        PoolMath::new(balances, pool.params(), None).unwrap()
    }

    fn maths(pools: &[&PoolSpec]) -> Vec<PoolMath> {
        pools.iter().map(|p| pool_math(p)).collect()
    }

    fn swap(config: &Config, from: &str, to: &str) -> InteractionSpec {
        InteractionSpec::Swap {
            exact_input_amount: amount(config, from, dec!(100)),
            minimum_output_amount: amount(config, to, dec!(99)),
        }
    }

    #[test]
    fn test_same_pool_swap_is_one_operation() {
        let config = fixtures::config();
        let spec = swap(&config, "ethereum-usdc", "bnb-busd");
        let pools = required_pools(&config, &spec).unwrap();
        assert_eq!(pools.len(), 1);

        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &[], &interaction).unwrap();
        assert_eq!(specs.len(), 1);
        match &specs[0].operation {
            PoolOperation::Swap {
                exact_input_amounts,
                output_token_index,
                ..
            } => {
                assert_eq!(*output_token_index, 2);
                let values: Vec<Decimal> = exact_input_amounts.iter().map(|a| a.value()).collect();
                assert_eq!(values, vec![dec!(0), dec!(100), dec!(0)]);
            }
            other => panic!("unexpected operation {other:?}"),
        }
        assert_eq!(specs[0].interaction_id, interaction.id);
    }

    #[test]
    fn test_add_then_swap() {
        let config = fixtures::config();
        let spec = swap(&config, "solana-usdc", "avalanche-usdc");
        let pools = required_pools(&config, &spec).unwrap();
        assert_eq!(topology(pools[0], pools[1]).unwrap(), Topology::AddThenSwap);

        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &maths(&pools), &interaction).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].pool_id, "hub");
        assert_eq!(specs[1].pool_id, "meta-avalanche");

        let minimum_mint = match &specs[0].operation {
            PoolOperation::Add {
                minimum_mint_amount,
                ..
            } => minimum_mint_amount.clone(),
            other => panic!("unexpected operation {other:?}"),
        };
        assert_eq!(minimum_mint.token_id(), "solana-hub-lp");
        // back-solved minimum needs slightly more than the final minimum
        assert!(minimum_mint.value() > dec!(99));
        assert!(minimum_mint.value() < dec!(100));

        assert!(specs[1].operation.has_placeholder_input(EcosystemId::Solana));
        let placeholder = specs[1].operation.input_amounts()[1].clone();
        assert!(!placeholder.is_zero());
        assert_eq!(placeholder.token_id(), "solana-hub-lp");
    }

    #[test]
    fn test_swap_then_remove() {
        let config = fixtures::config();
        let spec = swap(&config, "avalanche-usdc", "ethereum-usdc");
        let pools = required_pools(&config, &spec).unwrap();
        assert_eq!(topology(pools[0], pools[1]).unwrap(), Topology::SwapThenRemove);

        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &maths(&pools), &interaction).unwrap();
        match (&specs[0].operation, &specs[1].operation) {
            (
                PoolOperation::Swap {
                    output_token_index,
                    minimum_output_amount,
                    ..
                },
                PoolOperation::RemoveExactBurn {
                    exact_burn_amount,
                    output_token_index: remove_index,
                    ..
                },
            ) => {
                assert_eq!(*output_token_index, 1);
                assert_eq!(minimum_output_amount.token_id(), "solana-hub-lp");
                assert!(minimum_output_amount.value() > dec!(99));
                assert!(exact_burn_amount.is_placeholder(EcosystemId::Solana));
                assert_eq!(*remove_index, 1);
            }
            other => panic!("unexpected operations {other:?}"),
        }

        let minted = amount(&config, "solana-hub-lp", dec!(99.5));
        let patched = set_output_operation_input_amount(&specs[0], &specs[1], &[minted]).unwrap();
        assert!(!patched.operation.has_placeholder_input(EcosystemId::Solana));
        assert_eq!(patched.operation.input_amounts()[0].value(), dec!(99.5));
    }

    #[test]
    fn test_swap_then_swap_uses_shared_token() {
        let config = fixtures::config();
        let spec = swap(&config, "avalanche-usdc", "polygon-usdc");
        let pools = required_pools(&config, &spec).unwrap();
        assert_eq!(
            topology(pools[0], pools[1]).unwrap(),
            Topology::SwapThenSwap {
                shared_token: "solana-hub-lp".to_string()
            }
        );

        let tokens = required_tokens(&config, &pools, &spec).unwrap();
        let ids: Vec<&str> = tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["avalanche-usdc", "solana-hub-lp", "polygon-usdc"]);

        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &maths(&pools), &interaction).unwrap();
        assert_eq!(
            specs[0].operation.minimum_output().unwrap().token_id(),
            "solana-hub-lp"
        );
        assert!(specs[1].operation.has_placeholder_input(EcosystemId::Solana));
    }

    #[test]
    fn test_two_pool_route_requires_both_maths() {
        let config = fixtures::config();
        let spec = swap(&config, "solana-usdc", "avalanche-usdc");
        let pools = required_pools(&config, &spec).unwrap();
        let interaction = interaction(&config, spec);
        let result = create_operation_specs(&config, &pools, &maths(&pools[..1]), &interaction);
        assert!(matches!(
            result,
            Err(ModelError::MissingPoolMath {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_set_output_operation_input_amount() {
        let config = fixtures::config();
        let spec = swap(&config, "solana-usdc", "avalanche-usdc");
        let pools = required_pools(&config, &spec).unwrap();
        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &maths(&pools), &interaction).unwrap();

        let minted = amount(&config, "solana-hub-lp", dec!(99.8));
        let patched = set_output_operation_input_amount(&specs[0], &specs[1], &[minted]).unwrap();
        assert!(!patched.operation.has_placeholder_input(EcosystemId::Solana));
        assert_eq!(patched.operation.input_amounts()[1].value(), dec!(99.8));

        let wrong = amount(&config, "solana-usdc", dec!(1));
        assert!(matches!(
            set_output_operation_input_amount(&specs[0], &specs[1], &[wrong]),
            Err(ModelError::MissingObservedAmount(_))
        ));
    }

    #[test]
    fn test_single_pool_operations_fill_missing_tokens_with_zero() {
        let config = fixtures::config();
        let spec = InteractionSpec::RemoveUniform {
            pool_id: "hub".to_string(),
            exact_burn_amount: amount(&config, "solana-hub-lp", dec!(30)),
            minimum_output_amounts: vec![amount(&config, "bnb-busd", dec!(9))],
            lp_token_source_ecosystem: EcosystemId::Solana,
        };
        let pools = required_pools(&config, &spec).unwrap();
        let tokens = required_tokens(&config, &pools, &spec).unwrap();
        let ids: Vec<&str> = tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["bnb-busd", "solana-hub-lp"]);

        let interaction = interaction(&config, spec);
        let specs = create_operation_specs(&config, &pools, &[], &interaction).unwrap();
        match &specs[0].operation {
            PoolOperation::RemoveUniform {
                minimum_output_amounts,
                ..
            } => {
                let values: Vec<Decimal> = minimum_output_amounts.iter().map(|a| a.value()).collect();
                assert_eq!(values, vec![dec!(0), dec!(0), dec!(9)]);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_unknown_token_has_no_route() {
        let mut config = fixtures::config();
        config.pools.retain(|p| p.id != "meta-avalanche");
        let spec = swap(&config, "solana-usdc", "avalanche-usdc");
        assert!(matches!(
            required_pools(&config, &spec),
            Err(ModelError::NoRoute { .. })
        ));
    }
}
