//! Pool program instruction data
//!
//! Layout: `[u8 instruction][u8 defi instruction]` followed by the fields of
//! the variant. Amounts are little-endian `u64` atomic units on the pool's
//! ecosystem, token indices are `u8`.

use crate::amount::Amount;
use crate::ecosystem::EcosystemId;
use crate::operation::PoolOperation;
use crate::{AmountError, ModelError, Result};

/// Top-level pool instruction discriminator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolInstruction {
    Init = 0,
    DeFi = 1,
    Governance = 2,
}

/// DeFi instruction discriminator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefiInstruction {
    Add = 0,
    Swap = 1,
    SwapExactOutput = 2,
    RemoveUniform = 3,
    RemoveExactBurn = 4,
    RemoveExactOutput = 5,
}

impl DefiInstruction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DefiInstruction::Add),
            1 => Some(DefiInstruction::Swap),
            2 => Some(DefiInstruction::SwapExactOutput),
            3 => Some(DefiInstruction::RemoveUniform),
            4 => Some(DefiInstruction::RemoveExactBurn),
            5 => Some(DefiInstruction::RemoveExactOutput),
            _ => None,
        }
    }
}

impl PoolOperation {
    pub fn defi_instruction(&self) -> DefiInstruction {
        match self {
            PoolOperation::Add { .. } => DefiInstruction::Add,
            PoolOperation::Swap { .. } => DefiInstruction::Swap,
            PoolOperation::RemoveUniform { .. } => DefiInstruction::RemoveUniform,
            PoolOperation::RemoveExactBurn { .. } => DefiInstruction::RemoveExactBurn,
            PoolOperation::RemoveExactOutput { .. } => DefiInstruction::RemoveExactOutput,
        }
    }
}

fn push_amount(data: &mut Vec<u8>, amount: &Amount, ecosystem: EcosystemId) -> Result<()> {
    let atomic = amount.to_atomic_u64(ecosystem)?;
    data.extend_from_slice(&atomic.to_le_bytes());
    Ok(())
}

fn push_amounts(data: &mut Vec<u8>, amounts: &[Amount], ecosystem: EcosystemId) -> Result<()> {
    for amount in amounts {
        push_amount(data, amount, ecosystem)?;
    }
    Ok(())
}

fn push_index(data: &mut Vec<u8>, index: usize) -> Result<()> {
    let index = u8::try_from(index).map_err(|_| ModelError::Amount(AmountError::Overflow))?;
    data.push(index);
    Ok(())
}

/// Serialize `operation` into pool program instruction data
///
/// # Arguments
/// * `operation` - The pool operation to encode
/// * `ecosystem` - Pool ecosystem whose token decimals define atomic units
pub fn encode(operation: &PoolOperation, ecosystem: EcosystemId) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(2 + 8 * 8);
    data.push(PoolInstruction::DeFi as u8);
    data.push(operation.defi_instruction() as u8);

    match operation {
        PoolOperation::Add {
            input_amounts,
            minimum_mint_amount,
        } => {
            push_amounts(&mut data, input_amounts, ecosystem)?;
            push_amount(&mut data, minimum_mint_amount, ecosystem)?;
        }
        PoolOperation::Swap {
            exact_input_amounts,
            output_token_index,
            minimum_output_amount,
        } => {
            push_amounts(&mut data, exact_input_amounts, ecosystem)?;
            push_index(&mut data, *output_token_index)?;
            push_amount(&mut data, minimum_output_amount, ecosystem)?;
        }
        PoolOperation::RemoveUniform {
            exact_burn_amount,
            minimum_output_amounts,
        } => {
            push_amount(&mut data, exact_burn_amount, ecosystem)?;
            push_amounts(&mut data, minimum_output_amounts, ecosystem)?;
        }
        PoolOperation::RemoveExactBurn {
            exact_burn_amount,
            output_token_index,
            minimum_output_amount,
        } => {
            push_amount(&mut data, exact_burn_amount, ecosystem)?;
            push_index(&mut data, *output_token_index)?;
            push_amount(&mut data, minimum_output_amount, ecosystem)?;
        }
        PoolOperation::RemoveExactOutput {
            maximum_burn_amount,
            exact_output_amounts,
        } => {
            push_amount(&mut data, maximum_burn_amount, ecosystem)?;
            push_amounts(&mut data, exact_output_amounts, ecosystem)?;
        }
    }
    Ok(data)
}

/// DeFi discriminator of raw instruction data, if it is a DeFi instruction
pub fn decode_defi_instruction(data: &[u8]) -> Option<DefiInstruction> {
    match data {
        [instruction, defi, ..] if *instruction == PoolInstruction::DeFi as u8 => {
            DefiInstruction::from_u8(*defi)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures;
    use rust_decimal_macros::dec;

    #[test]
    fn test_encode_swap_layout() {
        let config = fixtures::config();
        let tokens = config.pool_tokens("hub").unwrap().tokens;
        let operation = PoolOperation::Swap {
            exact_input_amounts: vec![
                Amount::from_human(tokens[0].clone(), dec!(1.5)),
                Amount::zero(tokens[1].clone()),
                Amount::zero(tokens[2].clone()),
            ],
            output_token_index: 2,
            minimum_output_amount: Amount::from_human(tokens[2].clone(), dec!(1.4)),
        };
        let data = encode(&operation, EcosystemId::Solana).unwrap();

        assert_eq!(data.len(), 2 + 3 * 8 + 1 + 8);
        assert_eq!(&data[..2], &[1, 1]);
        assert_eq!(&data[2..10], &1_500_000u64.to_le_bytes());
        assert_eq!(&data[10..26], &[0u8; 16]);
        assert_eq!(data[26], 2);
        // busd has 8 decimals on solana
        assert_eq!(&data[27..35], &140_000_000u64.to_le_bytes());
        assert_eq!(decode_defi_instruction(&data), Some(DefiInstruction::Swap));
    }

    #[test]
    fn test_encode_remove_exact_burn_layout() {
        let config = fixtures::config();
        let pool = config.pool_tokens("hub").unwrap();
        let operation = PoolOperation::RemoveExactBurn {
            exact_burn_amount: Amount::from_human(pool.lp_token.clone(), dec!(2)),
            output_token_index: 1,
            minimum_output_amount: Amount::from_human(pool.tokens[1].clone(), dec!(1.9)),
        };
        let data = encode(&operation, EcosystemId::Solana).unwrap();
        assert_eq!(data.len(), 2 + 8 + 1 + 8);
        assert_eq!(data[1], DefiInstruction::RemoveExactBurn as u8);
        assert_eq!(&data[2..10], &200_000_000u64.to_le_bytes());
        assert_eq!(data[10], 1);
        assert_eq!(&data[11..19], &1_900_000u64.to_le_bytes());
    }

    #[test]
    fn test_encode_rejects_negative_amounts() {
        let config = fixtures::config();
        let pool = config.pool_tokens("hub").unwrap();
        let operation = PoolOperation::RemoveUniform {
            exact_burn_amount: Amount::from_human(pool.lp_token.clone(), dec!(-1)),
            minimum_output_amounts: vec![],
        };
        assert!(encode(&operation, EcosystemId::Solana).is_err());
    }

    #[test]
    fn test_decode_ignores_other_instructions() {
        assert_eq!(decode_defi_instruction(&[0, 1]), None);
        assert_eq!(decode_defi_instruction(&[1, 9]), None);
        assert_eq!(decode_defi_instruction(&[1]), None);
    }
}
