//! Solana RPC client for the settlement chain
//!
//! Reads pool balances, the wallet's token accounts and memo-tagged
//! transaction history, and signs the settlement-side transactions the CLI
//! can build on its own (token accounts and pool instructions).

use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use interaction_model::driver::{ChainClient, ClientError, TxKind, TxRequest};
use interaction_model::history::{TokenAccountRef, TokenChange, TxInstruction, TxRecord};
use interaction_model::interaction::{interaction_id_from_logs, memo_interaction_id};
use interaction_model::{Amount, Config, EcosystemId, InteractionId, PoolSpec};
use pool_math::{Decimal, PoolMath};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_program,
    transaction::Transaction,
};
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding, UiTransactionTokenBalance,
};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::NetworkConfig;

pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";
pub const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

/// Create an RPC client from the network configuration
pub fn create_rpc_client(config: &NetworkConfig) -> RpcClient {
    RpcClient::new_with_commitment(config.rpc_url.clone(), CommitmentConfig::confirmed())
}

fn parse_pubkey(address: &str) -> Result<Pubkey, ClientError> {
    Pubkey::from_str(address).map_err(|e| ClientError::Rejected(format!("invalid address {address}: {e}")))
}

fn rpc_error(err: impl std::fmt::Display) -> ClientError {
    ClientError::Rpc(err.to_string())
}

// ============================================================================
// Settlement client
// ============================================================================

pub struct SolanaClient {
    rpc: RpcClient,
    keypair: Keypair,
    config: Arc<Config>,
}

impl SolanaClient {
    pub fn new(network: &NetworkConfig, config: Arc<Config>) -> Self {
        Self {
            rpc: create_rpc_client(network),
            keypair: network.keypair.insecure_clone(),
            config,
        }
    }

    /// Current math of `pool`, from its token accounts and LP supply
    pub async fn pool_math(&self, pool: &PoolSpec) -> Result<PoolMath> {
        if pool.token_accounts.len() != pool.tokens.len() {
            anyhow::bail!("Pool {} has no token accounts configured", pool.id);
        }
        let mut balances = Vec::with_capacity(pool.tokens.len());
        for (token_id, account) in pool.tokens.iter().zip(&pool.token_accounts) {
            let token = self.config.token(token_id)?;
            let balance = self
                .rpc
                .get_token_account_balance(&Pubkey::from_str(account)?)
                .await
                .with_context(|| format!("Failed to read pool account {}", account))?;
            balances.push(Amount::from_atomic_str(token.clone(), &balance.amount, pool.ecosystem)?.value());
        }

        let lp_token = self.config.token(&pool.lp_token)?;
        let lp_mint = lp_token
            .address_on(pool.ecosystem)
            .with_context(|| format!("LP token {} has no mint on {}", lp_token.id, pool.ecosystem))?;
        let supply = self
            .rpc
            .get_token_supply(&Pubkey::from_str(lp_mint)?)
            .await
            .with_context(|| format!("Failed to read LP supply of {}", pool.id))?;
        let lp_supply = Amount::from_atomic_str(lp_token.clone(), &supply.amount, pool.ecosystem)?.value();

        log::debug!("pool {}: balances {:?}, lp supply {}", pool.id, balances, lp_supply);
        Ok(PoolMath::new(balances, pool.params(), Some(lp_supply))?)
    }

    /// Maths of `pools`, in the given order
    pub async fn pool_maths(&self, pools: &[&PoolSpec]) -> Result<Vec<PoolMath>> {
        let maths = futures::future::join_all(pools.iter().map(|pool| self.pool_math(pool))).await;
        maths.into_iter().collect()
    }

    /// Mints the wallet already holds token accounts for
    pub async fn existing_token_accounts(&self, owner: &str) -> Result<BTreeSet<String>> {
        let token_program = Pubkey::from_str(&self.config.token_account_program)?;
        let accounts = self
            .rpc
            .get_token_accounts_by_owner(&Pubkey::from_str(owner)?, TokenAccountsFilter::ProgramId(token_program))
            .await
            .with_context(|| format!("Failed to list token accounts of {}", owner))?;

        let mut mints = BTreeSet::new();
        for keyed in accounts {
            let data = serde_json::to_value(&keyed.account.data)?;
            if let Some(mint) = data.pointer("/parsed/info/mint").and_then(|v| v.as_str()) {
                mints.insert(mint.to_string());
            }
        }
        Ok(mints)
    }

    async fn fetch_record(&self, signature: &Signature) -> std::result::Result<TxRecord, ClientError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .rpc
            .get_transaction_with_config(signature, config)
            .await
            .map_err(rpc_error)?;
        to_tx_record(signature.to_string(), tx)
    }

    fn instructions_for(&self, kind: &TxKind) -> std::result::Result<Vec<Instruction>, ClientError> {
        let payer = self.keypair.pubkey();
        match kind {
            TxKind::CreateTokenAccount {
                mint,
                owner,
                token_program,
            } => {
                let mint = parse_pubkey(mint)?;
                let owner = parse_pubkey(owner)?;
                let token_program = parse_pubkey(token_program)?;
                let ata_program = parse_pubkey(ASSOCIATED_TOKEN_PROGRAM_ID)?;
                let (account, _) = Pubkey::find_program_address(
                    &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
                    &ata_program,
                );
                // CreateIdempotent
                Ok(vec![Instruction::new_with_bytes(
                    ata_program,
                    &[1],
                    vec![
                        AccountMeta::new(payer, true),
                        AccountMeta::new(account, false),
                        AccountMeta::new_readonly(owner, false),
                        AccountMeta::new_readonly(mint, false),
                        AccountMeta::new_readonly(system_program::id(), false),
                        AccountMeta::new_readonly(token_program, false),
                    ],
                )])
            }

            TxKind::PoolInstruction {
                program_id,
                pool_address,
                token_accounts,
                data,
            } => {
                let mut accounts = vec![AccountMeta::new(parse_pubkey(pool_address)?, false)];
                for account in token_accounts {
                    accounts.push(AccountMeta::new(parse_pubkey(account)?, false));
                }
                accounts.push(AccountMeta::new_readonly(payer, true));
                accounts.push(AccountMeta::new_readonly(
                    parse_pubkey(&self.config.token_account_program)?,
                    false,
                ));
                Ok(vec![Instruction::new_with_bytes(parse_pubkey(program_id)?, data, accounts)])
            }

            other => Err(ClientError::Rejected(format!(
                "{} needs a bridge-capable wallet",
                kind_name(other)
            ))),
        }
    }
}

fn kind_name(kind: &TxKind) -> &'static str {
    match kind {
        TxKind::CreateTokenAccount { .. } => "token account creation",
        TxKind::ApproveAndTransfer { .. } => "bridge transfer",
        TxKind::PostVaa { .. } => "attestation posting",
        TxKind::Redeem { .. } => "bridge redemption",
        TxKind::PoolInstruction { .. } => "pool instruction",
        TxKind::TransferOut { .. } => "outbound bridge transfer",
        TxKind::ClaimOutbound { .. } => "outbound claim",
    }
}

fn memo_instruction(id: &InteractionId, signer: Pubkey) -> std::result::Result<Instruction, ClientError> {
    Ok(Instruction::new_with_bytes(
        parse_pubkey(MEMO_PROGRAM_ID)?,
        id.as_str().as_bytes(),
        vec![AccountMeta::new_readonly(signer, true)],
    ))
}

#[async_trait]
impl ChainClient for SolanaClient {
    fn ecosystem(&self) -> EcosystemId {
        EcosystemId::Solana
    }

    fn wallet_address(&self) -> Option<String> {
        Some(self.keypair.pubkey().to_string())
    }

    async fn submit(&self, request: TxRequest) -> std::result::Result<TxRecord, ClientError> {
        let mut instructions = vec![memo_instruction(&request.interaction_id, self.keypair.pubkey())?];
        instructions.extend(self.instructions_for(&request.kind)?);

        let recent_blockhash = self.rpc.get_latest_blockhash().await.map_err(rpc_error)?;
        let transaction = Transaction::new_signed_with_payer(
            &instructions,
            Some(&self.keypair.pubkey()),
            &[&self.keypair],
            recent_blockhash,
        );

        println!("{}", "Sending transaction...".dimmed());
        let signature = self
            .rpc
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        println!("{} {}", "Transaction confirmed:".bright_green(), signature);

        let mut record = self.fetch_record(&signature).await?;
        record.interaction_id.get_or_insert_with(|| request.interaction_id.clone());
        Ok(record)
    }

    async fn history(
        &self,
        address: &str,
        interaction_id: &InteractionId,
    ) -> std::result::Result<Vec<TxRecord>, ClientError> {
        let statuses = self
            .rpc
            .get_signatures_for_address(&parse_pubkey(address)?)
            .await
            .map_err(rpc_error)?;

        let mut records = Vec::new();
        for status in statuses {
            if status.err.is_some() {
                continue;
            }
            let tagged = status
                .memo
                .as_deref()
                .and_then(memo_interaction_id)
                .is_some_and(|id| &id == interaction_id);
            if !tagged {
                continue;
            }
            let signature = Signature::from_str(&status.signature).map_err(rpc_error)?;
            records.push(self.fetch_record(&signature).await?);
        }
        log::debug!("{}: {} transactions for {}", address, records.len(), interaction_id);
        Ok(records)
    }
}

// ============================================================================
// Transaction decoding
// ============================================================================

/// One row of a transaction's pre or post token balances
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBalanceRow {
    pub account_index: u8,
    pub mint: String,
    pub owner: String,
    /// Atomic units
    pub amount: Decimal,
}

impl TokenBalanceRow {
    fn from_ui(balance: &UiTransactionTokenBalance) -> Option<Self> {
        let owner = match &balance.owner {
            OptionSerializer::Some(owner) => owner.clone(),
            _ => return None,
        };
        Some(Self {
            account_index: balance.account_index,
            mint: balance.mint.clone(),
            owner,
            amount: Decimal::from_str(&balance.ui_token_amount.amount).ok()?,
        })
    }
}

/// Per-account balance deltas, and the token accounts that did not exist
/// before the transaction
pub fn token_changes(pre: &[TokenBalanceRow], post: &[TokenBalanceRow]) -> (Vec<TokenChange>, Vec<TokenAccountRef>) {
    let before: BTreeMap<u8, &TokenBalanceRow> = pre.iter().map(|row| (row.account_index, row)).collect();
    let after: BTreeMap<u8, &TokenBalanceRow> = post.iter().map(|row| (row.account_index, row)).collect();

    let mut changes = Vec::new();
    let mut created = Vec::new();
    let indices: BTreeSet<u8> = before.keys().chain(after.keys()).copied().collect();
    for index in indices {
        let (row, delta) = match (before.get(&index), after.get(&index)) {
            (Some(pre), Some(post)) => (*post, post.amount - pre.amount),
            (None, Some(post)) => {
                created.push(TokenAccountRef {
                    mint: post.mint.clone(),
                    owner: post.owner.clone(),
                });
                (*post, post.amount)
            }
            (Some(pre), None) => (*pre, -pre.amount),
            (None, None) => continue,
        };
        if !delta.is_zero() {
            changes.push(TokenChange {
                mint: row.mint.clone(),
                owner: row.owner.clone(),
                delta,
            });
        }
    }
    (changes, created)
}

fn rows(balances: &OptionSerializer<Vec<UiTransactionTokenBalance>>) -> Vec<TokenBalanceRow> {
    match balances {
        OptionSerializer::Some(balances) => balances.iter().filter_map(TokenBalanceRow::from_ui).collect(),
        _ => Vec::new(),
    }
}

fn to_tx_record(
    tx_id: String,
    confirmed: EncodedConfirmedTransactionWithStatusMeta,
) -> std::result::Result<TxRecord, ClientError> {
    let decoded = confirmed
        .transaction
        .transaction
        .decode()
        .ok_or_else(|| ClientError::Rpc(format!("cannot decode transaction {tx_id}")))?;
    let meta = confirmed
        .transaction
        .meta
        .ok_or_else(|| ClientError::Rpc(format!("transaction {tx_id} has no status meta")))?;

    let mut record = TxRecord::new(EcosystemId::Solana, tx_id);
    record.timestamp = confirmed.block_time.map(|seconds| seconds * 1000);

    record.account_keys = decoded
        .message
        .static_account_keys()
        .iter()
        .map(Pubkey::to_string)
        .collect();
    if let OptionSerializer::Some(loaded) = &meta.loaded_addresses {
        record.account_keys.extend(loaded.writable.iter().cloned());
        record.account_keys.extend(loaded.readonly.iter().cloned());
    }

    let key = |index: u8| record.account_keys.get(usize::from(index)).cloned().unwrap_or_default();
    let instructions: Vec<TxInstruction> = decoded
        .message
        .instructions()
        .iter()
        .map(|ix| TxInstruction {
            program_id: key(ix.program_id_index),
            accounts: ix.accounts.iter().map(|index| key(*index)).collect(),
            data: ix.data.clone(),
        })
        .collect();
    record.instructions = instructions;

    record.interaction_id = record
        .instructions
        .iter()
        .filter(|ix| ix.program_id == MEMO_PROGRAM_ID)
        .find_map(|ix| std::str::from_utf8(&ix.data).ok().and_then(memo_interaction_id));
    if record.interaction_id.is_none() {
        if let OptionSerializer::Some(logs) = &meta.log_messages {
            record.interaction_id = interaction_id_from_logs(logs.as_slice());
        }
    }

    let (changes, created) = token_changes(&rows(&meta.pre_token_balances), &rows(&meta.post_token_balances));
    record.token_changes = changes;
    record.created_accounts = created;
    Ok(record)
}

/// Pretty print a signature as a shortened explorer link
pub fn format_signature(signature: &str, network: &str) -> String {
    let short = if signature.len() > 16 {
        format!("{}...{}", &signature[0..8], &signature[signature.len() - 8..])
    } else {
        signature.to_string()
    };

    let explorer_url = match network {
        "mainnet-beta" | "mainnet" => format!("https://explorer.solana.com/tx/{}", signature),
        "devnet" => format!("https://explorer.solana.com/tx/{}?cluster=devnet", signature),
        "localnet" | "local" => format!("http://localhost:3000/tx/{}", signature),
        _ => signature.to_string(),
    };

    format!("{} ({})", short.bright_blue(), explorer_url.dimmed())
}
