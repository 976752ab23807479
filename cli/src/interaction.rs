//! Cross-chain interactions: submit, inspect, step and retry

use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use interaction_model::driver::{Attestation, BridgeService, ClientError, Driver, StepOutcome};
use interaction_model::interaction::minimum_output_with_slippage;
use interaction_model::persist;
use interaction_model::state::next_required_action;
use interaction_model::{
    apply, route, Amount, Config, EcosystemId, Event, Interaction, InteractionSpec, InteractionState,
    Status,
};
use pool_math::{Decimal, PoolMath};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::client::SolanaClient;
use crate::config::{AppConfig, NetworkConfig};
use crate::store::FileStore;

/// Parse a `--wallet ecosystem=address` argument
pub fn parse_wallet(value: &str) -> Result<(EcosystemId, String), String> {
    let (ecosystem, address) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ECOSYSTEM=ADDRESS but got {value}"))?;
    let ecosystem: EcosystemId = ecosystem.trim().parse().map_err(|e| format!("{e}"))?;
    let address = address.trim();
    if address.is_empty() {
        return Err(format!("empty {ecosystem} wallet address"));
    }
    Ok((ecosystem, address.to_string()))
}

fn check_slippage(slippage: Decimal) -> Result<()> {
    if !interaction_model::interaction::is_valid_slippage_fraction(slippage) {
        anyhow::bail!("Slippage must be a fraction in [0, 1) but was {}", slippage);
    }
    Ok(())
}

/// Interaction whose id equals or uniquely starts with `query`
pub fn find_interaction(interactions: &[Interaction], query: &str) -> Result<Interaction> {
    let matches: Vec<&Interaction> = interactions
        .iter()
        .filter(|i| i.id.as_str().starts_with(query))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("No stored interaction matches {}", query),
        [only] => Ok((*only).clone()),
        _ => match matches.iter().find(|i| i.id.as_str() == query) {
            Some(exact) => Ok((*exact).clone()),
            None => anyhow::bail!("{} matches {} interactions; use a longer prefix", query, matches.len()),
        },
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        bar.set_style(style);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Attestations are left to the bridge-capable wallet; the CLI only
/// observes settlement-side progress
struct OfflineBridge;

#[async_trait]
impl BridgeService for OfflineBridge {
    async fn attestation(
        &self,
        ecosystem: EcosystemId,
        tx_id: &str,
    ) -> std::result::Result<Option<Attestation>, ClientError> {
        log::info!("attestation of {} on {} is not fetched by the CLI", tx_id, ecosystem);
        Ok(None)
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    network: NetworkConfig,
    config: Arc<Config>,
    store: FileStore,
    client: Arc<SolanaClient>,
}

impl Session {
    pub fn open(network: NetworkConfig, pools_file: &Path, store_dir: &Path) -> Result<Self> {
        let config = Arc::new(AppConfig::load(pools_file)?.into_config(network.env)?);
        let store = FileStore::open(store_dir)
            .with_context(|| format!("Cannot open store directory {}", store_dir.display()))?;
        let client = Arc::new(SolanaClient::new(&network, config.clone()));
        Ok(Self {
            network,
            config,
            store,
            client,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage account: the settlement wallet
    fn account(&self) -> String {
        self.network.pubkey().to_string()
    }

    fn wallets(&self, extra: &[(EcosystemId, String)]) -> BTreeMap<EcosystemId, String> {
        let mut wallets = BTreeMap::from([(EcosystemId::Solana, self.account())]);
        wallets.extend(extra.iter().cloned());
        wallets
    }

    fn amount(&self, token_id: &str, value: Decimal) -> Result<Amount> {
        Ok(Amount::from_human(self.config.token(token_id)?.clone(), value))
    }

    async fn maths_for(&self, spec: &InteractionSpec) -> Result<Vec<PoolMath>> {
        let pools = route::required_pools(&self.config, spec)?;
        let bar = spinner("Reading pool state...");
        let maths = self.client.pool_maths(&pools).await;
        bar.finish_and_clear();
        maths
    }

    async fn single_pool_math(&self, pool_id: &str) -> Result<PoolMath> {
        let pool = self.config.pool(pool_id)?;
        let bar = spinner("Reading pool state...");
        let math = self.client.pool_math(pool).await;
        bar.finish_and_clear();
        math
    }

    fn load(&self, query: &str) -> Result<Interaction> {
        let interactions = persist::load_interactions(&self.store, &self.config, &self.account())?;
        find_interaction(&interactions, query)
    }

    fn save(&self, interaction: &Interaction) -> Result<()> {
        persist::store_interaction(&self.store, &self.config, &self.account(), interaction)?;
        Ok(())
    }

    fn driver(&self) -> Driver {
        Driver::new(self.config.clone(), Arc::new(OfflineBridge)).with_client(self.client.clone())
    }

    /// Rebuild the state of `interaction` from live pools and chain history
    async fn reload(&self, interaction: &Interaction) -> Result<InteractionState> {
        let maths = self.maths_for(&interaction.spec).await?;
        let bar = spinner("Scanning interaction history...");
        let result = async {
            let existing = self.client.existing_token_accounts(&self.account()).await?;
            let initial = persist::reload_state(&self.config, &maths, interaction, &existing, &[])?;
            anyhow::Ok(self.driver().sync(&initial).await?)
        }
        .await;
        bar.finish_and_clear();
        result
    }

    async fn submit(&self, spec: InteractionSpec, wallets: &[(EcosystemId, String)]) -> Result<()> {
        let maths = self.maths_for(&spec).await?;
        let interaction = Interaction::new(
            &self.config,
            spec,
            &self.wallets(wallets),
            chrono::Utc::now().timestamp_millis(),
        )?;
        let existing = self.client.existing_token_accounts(&self.account()).await?;
        let state = InteractionState::create(&self.config, &maths, &interaction, &existing)?;
        self.save(&interaction)?;

        println!("{} {}", "Stored interaction".bright_green(), interaction.id.to_string().bright_yellow());
        print_state(&state, &self.network);
        Ok(())
    }
}

// ============================================================================
// Submission
// ============================================================================

pub struct SwapArgs<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub amount: Decimal,
    pub min_output: Option<Decimal>,
    pub slippage: Decimal,
}

pub async fn swap(session: &Session, args: SwapArgs<'_>, wallets: &[(EcosystemId, String)]) -> Result<()> {
    println!("{}", "=== Swap ===".bright_green().bold());
    check_slippage(args.slippage)?;
    let exact_input_amount = session.amount(args.from, args.amount)?;

    let minimum_output_amount = match args.min_output {
        Some(minimum) => session.amount(args.to, minimum)?,
        None => {
            let probe = InteractionSpec::Swap {
                exact_input_amount: exact_input_amount.clone(),
                minimum_output_amount: session.amount(args.to, Decimal::ZERO)?,
            };
            let pools = route::required_pools(session.config(), &probe)?;
            let [pool] = pools.as_slice() else {
                anyhow::bail!("Swaps across two pools need an explicit --min-output");
            };
            let math = session.single_pool_math(&pool.id).await?;
            let mut inputs = vec![Decimal::ZERO; pool.tokens.len()];
            inputs[pool.token_index(args.from)?] = args.amount;
            let quote = math.swap_exact_input(&inputs, pool.token_index(args.to)?)?;
            let expected = session.amount(args.to, quote.stable_output_amount)?;
            println!("{} {}", "Expected Output:".bright_cyan(), expected);
            minimum_output_with_slippage(&expected, args.slippage)?
        }
    };
    println!("{} {}", "Input:".bright_cyan(), exact_input_amount);
    println!("{} {}", "Minimum Output:".bright_cyan(), minimum_output_amount);

    let spec = InteractionSpec::Swap {
        exact_input_amount,
        minimum_output_amount,
    };
    session.submit(spec, wallets).await
}

pub async fn add(
    session: &Session,
    pool_id: &str,
    amounts: &[Decimal],
    min_mint: Option<Decimal>,
    slippage: Decimal,
    lp_target: EcosystemId,
    wallets: &[(EcosystemId, String)],
) -> Result<()> {
    println!("{}", "=== Add Liquidity ===".bright_green().bold());
    check_slippage(slippage)?;
    let config = session.config();
    let pool = config.pool(pool_id)?;
    if amounts.len() != pool.tokens.len() {
        anyhow::bail!("Pool {} takes {} amounts", pool.id, pool.tokens.len());
    }
    let input_amounts = pool
        .tokens
        .iter()
        .zip(amounts)
        .map(|(token, value)| session.amount(token, *value))
        .collect::<Result<Vec<_>>>()?;

    let minimum_mint_amount = match min_mint {
        Some(minimum) => session.amount(&pool.lp_token, minimum)?,
        None => {
            let quote = session.single_pool_math(pool_id).await?.add(amounts)?;
            let expected = session.amount(&pool.lp_token, quote.lp_output_amount)?;
            println!("{} {}", "Expected LP:".bright_cyan(), expected);
            minimum_output_with_slippage(&expected, slippage)?
        }
    };
    println!("{} {}", "Minimum LP:".bright_cyan(), minimum_mint_amount);

    let spec = InteractionSpec::Add {
        pool_id: pool_id.to_string(),
        input_amounts,
        minimum_mint_amount,
        lp_token_target_ecosystem: lp_target,
    };
    session.submit(spec, wallets).await
}

pub async fn remove_uniform(
    session: &Session,
    pool_id: &str,
    burn: Decimal,
    slippage: Decimal,
    lp_source: EcosystemId,
    wallets: &[(EcosystemId, String)],
) -> Result<()> {
    println!("{}", "=== Remove Uniform ===".bright_green().bold());
    check_slippage(slippage)?;
    let pool = session.config().pool(pool_id)?;
    let outputs = session.single_pool_math(pool_id).await?.remove_uniform(burn)?;
    let minimum_output_amounts = pool
        .tokens
        .iter()
        .zip(outputs)
        .map(|(token, value)| Ok(minimum_output_with_slippage(&session.amount(token, value)?, slippage)?))
        .collect::<Result<Vec<_>>>()?;
    for minimum in &minimum_output_amounts {
        println!("{} {}", "Minimum Output:".bright_cyan(), minimum);
    }

    let spec = InteractionSpec::RemoveUniform {
        pool_id: pool_id.to_string(),
        exact_burn_amount: session.amount(&pool.lp_token, burn)?,
        minimum_output_amounts,
        lp_token_source_ecosystem: lp_source,
    };
    session.submit(spec, wallets).await
}

#[allow(clippy::too_many_arguments)]
pub async fn remove_exact_burn(
    session: &Session,
    pool_id: &str,
    burn: Decimal,
    output_token: &str,
    min_output: Option<Decimal>,
    slippage: Decimal,
    lp_source: EcosystemId,
    wallets: &[(EcosystemId, String)],
) -> Result<()> {
    println!("{}", "=== Remove Exact Burn ===".bright_green().bold());
    check_slippage(slippage)?;
    let pool = session.config().pool(pool_id)?;
    let minimum_output_amount = match min_output {
        Some(minimum) => session.amount(output_token, minimum)?,
        None => {
            let quote = session
                .single_pool_math(pool_id)
                .await?
                .remove_exact_burn(burn, pool.token_index(output_token)?)?;
            let expected = session.amount(output_token, quote.stable_output_amount)?;
            println!("{} {}", "Expected Output:".bright_cyan(), expected);
            minimum_output_with_slippage(&expected, slippage)?
        }
    };
    println!("{} {}", "Minimum Output:".bright_cyan(), minimum_output_amount);

    let spec = InteractionSpec::RemoveExactBurn {
        pool_id: pool_id.to_string(),
        exact_burn_amount: session.amount(&pool.lp_token, burn)?,
        minimum_output_amount,
        lp_token_source_ecosystem: lp_source,
    };
    session.submit(spec, wallets).await
}

pub async fn remove_exact_output(
    session: &Session,
    pool_id: &str,
    amounts: &[Decimal],
    max_burn: Option<Decimal>,
    slippage: Decimal,
    lp_source: EcosystemId,
    wallets: &[(EcosystemId, String)],
) -> Result<()> {
    println!("{}", "=== Remove Exact Output ===".bright_green().bold());
    check_slippage(slippage)?;
    let pool = session.config().pool(pool_id)?;
    if amounts.len() != pool.tokens.len() {
        anyhow::bail!("Pool {} takes {} amounts", pool.id, pool.tokens.len());
    }
    let exact_output_amounts = pool
        .tokens
        .iter()
        .zip(amounts)
        .map(|(token, value)| session.amount(token, *value))
        .collect::<Result<Vec<_>>>()?;

    let maximum_burn_amount = match max_burn {
        Some(maximum) => session.amount(&pool.lp_token, maximum)?,
        None => {
            let quote = session.single_pool_math(pool_id).await?.remove_exact_output(amounts)?;
            let expected = session.amount(&pool.lp_token, quote.lp_input_amount)?;
            println!("{} {}", "Expected Burn:".bright_cyan(), expected);
            expected.mul_scalar(Decimal::ONE + slippage)?
        }
    };
    println!("{} {}", "Maximum Burn:".bright_cyan(), maximum_burn_amount);

    let spec = InteractionSpec::RemoveExactOutput {
        pool_id: pool_id.to_string(),
        maximum_burn_amount,
        exact_output_amounts,
        lp_token_source_ecosystem: lp_source,
    };
    session.submit(spec, wallets).await
}

// ============================================================================
// Stored interactions
// ============================================================================

pub fn list(session: &Session) -> Result<()> {
    println!("{}", "=== Interactions ===".bright_green().bold());
    let interactions = persist::load_interactions(&session.store, session.config(), &session.account())?;
    if interactions.is_empty() {
        println!("{}", "No stored interactions".dimmed());
        return Ok(());
    }
    for interaction in interactions {
        println!(
            "{}  {:<20} {}  {}",
            interaction.id.to_string().bright_yellow(),
            interaction.kind().to_string(),
            format_time(interaction.submitted_at).dimmed(),
            interaction.pool_ids.join(" → ")
        );
    }
    Ok(())
}

pub async fn status(session: &Session, query: &str) -> Result<()> {
    let interaction = session.load(query)?;
    let state = session.reload(&interaction).await?;
    print_state(&state, &session.network);
    Ok(())
}

pub async fn retry(session: &Session, query: &str) -> Result<()> {
    println!("{}", "=== Retry Interaction ===".bright_green().bold());
    let interaction = session.load(query)?;
    let state = session.reload(&interaction).await?;
    let state = apply(&state, &Event::ErrorCleared)?;
    session.save(&state.interaction)?;
    println!("{}", "Error cleared".bright_green());
    print_state(&state, &session.network);
    Ok(())
}

pub async fn step(session: &Session, query: &str) -> Result<()> {
    println!("{}", "=== Step Interaction ===".bright_green().bold());
    let interaction = session.load(query)?;
    let state = session.reload(&interaction).await?;
    // the fresh signature-set keys may be used by this step
    session.save(&state.interaction)?;

    let (state, outcome) = session.driver().step(&state).await?;
    match &outcome {
        StepOutcome::Submitted(action) => println!("{} {}", "Submitted:".bright_green(), action),
        StepOutcome::AwaitingAttestation(action) => {
            println!("{} {}", "Waiting for attestation:".bright_yellow(), action)
        }
        StepOutcome::Failed(message) => println!("{} {}", "Failed:".bright_red(), message),
        StepOutcome::Done => println!("{}", "Interaction complete".bright_green()),
        StepOutcome::Cancelled => println!("{}", "Cancelled".dimmed()),
    }
    print_state(&state, &session.network);
    Ok(())
}

pub fn forget(session: &Session, query: &str) -> Result<()> {
    let interaction = session.load(query)?;
    let removed = persist::forget_interaction(&session.store, session.config(), &session.account(), &interaction.id)?;
    if removed {
        println!("{} {}", "Forgot interaction".bright_green(), interaction.id);
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn mark(done: bool) -> colored::ColoredString {
    if done {
        "✓".bright_green()
    } else {
        "·".dimmed()
    }
}

fn tx(tx_id: Option<&String>, network: &NetworkConfig) -> String {
    tx_id
        .map(|id| crate::client::format_signature(id, network.env.as_str()))
        .unwrap_or_default()
}

pub fn print_state(state: &InteractionState, network: &NetworkConfig) {
    let interaction = &state.interaction;
    println!("\n{} {}", "Interaction:".bright_cyan(), interaction.id.to_string().bright_yellow());
    println!("{} {}", "Kind:".bright_cyan(), interaction.kind());
    println!("{} {}", "Submitted:".bright_cyan(), format_time(interaction.submitted_at));
    println!("{} {}", "Pools:".bright_cyan(), interaction.pool_ids.join(" → "));
    println!("{} {}", "Settlement:".bright_cyan(), state.settlement_ecosystem);
    let status = match state.status() {
        Status::Completed => "completed".bright_green(),
        Status::Incomplete => "in progress".bright_yellow(),
        Status::Error => "error".bright_red(),
    };
    println!("{} {} ({})", "Status:".bright_cyan(), status, state.stage());
    if let Some(error) = &state.error {
        println!("{} {}", "Error:".bright_red(), error);
    }

    if !state.required_token_accounts.is_empty() {
        println!("\n{}", "Token Accounts".bold());
        for (mint, account) in &state.required_token_accounts {
            let note = if account.is_existing_account { "existing".to_string() } else { tx(account.tx_id.as_ref(), network) };
            println!("  {} {} {}", mark(account.is_complete()), mint, note);
        }
    }

    if !state.inbound_transfers.is_empty() {
        println!("\n{}", "Inbound Transfers".bold());
        for transfer in &state.inbound_transfers {
            println!(
                "  {} {} from {} {}",
                mark(transfer.is_complete()),
                transfer.value,
                transfer.from_ecosystem,
                tx(transfer.tx_ids.claim.as_ref(), network)
            );
        }
    }

    println!("\n{}", "Pool Operations".bold());
    for operation in &state.pool_operations {
        println!(
            "  {} {} {}",
            mark(operation.is_complete()),
            operation.operation,
            tx(operation.tx_id.as_ref(), network)
        );
    }

    if !state.outbound_transfers.is_empty() {
        println!("\n{}", "Outbound Transfers".bold());
        for transfer in &state.outbound_transfers {
            let value = transfer
                .value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("? {}", transfer.token.symbol));
            println!(
                "  {} {} to {} {}",
                mark(transfer.is_complete()),
                value,
                transfer.to_ecosystem,
                tx(transfer.tx_ids.transfer.as_ref(), network)
            );
        }
    }

    if let Some(action) = next_required_action(state) {
        println!("\n{} {}", "Next:".bright_yellow().bold(), action);
    }
}
