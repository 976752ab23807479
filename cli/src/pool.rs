//! Pool calculator and on-chain pool state

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use interaction_model::Config;
use pool_math::{Decimal, PoolMath, PoolParams};

use crate::client::SolanaClient;

/// Curve snapshot given on the command line
#[derive(Args, Debug, Clone)]
pub struct CurveArgs {
    /// Pool balances in human units, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub balances: Vec<Decimal>,

    /// Amplification factor (0 selects constant product)
    #[arg(long, default_value = "1000")]
    pub amp: Decimal,

    /// LP fee fraction
    #[arg(long, default_value = "0.0003")]
    pub lp_fee: Decimal,

    /// Governance fee fraction
    #[arg(long, default_value = "0.0001")]
    pub governance_fee: Decimal,

    /// Outstanding LP supply (defaults to the pool depth)
    #[arg(long)]
    pub lp_supply: Option<Decimal>,
}

impl CurveArgs {
    pub fn pool_math(&self) -> Result<PoolMath> {
        let params = PoolParams::new(self.amp, self.lp_fee, self.governance_fee);
        PoolMath::new(self.balances.clone(), params, self.lp_supply).context("Invalid pool")
    }
}

fn check_len(what: &str, amounts: &[Decimal], pool: &PoolMath) -> Result<()> {
    if amounts.len() != pool.token_count() {
        anyhow::bail!(
            "Expected {} {} for a {}-token pool but got {}",
            pool.token_count(),
            what,
            pool.token_count(),
            amounts.len()
        );
    }
    Ok(())
}

fn join(values: &[Decimal]) -> String {
    values
        .iter()
        .map(|v| v.normalize().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_pool(pool: &PoolMath) {
    println!("{} [{}]", "Balances:".bright_cyan(), join(pool.balances()));
    println!("{} {}", "Depth:".bright_cyan(), pool.depth().normalize());
    println!("{} {}", "LP Supply:".bright_cyan(), pool.lp_supply().normalize());
    println!(
        "{} {} ({} lp + {} governance)",
        "Total Fee:".bright_cyan(),
        pool.total_fee().normalize(),
        pool.params().lp_fee.normalize(),
        pool.params().governance_fee.normalize()
    );
}

// ============================================================================
// Calculator
// ============================================================================

pub fn show_depth(curve: &CurveArgs) -> Result<()> {
    println!("{}", "=== Pool Depth ===".bright_green().bold());
    let pool = curve.pool_math()?;
    print_pool(&pool);
    Ok(())
}

pub fn show_prices(curve: &CurveArgs, numeric: bool) -> Result<()> {
    println!("{}", "=== Marginal Prices ===".bright_green().bold());
    let pool = curve.pool_math()?;
    let prices = if numeric {
        pool.marginal_prices(None)?
    } else {
        pool.analytic_marginal_prices()?
    };
    print_pool(&pool);
    for (index, price) in prices.iter().enumerate() {
        println!("  {} {}", format!("Token {}:", index).bright_cyan(), price.round_dp(12).normalize());
    }
    Ok(())
}

pub fn show_impact(curve: &CurveArgs, amount: Decimal, input_index: usize, output_index: usize) -> Result<()> {
    println!("{}", "=== Price Impact ===".bright_green().bold());
    let pool = curve.pool_math()?;
    let impact = pool.price_impact(amount, input_index, output_index)?;
    println!("{} {} of token {}", "Input:".bright_cyan(), amount.normalize(), input_index);
    println!("{} token {}", "Output:".bright_cyan(), output_index);
    println!("{} {}%", "Impact:".bright_yellow(), impact.round_dp(6).normalize());
    Ok(())
}

pub fn quote_add(curve: &CurveArgs, amounts: &[Decimal]) -> Result<()> {
    println!("{}", "=== Add Liquidity ===".bright_green().bold());
    let pool = curve.pool_math()?;
    check_len("amounts", amounts, &pool)?;
    let result = pool.add(amounts)?;
    println!("{} [{}]", "Inputs:".bright_cyan(), join(amounts));
    println!("{} {}", "LP Minted:".bright_green(), result.lp_output_amount.normalize());
    println!("{} {}", "Governance Mint:".dimmed(), result.governance_mint_amount.normalize());
    Ok(())
}

pub fn quote_swap_in(curve: &CurveArgs, amounts: &[Decimal], output_index: usize) -> Result<()> {
    println!("{}", "=== Swap Exact Input ===".bright_green().bold());
    let pool = curve.pool_math()?;
    check_len("amounts", amounts, &pool)?;
    let result = pool.swap_exact_input(amounts, output_index)?;
    println!("{} [{}]", "Inputs:".bright_cyan(), join(amounts));
    println!(
        "{} {} of token {}",
        "Output:".bright_green(),
        result.stable_output_amount.normalize(),
        output_index
    );
    println!("{} {}", "Governance Mint:".dimmed(), result.governance_mint_amount.normalize());
    Ok(())
}

pub fn quote_swap_out(curve: &CurveArgs, input_index: usize, amounts: &[Decimal]) -> Result<()> {
    println!("{}", "=== Swap Exact Output ===".bright_green().bold());
    let pool = curve.pool_math()?;
    check_len("amounts", amounts, &pool)?;
    let result = pool.swap_exact_output(input_index, amounts)?;
    println!("{} [{}]", "Outputs:".bright_cyan(), join(amounts));
    println!(
        "{} {} of token {}",
        "Input:".bright_green(),
        result.stable_input_amount.normalize(),
        input_index
    );
    println!("{} {}", "Governance Mint:".dimmed(), result.governance_mint_amount.normalize());
    Ok(())
}

pub fn quote_remove_uniform(curve: &CurveArgs, burn: Decimal) -> Result<()> {
    println!("{}", "=== Remove Uniform ===".bright_green().bold());
    let pool = curve.pool_math()?;
    let outputs = pool.remove_uniform(burn)?;
    println!("{} {}", "LP Burned:".bright_cyan(), burn.normalize());
    println!("{} [{}]", "Outputs:".bright_green(), join(&outputs));
    Ok(())
}

pub fn quote_remove_burn(curve: &CurveArgs, burn: Decimal, output_index: usize) -> Result<()> {
    println!("{}", "=== Remove Exact Burn ===".bright_green().bold());
    let pool = curve.pool_math()?;
    let result = pool.remove_exact_burn(burn, output_index)?;
    println!("{} {}", "LP Burned:".bright_cyan(), burn.normalize());
    println!(
        "{} {} of token {}",
        "Output:".bright_green(),
        result.stable_output_amount.normalize(),
        output_index
    );
    println!("{} {}", "Governance Mint:".dimmed(), result.governance_mint_amount.normalize());
    Ok(())
}

pub fn quote_remove_output(curve: &CurveArgs, amounts: &[Decimal]) -> Result<()> {
    println!("{}", "=== Remove Exact Output ===".bright_green().bold());
    let pool = curve.pool_math()?;
    check_len("amounts", amounts, &pool)?;
    let result = pool.remove_exact_output(amounts)?;
    println!("{} [{}]", "Outputs:".bright_cyan(), join(amounts));
    println!("{} {}", "LP Burned:".bright_green(), result.lp_input_amount.normalize());
    println!("{} {}", "Governance Mint:".dimmed(), result.governance_mint_amount.normalize());
    Ok(())
}

// ============================================================================
// On-chain state
// ============================================================================

pub async fn show_state(client: &SolanaClient, config: &Config, pool_id: &str) -> Result<()> {
    println!("{}", "=== Pool State ===".bright_green().bold());
    let spec = config.pool(pool_id)?;
    println!("{} {}", "Pool:".bright_cyan(), spec.id);
    println!("{} {}", "Address:".bright_cyan(), spec.address);
    println!("{} {}", "Tokens:".bright_cyan(), spec.tokens.join(", "));

    let pool = client.pool_math(spec).await?;
    print_pool(&pool);
    if !pool.is_empty() {
        let prices = pool.analytic_marginal_prices()?;
        for (token, price) in spec.tokens.iter().zip(prices) {
            println!("  {} {}", format!("{}:", token).bright_cyan(), price.round_dp(12).normalize());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(balances: &[i64]) -> CurveArgs {
        CurveArgs {
            balances: balances.iter().map(|b| Decimal::from(*b)).collect(),
            amp: Decimal::from(1000),
            lp_fee: Decimal::new(3, 4),
            governance_fee: Decimal::new(1, 4),
            lp_supply: None,
        }
    }

    #[test]
    fn test_curve_args_build_pool() {
        let pool = curve(&[1_000_000, 1_000_000, 1_000_000]).pool_math().unwrap();
        assert_eq!(pool.token_count(), 3);
        assert_eq!(pool.lp_supply(), pool.depth());
    }

    #[test]
    fn test_invalid_curve_rejected() {
        let mut args = curve(&[1_000_000, 1_000_000]);
        args.lp_fee = Decimal::ONE;
        assert!(args.pool_math().is_err());
    }

    #[test]
    fn test_amount_count_must_match_pool() {
        let pool = curve(&[1_000_000, 1_000_000]).pool_math().unwrap();
        assert!(check_len("amounts", &[Decimal::ONE], &pool).is_err());
        assert!(check_len("amounts", &[Decimal::ONE, Decimal::ZERO], &pool).is_ok());
    }

    #[test]
    fn test_quotes_run() {
        let args = curve(&[1_000_000, 1_000_000]);
        let amounts = [Decimal::from(100), Decimal::ZERO];
        quote_add(&args, &amounts).unwrap();
        quote_swap_in(&args, &amounts, 1).unwrap();
        quote_remove_uniform(&args, Decimal::from(100)).unwrap();
        quote_remove_burn(&args, Decimal::from(100), 0).unwrap();
        assert!(quote_swap_in(&args, &amounts[..1], 1).is_err());
    }
}
