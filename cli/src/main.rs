//! Tidepool CLI - Stable-swap pools and cross-chain interactions
//!
//! Quotes pool operations with the stable-swap engine, reads live pool state
//! from Solana and tracks cross-chain interactions (swap, add, remove) from
//! submission to completion.

use clap::{Parser, Subcommand};
use colored::Colorize;
use interaction_model::EcosystemId;
use pool_math::Decimal;
use std::path::PathBuf;

mod client;
mod config;
mod interaction;
mod pool;
mod store;

use config::{expand_path, AppConfig, NetworkConfig, DEFAULT_POOLS_FILE, DEFAULT_STORE_DIR};
use interaction::{parse_wallet, Session, SwapArgs};
use pool::CurveArgs;

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(about = "Tidepool CLI - Stable-swap pools and cross-chain interactions", long_about = None)]
#[command(version)]
struct Cli {
    /// Network to connect to (localnet, devnet, mainnet-beta, custom)
    #[arg(short, long, default_value = "localnet")]
    network: String,

    /// RPC URL (overrides network default)
    #[arg(short, long)]
    url: Option<String>,

    /// Path to keypair file
    #[arg(short, long)]
    keypair: Option<PathBuf>,

    /// Tokens, pools and bridges of the deployment
    #[arg(short, long, default_value = DEFAULT_POOLS_FILE)]
    config: String,

    /// Directory holding stored interactions
    #[arg(long, default_value = DEFAULT_STORE_DIR)]
    store_dir: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pool math calculator and on-chain pool state
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Cross-chain interactions
    Interaction {
        #[command(subcommand)]
        command: InteractionCommands,
    },
}

#[derive(Subcommand)]
enum PoolCommands {
    /// Invariant depth and LP supply
    Depth {
        #[command(flatten)]
        curve: CurveArgs,
    },

    /// Marginal prices in units of the LP token
    Prices {
        #[command(flatten)]
        curve: CurveArgs,

        /// Use the numeric estimate instead of the closed form
        #[arg(long)]
        numeric: bool,
    },

    /// Price impact of an exact-input swap, in percent
    Impact {
        #[command(flatten)]
        curve: CurveArgs,

        /// Input amount
        #[arg(long)]
        amount: Decimal,

        /// Index of the token paid in
        #[arg(long)]
        input_index: usize,

        /// Index of the token received
        #[arg(long)]
        output_index: usize,
    },

    /// Quote adding liquidity
    Add {
        #[command(flatten)]
        curve: CurveArgs,

        /// Input amounts, one per pool token
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,
    },

    /// Quote a swap with exact inputs
    SwapIn {
        #[command(flatten)]
        curve: CurveArgs,

        /// Input amounts, zero at the output index
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,

        #[arg(long)]
        output_index: usize,
    },

    /// Quote a swap with exact outputs
    SwapOut {
        #[command(flatten)]
        curve: CurveArgs,

        #[arg(long)]
        input_index: usize,

        /// Output amounts, zero at the input index
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,
    },

    /// Quote a proportional withdrawal
    RemoveUniform {
        #[command(flatten)]
        curve: CurveArgs,

        /// LP amount burned
        #[arg(long)]
        burn: Decimal,
    },

    /// Quote burning an exact LP amount for one token
    RemoveBurn {
        #[command(flatten)]
        curve: CurveArgs,

        /// LP amount burned
        #[arg(long)]
        burn: Decimal,

        #[arg(long)]
        output_index: usize,
    },

    /// Quote withdrawing exact output amounts
    RemoveOutput {
        #[command(flatten)]
        curve: CurveArgs,

        /// Output amounts, one per pool token
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,
    },

    /// Live balances, depth and prices of a configured pool
    State {
        /// Pool id from the pools file
        pool_id: String,
    },
}

#[derive(Subcommand)]
enum InteractionCommands {
    /// Swap an exact input amount, across one or two pools
    Swap {
        /// Input token id
        #[arg(long)]
        from: String,

        /// Output token id
        #[arg(long)]
        to: String,

        /// Exact input amount
        #[arg(long)]
        amount: Decimal,

        /// Minimum output (defaults to the quote minus slippage)
        #[arg(long)]
        min_output: Option<Decimal>,

        /// Slippage fraction
        #[arg(long, default_value = "0.005")]
        slippage: Decimal,

        /// Wallet on another ecosystem, e.g. ethereum=0x...
        #[arg(long = "wallet", value_parser = parse_wallet)]
        wallets: Vec<(EcosystemId, String)>,
    },

    /// Add liquidity to a pool
    Add {
        #[arg(long)]
        pool: String,

        /// Input amounts, one per pool token
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,

        /// Minimum LP minted (defaults to the quote minus slippage)
        #[arg(long)]
        min_mint: Option<Decimal>,

        #[arg(long, default_value = "0.005")]
        slippage: Decimal,

        /// Ecosystem receiving the LP tokens
        #[arg(long, default_value = "solana")]
        lp_target: EcosystemId,

        #[arg(long = "wallet", value_parser = parse_wallet)]
        wallets: Vec<(EcosystemId, String)>,
    },

    /// Withdraw proportionally
    RemoveUniform {
        #[arg(long)]
        pool: String,

        /// LP amount burned
        #[arg(long)]
        burn: Decimal,

        #[arg(long, default_value = "0.005")]
        slippage: Decimal,

        /// Ecosystem holding the LP tokens
        #[arg(long, default_value = "solana")]
        lp_source: EcosystemId,

        #[arg(long = "wallet", value_parser = parse_wallet)]
        wallets: Vec<(EcosystemId, String)>,
    },

    /// Burn an exact LP amount for one token
    RemoveBurn {
        #[arg(long)]
        pool: String,

        /// LP amount burned
        #[arg(long)]
        burn: Decimal,

        /// Output token id
        #[arg(long)]
        output: String,

        /// Minimum output (defaults to the quote minus slippage)
        #[arg(long)]
        min_output: Option<Decimal>,

        #[arg(long, default_value = "0.005")]
        slippage: Decimal,

        #[arg(long, default_value = "solana")]
        lp_source: EcosystemId,

        #[arg(long = "wallet", value_parser = parse_wallet)]
        wallets: Vec<(EcosystemId, String)>,
    },

    /// Withdraw exact output amounts
    RemoveOutput {
        #[arg(long)]
        pool: String,

        /// Output amounts, one per pool token
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<Decimal>,

        /// Maximum LP burned (defaults to the quote plus slippage)
        #[arg(long)]
        max_burn: Option<Decimal>,

        #[arg(long, default_value = "0.005")]
        slippage: Decimal,

        #[arg(long, default_value = "solana")]
        lp_source: EcosystemId,

        #[arg(long = "wallet", value_parser = parse_wallet)]
        wallets: Vec<(EcosystemId, String)>,
    },

    /// Stored interactions, newest first
    List,

    /// Rebuild an interaction's progress from chain history
    Status {
        /// Interaction id or unique prefix
        id: String,
    },

    /// Clear a recorded error and issue fresh signature sets
    Retry {
        id: String,
    },

    /// Submit the next settlement-side transaction
    Step {
        id: String,
    },

    /// Remove a stored interaction
    Forget {
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }

    match cli.command {
        Commands::Pool { command } => run_pool(command, &cli.network, cli.url, cli.keypair, &cli.config).await,
        Commands::Interaction { command } => {
            let network = NetworkConfig::new(&cli.network, cli.url, cli.keypair)?;
            println!("{} {} ({})", "Network:".bright_cyan(), network.env, network.rpc_url);
            log::debug!("websocket endpoint {}", network.ws_url);
            let session = Session::open(network, &expand_path(&cli.config)?, &expand_path(&cli.store_dir)?)?;
            run_interaction(command, &session).await
        }
    }
}

async fn run_pool(
    command: PoolCommands,
    network: &str,
    url: Option<String>,
    keypair: Option<PathBuf>,
    pools_file: &str,
) -> anyhow::Result<()> {
    match command {
        PoolCommands::Depth { curve } => pool::show_depth(&curve),
        PoolCommands::Prices { curve, numeric } => pool::show_prices(&curve, numeric),
        PoolCommands::Impact {
            curve,
            amount,
            input_index,
            output_index,
        } => pool::show_impact(&curve, amount, input_index, output_index),
        PoolCommands::Add { curve, amounts } => pool::quote_add(&curve, &amounts),
        PoolCommands::SwapIn {
            curve,
            amounts,
            output_index,
        } => pool::quote_swap_in(&curve, &amounts, output_index),
        PoolCommands::SwapOut {
            curve,
            input_index,
            amounts,
        } => pool::quote_swap_out(&curve, input_index, &amounts),
        PoolCommands::RemoveUniform { curve, burn } => pool::quote_remove_uniform(&curve, burn),
        PoolCommands::RemoveBurn {
            curve,
            burn,
            output_index,
        } => pool::quote_remove_burn(&curve, burn, output_index),
        PoolCommands::RemoveOutput { curve, amounts } => pool::quote_remove_output(&curve, &amounts),
        PoolCommands::State { pool_id } => {
            let network = NetworkConfig::new(network, url, keypair)?;
            let config = std::sync::Arc::new(AppConfig::load(&expand_path(pools_file)?)?.into_config(network.env)?);
            let client = client::SolanaClient::new(&network, config.clone());
            pool::show_state(&client, &config, &pool_id).await
        }
    }
}

async fn run_interaction(command: InteractionCommands, session: &Session) -> anyhow::Result<()> {
    match command {
        InteractionCommands::Swap {
            from,
            to,
            amount,
            min_output,
            slippage,
            wallets,
        } => {
            let args = SwapArgs {
                from: &from,
                to: &to,
                amount,
                min_output,
                slippage,
            };
            interaction::swap(session, args, &wallets).await
        }
        InteractionCommands::Add {
            pool,
            amounts,
            min_mint,
            slippage,
            lp_target,
            wallets,
        } => interaction::add(session, &pool, &amounts, min_mint, slippage, lp_target, &wallets).await,
        InteractionCommands::RemoveUniform {
            pool,
            burn,
            slippage,
            lp_source,
            wallets,
        } => interaction::remove_uniform(session, &pool, burn, slippage, lp_source, &wallets).await,
        InteractionCommands::RemoveBurn {
            pool,
            burn,
            output,
            min_output,
            slippage,
            lp_source,
            wallets,
        } => {
            interaction::remove_exact_burn(session, &pool, burn, &output, min_output, slippage, lp_source, &wallets)
                .await
        }
        InteractionCommands::RemoveOutput {
            pool,
            amounts,
            max_burn,
            slippage,
            lp_source,
            wallets,
        } => interaction::remove_exact_output(session, &pool, &amounts, max_burn, slippage, lp_source, &wallets).await,
        InteractionCommands::List => interaction::list(session),
        InteractionCommands::Status { id } => interaction::status(session, &id).await,
        InteractionCommands::Retry { id } => interaction::retry(session, &id).await,
        InteractionCommands::Step { id } => interaction::step(session, &id).await,
        InteractionCommands::Forget { id } => interaction::forget(session, &id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_interaction_swap() {
        let cli = Cli::try_parse_from([
            "tidepool",
            "--network",
            "devnet",
            "interaction",
            "swap",
            "--from",
            "solana-usdc",
            "--to",
            "ethereum-usdt",
            "--amount",
            "10",
            "--wallet",
            "ethereum=0xAbC",
        ])
        .unwrap();
        match cli.command {
            Commands::Interaction {
                command: InteractionCommands::Swap { amount, wallets, slippage, .. },
            } => {
                assert_eq!(amount, Decimal::from(10));
                assert_eq!(slippage, Decimal::new(5, 3));
                assert_eq!(wallets, vec![(EcosystemId::Ethereum, "0xAbC".to_string())]);
            }
            _ => panic!("expected interaction swap"),
        }
    }

    #[test]
    fn test_parse_pool_calculator() {
        let cli = Cli::try_parse_from([
            "tidepool",
            "pool",
            "swap-in",
            "--balances",
            "1000,2000",
            "--amounts",
            "5,0",
            "--output-index",
            "1",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pool {
                command: PoolCommands::SwapIn { output_index: 1, .. }
            }
        ));
    }
}
