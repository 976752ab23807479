//! Pool Math - Stable-swap invariant engine
//!
//! This crate contains the bonding-curve math of a multi-token liquidity pool:
//! a hybrid constant-sum/constant-product invariant (amp factor > 0) that
//! degenerates into a pure constant-product invariant when the amp factor is 0.
//!
//! Everything is pure: a [`PoolMath`] instance is a snapshot of one pool's
//! balances, LP supply and fee configuration. Callers rebuild it from fresh
//! balances after applying a result.

pub mod math;

pub use math::{
    AddResult, PoolMath, PoolParams, RemoveExactBurnResult, RemoveExactOutputResult,
    SwapExactInputResult, SwapExactOutputResult,
};
pub use rust_decimal::Decimal;

/// Maximum number of tokens a single pool can hold
pub const MAX_TOKEN_COUNT: usize = 20;

/// Minimum number of tokens a single pool can hold
pub const MIN_TOKEN_COUNT: usize = 2;

/// Lower bound of the amp factor (0 is also accepted and selects constant product)
pub const MIN_AMP_FACTOR: u32 = 1;

/// Upper bound of the amp factor
pub const MAX_AMP_FACTOR: u32 = 1_000_000;

/// Default solver maximum iteration count
pub const DEFAULT_MAX_ITERATIONS: u32 = 200;

/// Error types for pool math operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolMathError {
    /// Amp factor outside of [1, 1e6] and not 0
    #[error("amp factor must be in range [1, 1000000] or 0 but was {0}")]
    InvalidAmpFactor(Decimal),
    /// LP fee outside of [0, 1)
    #[error("lp fee must be in range [0, 1) but was {0}")]
    InvalidLpFee(Decimal),
    /// Governance fee outside of [0, 1)
    #[error("governance fee must be in range [0, 1) but was {0}")]
    InvalidGovernanceFee(Decimal),
    /// LP fee plus governance fee is not below 1
    #[error("total fee must be in range [0, 1) but was {0}")]
    InvalidTotalFee(Decimal),
    /// Negative solver tolerance
    #[error("tolerance must be non-negative but was {0}")]
    InvalidTolerance(Decimal),
    /// Zero iteration budget
    #[error("max iterations must be positive")]
    InvalidMaxIterations,
    /// Token count outside of [2, 20]
    #[error("token count must be in range [2, 20] but was {0}")]
    InvalidTokenCount(usize),
    /// An amount or balance was negative
    #[error("amounts have to be non-negative")]
    NegativeAmount,
    /// Some balances are zero and some are not
    #[error("either all balances are zero or none are")]
    MixedZeroBalances,
    /// LP supply inconsistent with the balances
    #[error("invalid lp supply {0}")]
    InvalidLpSupply(Decimal),
    /// Amount vector length does not match the token count
    #[error("expected {expected} amounts but got {actual}")]
    WrongAmountCount { expected: usize, actual: usize },
    /// Token index out of bounds
    #[error("invalid token index {0}")]
    InvalidIndex(usize),
    /// The swap's designated output (or input) index carried a non-zero amount
    #[error("amount at swapped index {0} must be zero")]
    NonZeroSwapIndex(usize),
    /// The first deposit into an empty pool must contain every token
    #[error("on first add all amounts must be greater than zero")]
    FirstAddRequiresPositiveAmounts,
    /// Requested amounts would drain a balance to zero or below
    #[error("amount exceeds available balance")]
    ExceedsBalance,
    /// Burn amount larger than the LP supply
    #[error("burn amount {burn} exceeds lp supply {lp_supply}")]
    BurnExceedsSupply { burn: Decimal, lp_supply: Decimal },
    /// Fees would drive a post-remove balance non-positive
    #[error("impossible remove due to fees")]
    ImpossibleRemove,
    /// Solver did not converge
    #[error("{function} failed to converge within {max_iterations} iterations and tolerance {tolerance}")]
    NoConvergence {
        function: &'static str,
        max_iterations: u32,
        tolerance: Decimal,
    },
    /// Swaps and prices need liquidity
    #[error("operation requires a non-empty pool")]
    EmptyPool,
    /// Marginal price epsilon was not positive
    #[error("epsilon must be a small positive value but was {0}")]
    InvalidEpsilon(Decimal),
    /// Arithmetic overflow or division by zero
    #[error("arithmetic overflow")]
    Overflow,
}
