//! Stable-swap invariant math
//!
//! Balances may use any unit as long as the tolerance matches it: atomic
//! units go well with a tolerance of 1, human units with the smallest decimal
//! step of the involved tokens.
//!
//! The amp factor is given in "pool units" (A·nⁿ). Divide by the token count to
//! get the A·nⁿ⁻¹ convention used by some other stable-swap implementations.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::{
    PoolMathError, DEFAULT_MAX_ITERATIONS, MAX_AMP_FACTOR, MAX_TOKEN_COUNT, MIN_AMP_FACTOR,
    MIN_TOKEN_COUNT,
};

type Result<T> = core::result::Result<T, PoolMathError>;

/// Default absolute tolerance of the fixed-point solvers (1e-6)
const DEFAULT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Default perturbation used by [`PoolMath::marginal_prices`] (0.1)
const DEFAULT_MARGINAL_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// A converged depth that is not positive is replaced by tolerance / 10
const EPSILON_TOLERANCE_DIVISOR: Decimal = Decimal::TEN;

/// Relative step size at which the n-th root refinement stops (1e-24)
const ROOT_PRECISION: Decimal = Decimal::from_parts(1, 0, 0, false, 24);

const ROOT_MAX_ITERATIONS: usize = 100;

// ============================================================================
// Checked arithmetic
// ============================================================================

mod checked {
    use super::{PoolMathError, Result};
    use rust_decimal::Decimal;

    pub fn add(a: Decimal, b: Decimal) -> Result<Decimal> {
        a.checked_add(b).ok_or(PoolMathError::Overflow)
    }

    pub fn sub(a: Decimal, b: Decimal) -> Result<Decimal> {
        a.checked_sub(b).ok_or(PoolMathError::Overflow)
    }

    pub fn mul(a: Decimal, b: Decimal) -> Result<Decimal> {
        a.checked_mul(b).ok_or(PoolMathError::Overflow)
    }

    pub fn div(a: Decimal, b: Decimal) -> Result<Decimal> {
        a.checked_div(b).ok_or(PoolMathError::Overflow)
    }

    pub fn sum(values: &[Decimal]) -> Result<Decimal> {
        values.iter().try_fold(Decimal::ZERO, |acc, v| add(acc, *v))
    }

    /// `keep_order ? a - b : b - a`
    pub fn sub_given_order(keep_order: bool, a: Decimal, b: Decimal) -> Result<Decimal> {
        if keep_order {
            sub(a, b)
        } else {
            sub(b, a)
        }
    }
}

// ============================================================================
// Parameters and results
// ============================================================================

/// Curve and solver configuration of a pool
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolParams {
    /// Amp factor in [1, 1e6], or 0 for constant product
    pub amp_factor: Decimal,
    /// Fraction of every taxed amount that stays in the pool for LPs
    pub lp_fee: Decimal,
    /// Fraction of every taxed amount minted as LP tokens to governance
    pub governance_fee: Decimal,
    /// Absolute convergence tolerance of the solvers
    pub tolerance: Decimal,
    /// Iteration budget of the solvers
    pub max_iterations: u32,
}

impl PoolParams {
    pub fn new(amp_factor: Decimal, lp_fee: Decimal, governance_fee: Decimal) -> Self {
        Self {
            amp_factor,
            lp_fee,
            governance_fee,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// LP fee plus governance fee
    pub fn total_fee(&self) -> Decimal {
        self.lp_fee + self.governance_fee
    }

    fn validate(&self) -> Result<()> {
        let amp = self.amp_factor;
        if !amp.is_zero()
            && (amp < Decimal::from(MIN_AMP_FACTOR) || amp > Decimal::from(MAX_AMP_FACTOR))
        {
            return Err(PoolMathError::InvalidAmpFactor(amp));
        }
        if self.lp_fee < Decimal::ZERO || self.lp_fee >= Decimal::ONE {
            return Err(PoolMathError::InvalidLpFee(self.lp_fee));
        }
        if self.governance_fee < Decimal::ZERO || self.governance_fee >= Decimal::ONE {
            return Err(PoolMathError::InvalidGovernanceFee(self.governance_fee));
        }
        let total = checked::add(self.lp_fee, self.governance_fee)?;
        if total >= Decimal::ONE {
            return Err(PoolMathError::InvalidTotalFee(total));
        }
        if self.tolerance < Decimal::ZERO {
            return Err(PoolMathError::InvalidTolerance(self.tolerance));
        }
        if self.max_iterations == 0 {
            return Err(PoolMathError::InvalidMaxIterations);
        }
        Ok(())
    }
}

/// Result of [`PoolMath::add`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddResult {
    pub lp_output_amount: Decimal,
    pub governance_mint_amount: Decimal,
}

/// Result of [`PoolMath::swap_exact_input`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapExactInputResult {
    pub stable_output_amount: Decimal,
    pub governance_mint_amount: Decimal,
}

/// Result of [`PoolMath::swap_exact_output`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapExactOutputResult {
    pub stable_input_amount: Decimal,
    pub governance_mint_amount: Decimal,
}

/// Result of [`PoolMath::remove_exact_burn`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoveExactBurnResult {
    pub stable_output_amount: Decimal,
    pub governance_mint_amount: Decimal,
}

/// Result of [`PoolMath::remove_exact_output`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoveExactOutputResult {
    pub lp_input_amount: Decimal,
    pub governance_mint_amount: Decimal,
}

// ============================================================================
// PoolMath
// ============================================================================

/// Snapshot of one pool's curve state
///
/// Invariants enforced at construction:
/// - 2 ≤ token count ≤ 20
/// - balances are either all zero (empty pool, zero LP supply) or all positive
/// - LP supply is zero iff balances are zero
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMath {
    balances: Vec<Decimal>,
    lp_supply: Decimal,
    depth: Decimal,
    params: PoolParams,
}

impl PoolMath {
    /// Build a pool from explicit balances
    ///
    /// # Arguments
    /// * `balances` - Current pool balances, one per token
    /// * `params` - Curve and solver configuration
    /// * `lp_supply` - Outstanding LP tokens, defaults to the depth of `balances`
    ///
    /// # Returns
    /// * `PoolMath` ready for quoting
    /// * `PoolMathError` if the parameters or balances violate an invariant
    pub fn new(
        balances: Vec<Decimal>,
        params: PoolParams,
        lp_supply: Option<Decimal>,
    ) -> Result<Self> {
        params.validate()?;
        check_token_count(balances.len())?;
        check_non_negative(&balances)?;

        let mut pool = Self {
            balances,
            lp_supply: Decimal::ZERO,
            depth: Decimal::ZERO,
            params,
        };

        if pool.balances.iter().any(Decimal::is_zero) {
            if pool.balances.iter().any(|b| !b.is_zero()) {
                return Err(PoolMathError::MixedZeroBalances);
            }
            if let Some(lp) = lp_supply {
                if !lp.is_zero() {
                    return Err(PoolMathError::InvalidLpSupply(lp));
                }
            }
            return Ok(pool);
        }

        pool.depth = pool.compute_depth(&pool.balances, None)?;
        pool.lp_supply = match lp_supply {
            Some(lp) if lp <= Decimal::ZERO => return Err(PoolMathError::InvalidLpSupply(lp)),
            Some(lp) => lp,
            None => pool.depth,
        };
        Ok(pool)
    }

    /// Build an empty pool (all balances and LP supply zero)
    pub fn empty(token_count: usize, params: PoolParams) -> Result<Self> {
        params.validate()?;
        check_token_count(token_count)?;
        Ok(Self {
            balances: vec![Decimal::ZERO; token_count],
            lp_supply: Decimal::ZERO,
            depth: Decimal::ZERO,
            params,
        })
    }

    pub fn balances(&self) -> &[Decimal] {
        &self.balances
    }

    pub fn lp_supply(&self) -> Decimal {
        self.lp_supply
    }

    pub fn params(&self) -> &PoolParams {
        &self.params
    }

    pub fn token_count(&self) -> usize {
        self.balances.len()
    }

    pub fn total_fee(&self) -> Decimal {
        self.params.total_fee()
    }

    /// Invariant-implied total value of the pool
    pub fn depth(&self) -> Decimal {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.lp_supply.is_zero()
    }

    // ------------------------------------------------------------------------
    // Pool operations
    // ------------------------------------------------------------------------

    /// Quote a deposit
    ///
    /// On an empty pool every amount must be positive and the LP output equals
    /// the depth of the deposit. Otherwise only the imbalanced portion of the
    /// deposit (the part exceeding its scale-neutral share) is taxed.
    pub fn add(&self, input_amounts: &[Decimal]) -> Result<AddResult> {
        self.check_amount_count(input_amounts)?;
        if self.is_empty() {
            check_non_negative(input_amounts)?;
            if input_amounts.iter().any(Decimal::is_zero) {
                return Err(PoolMathError::FirstAddRequiresPositiveAmounts);
            }
            return Ok(AddResult {
                lp_output_amount: self.compute_depth(input_amounts, None)?,
                governance_mint_amount: Decimal::ZERO,
            });
        }
        let (lp_output_amount, governance_mint_amount) = self.add_remove(true, input_amounts)?;
        Ok(AddResult {
            lp_output_amount,
            governance_mint_amount,
        })
    }

    /// Quote a swap with exact input amounts
    ///
    /// The fee is taken from the input side before conversion.
    ///
    /// # Arguments
    /// * `input_amounts` - Amounts paid in, zero at `output_index`
    /// * `output_index` - Token received
    pub fn swap_exact_input(
        &self,
        input_amounts: &[Decimal],
        output_index: usize,
    ) -> Result<SwapExactInputResult> {
        let (stable_output_amount, governance_mint_amount) =
            self.swap(true, input_amounts, output_index)?;
        Ok(SwapExactInputResult {
            stable_output_amount,
            governance_mint_amount,
        })
    }

    /// Quote a swap with exact output amounts
    ///
    /// The fee-free input is grossed up by 1 / (1 - fee), so that feeding the
    /// result of [`PoolMath::swap_exact_input`] back in recovers the input.
    ///
    /// # Arguments
    /// * `input_index` - Token paid in
    /// * `output_amounts` - Amounts received, zero at `input_index`
    pub fn swap_exact_output(
        &self,
        input_index: usize,
        output_amounts: &[Decimal],
    ) -> Result<SwapExactOutputResult> {
        let (stable_input_amount, governance_mint_amount) =
            self.swap(false, output_amounts, input_index)?;
        Ok(SwapExactOutputResult {
            stable_input_amount,
            governance_mint_amount,
        })
    }

    /// Proportional withdrawal, no fee
    pub fn remove_uniform(&self, burn_amount: Decimal) -> Result<Vec<Decimal>> {
        self.check_burn_amount(burn_amount)?;
        if burn_amount.is_zero() {
            return Ok(vec![Decimal::ZERO; self.token_count()]);
        }
        let fraction = checked::div(burn_amount, self.lp_supply)?;
        self.balances
            .iter()
            .map(|b| checked::mul(*b, fraction))
            .collect()
    }

    /// Quote burning an exact LP amount for a single token
    ///
    /// The withdrawal is treated as the imbalanced claim it is: the taxable
    /// fraction is everything but the token's own share of the pool.
    pub fn remove_exact_burn(
        &self,
        burn_amount: Decimal,
        output_index: usize,
    ) -> Result<RemoveExactBurnResult> {
        self.check_index(output_index)?;
        self.check_burn_amount(burn_amount)?;
        if burn_amount.is_zero() {
            return Ok(RemoveExactBurnResult {
                stable_output_amount: Decimal::ZERO,
                governance_mint_amount: Decimal::ZERO,
            });
        }

        let initial_depth = self.depth;
        let updated_lp_supply = checked::sub(self.lp_supply, burn_amount)?;
        let updated_depth = checked::mul(
            initial_depth,
            checked::div(updated_lp_supply, self.lp_supply)?,
        )?;
        let known_balances = self.balances_without(output_index);
        let output_balance = self.balances[output_index];
        let missing_balance =
            self.compute_missing_balance(&known_balances, updated_depth, Some(output_balance))?;
        let feeless_amount = checked::sub(output_balance, missing_balance)?;

        let total_fee = self.total_fee();
        if total_fee.is_zero() {
            return Ok(RemoveExactBurnResult {
                stable_output_amount: feeless_amount,
                governance_mint_amount: Decimal::ZERO,
            });
        }

        let taxable_fraction = checked::sub(
            Decimal::ONE,
            checked::div(output_balance, checked::sum(&self.balances)?)?,
        )?;
        let fee = remove_fee(total_fee)?;
        let original_amount = checked::div(
            feeless_amount,
            checked::add(checked::mul(taxable_fraction, fee)?, Decimal::ONE)?,
        )?;
        let fee_amount = checked::mul(fee, checked::mul(original_amount, taxable_fraction)?)?;
        let stable_output_amount = checked::sub(feeless_amount, fee_amount)?;

        let mut final_balances = self.balances.clone();
        final_balances[output_index] = checked::sub(output_balance, stable_output_amount)?;
        let final_depth = self.compute_depth(&final_balances, Some(updated_depth))?;
        let total_fee_depth = checked::sub(final_depth, updated_depth)?;
        let governance_depth = self.governance_share(total_fee_depth)?;
        let lp_depth = checked::sub(
            checked::add(updated_depth, total_fee_depth)?,
            governance_depth,
        )?;
        let governance_mint_amount = checked::mul(
            governance_depth,
            checked::div(updated_lp_supply, lp_depth)?,
        )?;

        Ok(RemoveExactBurnResult {
            stable_output_amount,
            governance_mint_amount,
        })
    }

    /// Quote withdrawing exact token amounts for the LP they cost
    pub fn remove_exact_output(&self, output_amounts: &[Decimal]) -> Result<RemoveExactOutputResult> {
        self.check_amount_count(output_amounts)?;
        let (lp_input_amount, governance_mint_amount) = self.add_remove(false, output_amounts)?;
        Ok(RemoveExactOutputResult {
            lp_input_amount,
            governance_mint_amount,
        })
    }

    // ------------------------------------------------------------------------
    // Prices
    // ------------------------------------------------------------------------

    /// Marginal price of every token, in depth units, estimated by a centered
    /// difference quotient of the depth function
    ///
    /// # Arguments
    /// * `epsilon` - Perturbation applied to each balance (default 0.1)
    pub fn marginal_prices(&self, epsilon: Option<Decimal>) -> Result<Vec<Decimal>> {
        let epsilon = epsilon.unwrap_or(DEFAULT_MARGINAL_EPSILON);
        if epsilon <= Decimal::ZERO {
            return Err(PoolMathError::InvalidEpsilon(epsilon));
        }
        self.check_not_empty()?;

        let depth = self.depth;
        let two_eps = checked::mul(epsilon, Decimal::TWO)?;
        (0..self.token_count())
            .map(|i| {
                let mut lower_balances = self.balances.clone();
                lower_balances[i] = checked::sub(lower_balances[i], epsilon)?;
                let mut upper_balances = self.balances.clone();
                upper_balances[i] = checked::add(upper_balances[i], epsilon)?;

                let lower = checked::sub(depth, self.compute_depth(&lower_balances, Some(depth))?)?;
                let upper = checked::sub(self.compute_depth(&upper_balances, Some(depth))?, depth)?;
                checked::div(checked::add(lower, upper)?, two_eps)
            })
            .collect()
    }

    /// Marginal price of every token priced in LP tokens, from the closed-form
    /// partial derivatives of the invariant
    pub fn analytic_marginal_prices(&self) -> Result<Vec<Decimal>> {
        self.check_not_empty()?;
        let n = Decimal::from(self.token_count());
        let depth = self.depth;

        if self.params.amp_factor.is_zero() {
            // ∂depth/∂b_j = depth / (n·b_j), then priced in lp via depth / lp_supply
            let fixed = checked::div(
                checked::div(checked::mul(depth, depth)?, self.lp_supply)?,
                n,
            )?;
            return self
                .balances
                .iter()
                .map(|b| checked::div(fixed, *b))
                .collect();
        }

        let reciprocal_decay = self.reciprocal_decay(depth, &self.balances)?;
        let fixed1 = checked::mul(depth, reciprocal_decay)?;
        let denominator = checked::add(
            checked::sub(self.params.amp_factor, Decimal::ONE)?,
            checked::mul(reciprocal_decay, checked::add(n, Decimal::ONE)?)?,
        )?;
        let priced_in_lp = checked::div(depth, self.lp_supply)?;
        let fixed2 = checked::div(denominator, priced_in_lp)?;
        self.balances
            .iter()
            .map(|b| {
                checked::div(
                    checked::add(self.params.amp_factor, checked::div(fixed1, *b)?)?,
                    fixed2,
                )
            })
            .collect()
    }

    /// Price impact of an exact-input swap, in percent
    ///
    /// Compares the marginal-price extrapolation of the (fee-adjusted) input
    /// against the actual swap output.
    pub fn price_impact(
        &self,
        input_amount: Decimal,
        input_index: usize,
        output_index: usize,
    ) -> Result<Decimal> {
        self.check_index(input_index)?;
        self.check_index(output_index)?;
        let prices = self.analytic_marginal_prices()?;
        let marginal_price = checked::div(prices[input_index], prices[output_index])?;
        let extrapolated_output = checked::mul(
            checked::mul(input_amount, checked::sub(Decimal::ONE, self.total_fee())?)?,
            marginal_price,
        )?;

        let mut input_amounts = vec![Decimal::ZERO; self.token_count()];
        input_amounts[input_index] = input_amount;
        let actual_output = self
            .swap_exact_input(&input_amounts, output_index)?
            .stable_output_amount;

        checked::mul(
            checked::div(
                checked::sub(extrapolated_output, actual_output)?,
                extrapolated_output,
            )?,
            Decimal::ONE_HUNDRED,
        )
    }

    // ------------------------------------------------------------------------
    // Solvers
    // ------------------------------------------------------------------------

    /// Solve the invariant for the depth of `balances`
    ///
    /// Fixed-point iteration starting from `initial_guess` (or the balance sum)
    /// that stops once successive iterates differ by at most the tolerance.
    ///
    /// # Returns
    /// * Depth of the balances (tolerance / 10 if the iteration lands on a
    ///   non-positive value)
    /// * `PoolMathError::NoConvergence` when the iteration budget is exhausted
    pub fn compute_depth(
        &self,
        balances: &[Decimal],
        initial_guess: Option<Decimal>,
    ) -> Result<Decimal> {
        let n = Decimal::from(balances.len());
        if self.params.amp_factor.is_zero() {
            // depth = n · (Π b_i)^(1/n)
            return checked::mul(geometric_mean(balances)?, n);
        }

        let amp = self.params.amp_factor;
        let tolerance = self.params.tolerance;
        let sum_balances = checked::sum(balances)?;
        let sum_times_amp = checked::mul(sum_balances, amp)?;
        let amp_minus_one = checked::sub(amp, Decimal::ONE)?;
        let n_plus_one = checked::add(n, Decimal::ONE)?;

        let mut depth_approx = initial_guess.unwrap_or(sum_balances);
        for iteration in 0..self.params.max_iterations {
            let reciprocal_decay = self.reciprocal_decay(depth_approx, balances)?;
            let numerator = checked::add(
                sum_times_amp,
                checked::mul(checked::mul(n, depth_approx)?, reciprocal_decay)?,
            )?;
            let denominator =
                checked::add(amp_minus_one, checked::mul(n_plus_one, reciprocal_decay)?)?;
            let depth_next = checked::div(numerator, denominator)?;

            if checked::sub(depth_next, depth_approx)?.abs() <= tolerance {
                log::trace!("compute_depth converged after {} iterations", iteration + 1);
                return if depth_next <= Decimal::ZERO {
                    checked::div(tolerance, EPSILON_TOLERANCE_DIVISOR)
                } else {
                    Ok(depth_next)
                };
            }
            depth_approx = depth_next;
        }

        Err(PoolMathError::NoConvergence {
            function: "compute_depth",
            max_iterations: self.params.max_iterations,
            tolerance,
        })
    }

    /// Solve the invariant for the one balance not in `known_balances`
    ///
    /// # Arguments
    /// * `known_balances` - The other token count - 1 balances
    /// * `depth` - Target depth
    /// * `initial_guess` - Starting point, defaults to `depth`
    pub fn compute_missing_balance(
        &self,
        known_balances: &[Decimal],
        depth: Decimal,
        initial_guess: Option<Decimal>,
    ) -> Result<Decimal> {
        if known_balances.len() + 1 != self.token_count() {
            return Err(PoolMathError::WrongAmountCount {
                expected: self.token_count() - 1,
                actual: known_balances.len(),
            });
        }
        let n = Decimal::from(self.token_count());

        if self.params.amp_factor.is_zero() {
            // Π over [1, known...] of depth / (b·n)
            let first = checked::div(depth, n)?;
            return known_balances.iter().try_fold(first, |acc, b| {
                checked::mul(acc, checked::div(depth, checked::mul(*b, n)?)?)
            });
        }

        let tolerance = self.params.tolerance;
        let depth_div_amp = checked::div(depth, self.params.amp_factor)?;
        let reciprocal_decay = self.reciprocal_decay(depth, known_balances)?;
        let numerator_fixed = checked::mul(
            checked::mul(depth_div_amp, checked::div(depth, n)?)?,
            reciprocal_decay,
        )?;
        let denominator_fixed = checked::add(checked::sum(known_balances)?, depth_div_amp)?;

        let mut approx = initial_guess.unwrap_or(depth);
        for iteration in 0..self.params.max_iterations {
            let numerator = checked::add(checked::mul(approx, approx)?, numerator_fixed)?;
            let denominator = checked::sub(
                checked::add(checked::mul(approx, Decimal::TWO)?, denominator_fixed)?,
                depth,
            )?;
            let next = checked::div(numerator, denominator)?;
            // a guess below the root overshoots once, then descends
            if checked::sub(approx, next)?.abs() <= tolerance {
                log::trace!(
                    "compute_missing_balance converged after {} iterations",
                    iteration + 1
                );
                return Ok(next);
            }
            approx = next;
        }

        Err(PoolMathError::NoConvergence {
            function: "compute_missing_balance",
            max_iterations: self.params.max_iterations,
            tolerance,
        })
    }

    // ------------------------------------------------------------------------
    // Implementation
    // ------------------------------------------------------------------------

    fn add_remove(&self, is_add: bool, amounts: &[Decimal]) -> Result<(Decimal, Decimal)> {
        check_non_negative(amounts)?;
        if !is_add && self.balances.iter().zip(amounts).any(|(b, a)| b <= a) {
            return Err(PoolMathError::ExceedsBalance);
        }

        let initial_depth = self.depth;
        let updated_balances = self
            .balances
            .iter()
            .zip(amounts)
            .map(|(b, a)| if is_add { checked::add(*b, *a) } else { checked::sub(*b, *a) })
            .collect::<Result<Vec<_>>>()?;
        let scale_factor = checked::div(
            checked::sum(&updated_balances)?,
            checked::sum(&self.balances)?,
        )?;
        let updated_depth = self.compute_depth(
            &updated_balances,
            Some(checked::mul(initial_depth, scale_factor)?),
        )?;

        let total_fee = self.total_fee();
        if total_fee.is_zero() {
            let lp_amount = checked::mul(
                checked::div(
                    checked::sub_given_order(is_add, updated_depth, initial_depth)?,
                    initial_depth,
                )?,
                self.lp_supply,
            )?;
            return Ok((lp_amount, Decimal::ZERO));
        }

        let fee = if is_add { total_fee } else { remove_fee(total_fee)? };
        let mut fee_adjusted_balances = Vec::with_capacity(updated_balances.len());
        for (updated, initial) in updated_balances.iter().zip(&self.balances) {
            let scaled = checked::mul(scale_factor, *initial)?;
            let taxbase = checked::sub_given_order(is_add, *updated, scaled)?.max(Decimal::ZERO);
            fee_adjusted_balances.push(checked::sub(*updated, checked::mul(fee, taxbase)?)?);
        }
        if !is_add && fee_adjusted_balances.iter().any(|b| *b <= Decimal::ZERO) {
            return Err(PoolMathError::ImpossibleRemove);
        }

        let fee_adjusted_depth = self.compute_depth(&fee_adjusted_balances, Some(updated_depth))?;
        let total_fee_depth = checked::sub(updated_depth, fee_adjusted_depth)?;
        let user_depth = checked::sub_given_order(is_add, fee_adjusted_depth, initial_depth)?;
        let governance_depth = self.governance_share(total_fee_depth)?;
        let lp_amount = checked::mul(checked::div(user_depth, initial_depth)?, self.lp_supply)?;
        let updated_lp_supply = if is_add {
            checked::add(self.lp_supply, lp_amount)?
        } else {
            checked::sub(self.lp_supply, lp_amount)?
        };
        let lp_depth = checked::sub(
            if is_add { fee_adjusted_depth } else { updated_depth },
            governance_depth,
        )?;
        let governance_mint_amount = checked::mul(
            governance_depth,
            checked::div(updated_lp_supply, lp_depth)?,
        )?;
        Ok((lp_amount, governance_mint_amount))
    }

    fn swap(&self, is_input: bool, amounts: &[Decimal], index: usize) -> Result<(Decimal, Decimal)> {
        self.check_amount_count(amounts)?;
        check_non_negative(amounts)?;
        self.check_index(index)?;
        if amounts.iter().all(Decimal::is_zero) {
            return Ok((Decimal::ZERO, Decimal::ZERO));
        }
        if !amounts[index].is_zero() {
            return Err(PoolMathError::NonZeroSwapIndex(index));
        }
        self.check_not_empty()?;
        if !is_input && self.balances.iter().zip(amounts).any(|(b, a)| b <= a) {
            return Err(PoolMathError::ExceedsBalance);
        }

        let total_fee = self.total_fee();
        let initial_depth = self.depth;
        let updated_balances = self
            .balances
            .iter()
            .zip(amounts)
            .map(|(b, a)| if is_input { checked::add(*b, *a) } else { checked::sub(*b, *a) })
            .collect::<Result<Vec<_>>>()?;
        let swap_base_balances = if is_input && !total_fee.is_zero() {
            updated_balances
                .iter()
                .zip(amounts)
                .map(|(b, a)| checked::sub(*b, checked::mul(total_fee, *a)?))
                .collect::<Result<Vec<_>>>()?
        } else {
            updated_balances.clone()
        };

        let known_balances: Vec<Decimal> = swap_base_balances
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, b)| *b)
            .collect();
        let missing_balance = self.compute_missing_balance(
            &known_balances,
            initial_depth,
            is_input.then_some(self.balances[index]),
        )?;
        let user_amount = checked::sub_given_order(is_input, self.balances[index], missing_balance)?;

        if total_fee.is_zero() {
            return Ok((user_amount, Decimal::ZERO));
        }
        let final_amount = if is_input {
            user_amount
        } else {
            checked::div(user_amount, checked::sub(Decimal::ONE, total_fee)?)?
        };

        let mut final_balances = updated_balances;
        final_balances[index] = if is_input {
            checked::sub(final_balances[index], final_amount)?
        } else {
            checked::add(final_balances[index], final_amount)?
        };
        let final_depth = self.compute_depth(&final_balances, Some(initial_depth))?;
        let total_fee_depth = checked::sub(final_depth, initial_depth)?;
        let governance_depth = self.governance_share(total_fee_depth)?;
        let lp_depth = checked::sub(final_depth, governance_depth)?;
        let governance_mint_amount = checked::mul(
            governance_depth,
            checked::div(self.lp_supply, lp_depth)?,
        )?;
        Ok((final_amount, governance_mint_amount))
    }

    /// Π depth / (n·b_i)
    fn reciprocal_decay(&self, depth: Decimal, balances: &[Decimal]) -> Result<Decimal> {
        let n = Decimal::from(self.token_count());
        balances.iter().try_fold(Decimal::ONE, |acc, b| {
            checked::mul(acc, checked::div(depth, checked::mul(n, *b)?)?)
        })
    }

    fn governance_share(&self, total_fee_depth: Decimal) -> Result<Decimal> {
        checked::mul(
            total_fee_depth,
            checked::div(self.params.governance_fee, self.total_fee())?,
        )
    }

    fn balances_without(&self, index: usize) -> Vec<Decimal> {
        self.balances
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, b)| *b)
            .collect()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.token_count() {
            return Err(PoolMathError::InvalidIndex(index));
        }
        Ok(())
    }

    fn check_amount_count(&self, amounts: &[Decimal]) -> Result<()> {
        if amounts.len() != self.token_count() {
            return Err(PoolMathError::WrongAmountCount {
                expected: self.token_count(),
                actual: amounts.len(),
            });
        }
        Ok(())
    }

    fn check_burn_amount(&self, burn_amount: Decimal) -> Result<()> {
        if burn_amount < Decimal::ZERO {
            return Err(PoolMathError::NegativeAmount);
        }
        if burn_amount > self.lp_supply {
            return Err(PoolMathError::BurnExceedsSupply {
                burn: burn_amount,
                lp_supply: self.lp_supply,
            });
        }
        Ok(())
    }

    fn check_not_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Err(PoolMathError::EmptyPool);
        }
        Ok(())
    }
}

fn check_token_count(token_count: usize) -> Result<()> {
    if !(MIN_TOKEN_COUNT..=MAX_TOKEN_COUNT).contains(&token_count) {
        return Err(PoolMathError::InvalidTokenCount(token_count));
    }
    Ok(())
}

fn check_non_negative(amounts: &[Decimal]) -> Result<()> {
    if amounts.iter().any(|a| *a < Decimal::ZERO) {
        return Err(PoolMathError::NegativeAmount);
    }
    Ok(())
}

/// Fee applied to removes: 1 / (1 - total_fee) - 1
fn remove_fee(total_fee: Decimal) -> Result<Decimal> {
    checked::sub(
        checked::div(Decimal::ONE, checked::sub(Decimal::ONE, total_fee)?)?,
        Decimal::ONE,
    )
}

/// (Π b_i)^(1/n), computed on balances normalized by their mean so the
/// product stays representable
fn geometric_mean(balances: &[Decimal]) -> Result<Decimal> {
    let n = Decimal::from(balances.len());
    let mean = checked::div(checked::sum(balances)?, n)?;
    if mean.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let normalized_product = balances.iter().try_fold(Decimal::ONE, |acc, b| {
        checked::mul(acc, checked::div(*b, mean)?)
    })?;
    checked::mul(mean, nth_root(normalized_product, balances.len())?)
}

/// Newton refinement of a float estimate of value^(1/n)
fn nth_root(value: Decimal, n: usize) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    let estimate = value
        .to_f64()
        .map(|v| v.powf(1.0 / n as f64))
        .and_then(Decimal::from_f64)
        .ok_or(PoolMathError::Overflow)?;
    if estimate.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let n_dec = Decimal::from(n);
    let n_minus_one = Decimal::from(n - 1);
    let mut root = estimate;
    for _ in 0..ROOT_MAX_ITERATIONS {
        let mut power = Decimal::ONE;
        for _ in 1..n {
            power = checked::mul(power, root)?;
        }
        let next = checked::div(
            checked::add(checked::mul(n_minus_one, root)?, checked::div(value, power)?)?,
            n_dec,
        )?;
        let step = checked::sub(next, root)?.abs();
        root = next;
        if step <= checked::mul(root, ROOT_PRECISION)? {
            break;
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params(amp: Decimal, lp_fee: Decimal, governance_fee: Decimal) -> PoolParams {
        PoolParams::new(amp, lp_fee, governance_fee)
    }

    fn pool(balances: &[Decimal], p: PoolParams) -> PoolMath {
        PoolMath::new(balances.to_vec(), p, None).unwrap()
    }

    fn assert_close(actual: Decimal, expected: Decimal, tolerance: Decimal) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {} but got {} (tolerance {})",
            expected,
            actual,
            tolerance
        );
    }

    fn fee_pool() -> PoolMath {
        pool(
            &[dec!(100), dec!(100), dec!(100)],
            params(dec!(1.313), dec!(0.10), dec!(0.40)),
        )
    }

    #[test]
    fn test_uniform_add_to_empty_pool() {
        let pool = PoolMath::empty(3, params(dec!(1), dec!(0), dec!(0))).unwrap();
        let result = pool.add(&[dec!(1), dec!(1), dec!(1)]).unwrap();
        assert_close(result.lp_output_amount, dec!(3), dec!(0.000001));
        assert_eq!(result.governance_mint_amount, Decimal::ZERO);
    }

    #[test]
    fn test_constant_product_depth_of_first_add() {
        let pool = PoolMath::empty(2, params(dec!(0), dec!(0), dec!(0))).unwrap();
        let result = pool.add(&[dec!(3), dec!(12)]).unwrap();
        assert_close(result.lp_output_amount, dec!(12), dec!(0.000000001));
        assert_eq!(result.governance_mint_amount, Decimal::ZERO);
    }

    #[test]
    fn test_constant_product_add() {
        let pool = pool(&[dec!(1), dec!(4)], params(dec!(0), dec!(0), dec!(0)));
        assert_close(pool.depth(), dec!(4), dec!(0.000000001));
        let result = pool.add(&[dec!(5), dec!(2)]).unwrap();
        assert_close(result.lp_output_amount, dec!(8), dec!(0.000000001));
        assert_eq!(result.governance_mint_amount, Decimal::ZERO);
    }

    #[test]
    fn test_constant_product_swap() {
        let pool = pool(&[dec!(1), dec!(4)], params(dec!(0), dec!(0), dec!(0)));
        let result = pool.swap_exact_input(&[dec!(1), dec!(0)], 1).unwrap();
        assert_close(result.stable_output_amount, dec!(2), dec!(0.000000001));
        assert_eq!(result.governance_mint_amount, Decimal::ZERO);
    }

    #[test]
    fn test_constant_product_swap_with_fee() {
        let pool = pool(&[dec!(1), dec!(4)], params(dec!(0), dec!(0.5), dec!(0)));
        let result = pool.swap_exact_input(&[dec!(2), dec!(0)], 1).unwrap();
        assert_close(result.stable_output_amount, dec!(2), dec!(0.000000001));
        assert_close(result.governance_mint_amount, Decimal::ZERO, dec!(0.000000001));
    }

    #[test]
    fn test_depth_and_missing_balance() {
        let balances = [dec!(20), dec!(10), dec!(20), dec!(5), dec!(2), dec!(1)];
        let pool = pool(&balances, params(dec!(1), dec!(0), dec!(0)));
        let depth = pool.depth();
        assert_close(depth, dec!(37.70007484983239375907243892), dec!(0.000001));

        for i in 0..balances.len() {
            let known: Vec<Decimal> = balances
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, b)| *b)
                .collect();
            let missing = pool.compute_missing_balance(&known, depth, None).unwrap();
            assert_close(missing, balances[i], dec!(0.00001));
        }
    }

    #[test]
    fn test_remove_exact_output_consistent_with_remove_exact_burn() {
        let pool = fee_pool();
        let first = pool.remove_exact_output(&[dec!(10), dec!(0), dec!(0)]).unwrap();
        let second = pool.remove_exact_burn(first.lp_input_amount, 0).unwrap();

        assert_close(second.stable_output_amount, dec!(10), dec!(0.000001));
        assert_close(
            first.governance_mint_amount,
            second.governance_mint_amount,
            dec!(0.000001),
        );
    }

    #[test]
    fn test_swap_exact_input_consistent_with_swap_exact_output() {
        let pool = fee_pool();
        let first = pool.swap_exact_input(&[dec!(50), dec!(0), dec!(0)], 1).unwrap();
        let second = pool
            .swap_exact_output(0, &[dec!(0), first.stable_output_amount, dec!(0)])
            .unwrap();

        assert_close(second.stable_input_amount, dec!(50), dec!(0.000001));
        assert_close(
            first.governance_mint_amount,
            second.governance_mint_amount,
            dec!(0.000001),
        );
    }

    #[test]
    fn test_swap_round_trip_on_lopsided_pool() {
        let pool = pool(
            &[dec!(1000), dec!(175922), dec!(1000)],
            params(dec!(1), dec!(0), dec!(0)),
        );
        let first = pool.swap_exact_input(&[dec!(0), dec!(175.922), dec!(0)], 2).unwrap();
        assert!(first.stable_output_amount > dec!(1.97) && first.stable_output_amount < dec!(1.98));

        let second = pool
            .swap_exact_output(1, &[dec!(0), dec!(0), first.stable_output_amount])
            .unwrap();
        assert_close(second.stable_input_amount, dec!(175.922), dec!(0.0001));
    }

    #[test]
    fn test_missing_balance_from_guess_below_root() {
        let balances = [dec!(1000), dec!(175922), dec!(1000)];
        let pool = pool(&balances, params(dec!(1), dec!(0), dec!(0)));
        let missing = pool
            .compute_missing_balance(&[dec!(1000), dec!(1000)], pool.depth(), Some(dec!(1)))
            .unwrap();
        assert_close(missing, dec!(175922), dec!(0.00001));
    }

    fn proportional_then_imbalanced(is_add: bool) {
        let p = params(dec!(1.313), dec!(0.10), dec!(0.40));
        let balances = [dec!(100), dec!(100), dec!(100)];
        let pool = pool(&balances, p);
        let fraction = dec!(2);

        let run = |pool: &PoolMath, amounts: &[Decimal]| -> (Decimal, Decimal) {
            if is_add {
                let r = pool.add(amounts).unwrap();
                (r.lp_output_amount, r.governance_mint_amount)
            } else {
                let r = pool.remove_exact_output(amounts).unwrap();
                (r.lp_input_amount, r.governance_mint_amount)
            }
        };

        let proportional: Vec<Decimal> = balances.iter().map(|b| b / fraction).collect();
        let (proportional_lp, proportional_gov) = run(&pool, &proportional);
        assert_close(proportional_gov, Decimal::ZERO, dec!(0.000000001));

        let balances_after: Vec<Decimal> = balances
            .iter()
            .zip(&proportional)
            .map(|(b, a)| if is_add { b + a } else { b - a })
            .collect();
        let lp_after = if is_add {
            pool.depth() + proportional_lp
        } else {
            pool.depth() - proportional_lp
        };
        let pool_after = PoolMath::new(balances_after, p, Some(lp_after)).unwrap();

        let imbalanced = [balances[0] / (fraction * fraction), dec!(0), dec!(0)];
        let (imbalanced_lp, imbalanced_gov) = run(&pool_after, &imbalanced);

        let together: Vec<Decimal> = proportional
            .iter()
            .zip(&imbalanced)
            .map(|(a, b)| a + b)
            .collect();
        let (together_lp, together_gov) = run(&pool, &together);

        assert_close(proportional_lp + imbalanced_lp, together_lp, dec!(0.000001));
        assert_close(imbalanced_gov, together_gov, dec!(0.000001));
    }

    #[test]
    fn test_proportional_and_imbalanced_add_matches_single_add() {
        proportional_then_imbalanced(true);
    }

    #[test]
    fn test_proportional_and_imbalanced_remove_matches_single_remove() {
        proportional_then_imbalanced(false);
    }

    fn orca_pool(orca_amp: u32) -> PoolMath {
        let balances = [dec!(19768621.149413), dec!(19577821.226623)];
        let amp = Decimal::from(orca_amp) * Decimal::from(balances.len());
        pool(&balances, params(amp, dec!(0.0006), dec!(0.0001)))
    }

    #[test]
    fn test_price_impact_with_amp_10() {
        let pool = orca_pool(10);
        let input = dec!(1000000);
        let output = pool.swap_exact_input(&[input, dec!(0)], 1).unwrap();
        assert_close(output.stable_output_amount, dec!(993818.115178), dec!(0.000001));
        let impact = pool.price_impact(input, 0, 1).unwrap();
        assert_close(impact, dec!(0.460846), dec!(0.000001));
    }

    #[test]
    fn test_price_impact_with_amp_100() {
        let pool = orca_pool(100);
        let input = dec!(1000000);
        let output = pool.swap_exact_input(&[input, dec!(0)], 1).unwrap();
        assert_close(output.stable_output_amount, dec!(998699.971289), dec!(0.000001));
        let impact = pool.price_impact(input, 0, 1).unwrap();
        assert_close(impact, dec!(0.050447), dec!(0.000001));
    }

    #[test]
    fn test_constant_product_marginal_prices() {
        let cases = [
            (vec![dec!(1), dec!(4)], dec!(4), vec![dec!(2), dec!(0.5)]),
            (vec![dec!(1), dec!(4)], dec!(2), vec![dec!(4), dec!(1)]),
            (vec![dec!(1), dec!(2), dec!(4)], dec!(6), vec![dec!(2), dec!(1), dec!(0.5)]),
            (vec![dec!(1), dec!(2), dec!(4)], dec!(3), vec![dec!(4), dec!(2), dec!(1)]),
        ];
        for (balances, lp_supply, expected) in cases {
            let pool = PoolMath::new(
                balances,
                params(dec!(0), dec!(0), dec!(0)),
                Some(lp_supply),
            )
            .unwrap();
            let prices = pool.analytic_marginal_prices().unwrap();
            for (price, want) in prices.iter().zip(&expected) {
                assert_close(*price, *want, dec!(0.000000001));
            }
        }
    }

    #[test]
    fn test_analytic_marginal_prices_match_difference_quotient() {
        let pool = pool(&[dec!(2000000), dec!(20000000)], params(dec!(20), dec!(0), dec!(0)));
        let analytic = pool.analytic_marginal_prices().unwrap();
        let numeric = pool.marginal_prices(Some(dec!(0.01))).unwrap();
        for (a, n) in analytic.iter().zip(&numeric) {
            assert_close(*a, *n, dec!(0.00000001));
        }
    }

    #[test]
    fn test_remove_uniform_scales_balances() {
        let pool = fee_pool();
        let burn = pool.lp_supply() / dec!(4);
        let outputs = pool.remove_uniform(burn).unwrap();
        for (out, b) in outputs.iter().zip(pool.balances()) {
            assert_close(*out, b / dec!(4), dec!(0.000000001));
        }
    }

    #[test]
    fn test_zero_amounts_short_circuit() {
        let pool = fee_pool();
        let swap = pool.swap_exact_input(&[dec!(0), dec!(0), dec!(0)], 2).unwrap();
        assert_eq!(swap.stable_output_amount, Decimal::ZERO);
        let burn = pool.remove_exact_burn(dec!(0), 1).unwrap();
        assert_eq!(burn.stable_output_amount, Decimal::ZERO);
        assert_eq!(burn.governance_mint_amount, Decimal::ZERO);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let balances = vec![dec!(1), dec!(1)];
        let bad = [
            params(dec!(0.5), dec!(0), dec!(0)),
            params(dec!(1000001), dec!(0), dec!(0)),
            params(dec!(1), dec!(1), dec!(0)),
            params(dec!(1), dec!(-0.1), dec!(0)),
            params(dec!(1), dec!(0), dec!(1)),
            params(dec!(1), dec!(0.6), dec!(0.4)),
            params(dec!(1), dec!(0), dec!(0)).with_tolerance(dec!(-1)),
            params(dec!(1), dec!(0), dec!(0)).with_max_iterations(0),
        ];
        for p in bad {
            assert!(PoolMath::new(balances.clone(), p, None).is_err(), "{:?}", p);
        }
    }

    #[test]
    fn test_invalid_balances_rejected() {
        let p = params(dec!(1), dec!(0), dec!(0));
        assert!(matches!(
            PoolMath::new(vec![dec!(1)], p, None),
            Err(PoolMathError::InvalidTokenCount(1))
        ));
        assert!(matches!(
            PoolMath::empty(21, p),
            Err(PoolMathError::InvalidTokenCount(21))
        ));
        assert!(matches!(
            PoolMath::new(vec![dec!(1), dec!(0)], p, None),
            Err(PoolMathError::MixedZeroBalances)
        ));
        assert!(matches!(
            PoolMath::new(vec![dec!(1), dec!(-1)], p, None),
            Err(PoolMathError::NegativeAmount)
        ));
        assert!(matches!(
            PoolMath::new(vec![dec!(0), dec!(0)], p, Some(dec!(1))),
            Err(PoolMathError::InvalidLpSupply(_))
        ));
        assert!(matches!(
            PoolMath::new(vec![dec!(1), dec!(1)], p, Some(dec!(0))),
            Err(PoolMathError::InvalidLpSupply(_))
        ));
    }

    #[test]
    fn test_operation_input_violations() {
        let pool = fee_pool();
        assert!(matches!(
            pool.swap_exact_input(&[dec!(1), dec!(1), dec!(0)], 1),
            Err(PoolMathError::NonZeroSwapIndex(1))
        ));
        assert!(matches!(
            pool.swap_exact_input(&[dec!(1), dec!(0), dec!(0)], 3),
            Err(PoolMathError::InvalidIndex(3))
        ));
        assert!(matches!(
            pool.swap_exact_output(0, &[dec!(0), dec!(100), dec!(0)]),
            Err(PoolMathError::ExceedsBalance)
        ));
        assert!(matches!(
            pool.remove_exact_output(&[dec!(100), dec!(0), dec!(0)]),
            Err(PoolMathError::ExceedsBalance)
        ));
        assert!(matches!(
            pool.remove_uniform(pool.lp_supply() + dec!(1)),
            Err(PoolMathError::BurnExceedsSupply { .. })
        ));
        assert!(matches!(
            pool.remove_exact_burn(dec!(-1), 0),
            Err(PoolMathError::NegativeAmount)
        ));
        assert!(matches!(
            pool.add(&[dec!(1), dec!(1)]),
            Err(PoolMathError::WrongAmountCount { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            pool.marginal_prices(Some(dec!(0))),
            Err(PoolMathError::InvalidEpsilon(_))
        ));
    }

    #[test]
    fn test_swap_on_empty_pool_rejected() {
        let pool = PoolMath::empty(2, params(dec!(10), dec!(0), dec!(0))).unwrap();
        assert!(matches!(
            pool.swap_exact_input(&[dec!(1), dec!(0)], 1),
            Err(PoolMathError::EmptyPool)
        ));
    }

    #[test]
    fn test_first_add_requires_every_token() {
        let pool = PoolMath::empty(2, params(dec!(10), dec!(0), dec!(0))).unwrap();
        assert!(matches!(
            pool.add(&[dec!(1), dec!(0)]),
            Err(PoolMathError::FirstAddRequiresPositiveAmounts)
        ));
    }

    #[test]
    fn test_no_convergence_is_reported() {
        let p = params(dec!(1000), dec!(0), dec!(0)).with_max_iterations(1);
        let result = PoolMath::new(vec![dec!(1), dec!(1000000)], p, None);
        assert!(matches!(result, Err(PoolMathError::NoConvergence { .. })));
    }
}
