//! Token-scoped decimal amounts
//!
//! An [`Amount`] stores the human value (ecosystem agnostic). Atomic values
//! depend on the decimals of the token on a given ecosystem, so every
//! conversion takes the ecosystem explicitly.

use pool_math::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::RoundingStrategy;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::TokenSpec;
use crate::ecosystem::EcosystemId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amounts of different tokens: {0} and {1}")]
    DifferentTokens(String, String),
    #[error("token {token} has no details on {ecosystem}")]
    MissingDetails { token: String, ecosystem: EcosystemId },
    #[error("cannot parse amount {0:?}")]
    Parse(String),
    #[error("amount out of range")]
    Overflow,
}

type Result<T> = std::result::Result<T, AmountError>;

#[derive(Debug, Clone)]
pub struct Amount {
    token: Arc<TokenSpec>,
    value: Decimal,
}

fn pow10(decimals: u8) -> Result<Decimal> {
    let mut factor = Decimal::ONE;
    for _ in 0..decimals {
        factor = factor.checked_mul(Decimal::TEN).ok_or(AmountError::Overflow)?;
    }
    Ok(factor)
}

impl Amount {
    pub fn zero(token: Arc<TokenSpec>) -> Self {
        Self {
            token,
            value: Decimal::ZERO,
        }
    }

    pub fn from_human(token: Arc<TokenSpec>, value: Decimal) -> Self {
        Self { token, value }
    }

    /// Parse a human value, ignoring `,` group separators
    pub fn from_human_str(token: Arc<TokenSpec>, value: &str) -> Result<Self> {
        let cleaned: String = value.chars().filter(|c| *c != ',').collect();
        let value = Decimal::from_str(cleaned.trim())
            .map_err(|_| AmountError::Parse(value.to_string()))?;
        Ok(Self { token, value })
    }

    pub fn from_atomic(token: Arc<TokenSpec>, atomic: Decimal, ecosystem: EcosystemId) -> Result<Self> {
        let decimals = Self::decimals_of(&token, ecosystem)?;
        let value = atomic
            .checked_div(pow10(decimals)?)
            .ok_or(AmountError::Overflow)?;
        Ok(Self { token, value })
    }

    pub fn from_atomic_str(token: Arc<TokenSpec>, atomic: &str, ecosystem: EcosystemId) -> Result<Self> {
        let atomic = Decimal::from_str(atomic.trim())
            .map_err(|_| AmountError::Parse(atomic.to_string()))?;
        Self::from_atomic(token, atomic, ecosystem)
    }

    pub fn from_atomic_u64(token: Arc<TokenSpec>, atomic: u64, ecosystem: EcosystemId) -> Result<Self> {
        Self::from_atomic(token, Decimal::from(atomic), ecosystem)
    }

    /// Atomic `1`, marking an amount that is only known once an earlier
    /// transaction confirms. Distinct from a real zero.
    pub fn placeholder(token: Arc<TokenSpec>, ecosystem: EcosystemId) -> Result<Self> {
        Self::from_atomic_u64(token, 1, ecosystem)
    }

    fn decimals_of(token: &TokenSpec, ecosystem: EcosystemId) -> Result<u8> {
        token
            .details_for(ecosystem)
            .map(|d| d.decimals)
            .ok_or_else(|| AmountError::MissingDetails {
                token: token.id.clone(),
                ecosystem,
            })
    }

    pub fn token(&self) -> &Arc<TokenSpec> {
        &self.token
    }

    pub fn token_id(&self) -> &str {
        &self.token.id
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    /// Integer amount on `ecosystem`, floored
    pub fn to_atomic(&self, ecosystem: EcosystemId) -> Result<Decimal> {
        let decimals = Self::decimals_of(&self.token, ecosystem)?;
        let atomic = self
            .value
            .checked_mul(pow10(decimals)?)
            .ok_or(AmountError::Overflow)?;
        Ok(atomic.floor())
    }

    pub fn to_atomic_u64(&self, ecosystem: EcosystemId) -> Result<u64> {
        self.to_atomic(ecosystem)?
            .to_u64()
            .ok_or(AmountError::Overflow)
    }

    /// Human value rounded to the precision available on `ecosystem`
    pub fn to_human(&self, ecosystem: EcosystemId) -> Result<Decimal> {
        let decimals = Self::decimals_of(&self.token, ecosystem)?;
        Ok(self
            .value
            .round_dp_with_strategy(u32::from(decimals), RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn to_human_string(&self, ecosystem: EcosystemId) -> Result<String> {
        Ok(self.to_human(ecosystem)?.normalize().to_string())
    }

    /// True when the value has more precision than `ecosystem` can represent
    pub fn requires_rounding(&self, ecosystem: EcosystemId) -> Result<bool> {
        let decimals = Self::decimals_of(&self.token, ecosystem)?;
        Ok(self.value.normalize().scale() > u32::from(decimals))
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.value < Decimal::ZERO
    }

    pub fn is_placeholder(&self, ecosystem: EcosystemId) -> bool {
        matches!(self.to_atomic(ecosystem), Ok(atomic) if atomic == Decimal::ONE)
    }

    fn check_same_token(&self, other: &Amount) -> Result<()> {
        if self.token.id != other.token.id {
            return Err(AmountError::DifferentTokens(
                self.token.id.clone(),
                other.token.id.clone(),
            ));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        self.check_same_token(other)?;
        let value = self.value.checked_add(other.value).ok_or(AmountError::Overflow)?;
        Ok(Self::from_human(self.token.clone(), value))
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        self.check_same_token(other)?;
        let value = self.value.checked_sub(other.value).ok_or(AmountError::Overflow)?;
        Ok(Self::from_human(self.token.clone(), value))
    }

    pub fn try_cmp(&self, other: &Amount) -> Result<Ordering> {
        self.check_same_token(other)?;
        Ok(self.value.cmp(&other.value))
    }

    pub fn mul_scalar(&self, factor: Decimal) -> Result<Amount> {
        let value = self.value.checked_mul(factor).ok_or(AmountError::Overflow)?;
        Ok(Self::from_human(self.token.clone(), value))
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.token.id == other.token.id && self.value == other.value
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value.normalize(), self.token.symbol)
    }
}
