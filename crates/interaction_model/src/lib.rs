//! Interaction Model - Cross-chain pool interactions
//!
//! A user request (swap, add, remove) is turned into an [`Interaction`],
//! decomposed into one or two on-chain pool operations by [`route`], and then
//! tracked through an acyclic pipeline by [`state`]:
//!
//! ```text
//! RequiredAccounts → InboundTransfers → PoolOperations → OutboundTransfers → Done
//! ```
//!
//! Progress is recorded with pure transitions ([`transition::apply`]) that are
//! shared by the live [`driver`] and by [`history::replay`], which rebuilds
//! state from chain history after a reload.

pub mod amount;
pub mod config;
pub mod driver;
pub mod ecosystem;
pub mod history;
pub mod instruction;
pub mod interaction;
pub mod operation;
pub mod persist;
pub mod route;
pub mod signature_set;
pub mod state;
pub mod transition;

pub use amount::{Amount, AmountError};
pub use config::{BridgeSpec, Config, PoolSpec, PoolTokens, TokenDetails, TokenSpec};
pub use ecosystem::{EcosystemId, Env};
pub use interaction::{Interaction, InteractionId, InteractionKind, InteractionSpec};
pub use operation::{OperationSpec, PoolOperation};
pub use signature_set::SignatureSets;
pub use state::{InteractionState, RequiredAction, Stage, Status};
pub use transition::{apply, Event, TransitionError};

use pool_math::PoolMathError;

/// Error types for building and decomposing interactions
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Unknown ecosystem name
    #[error("unknown ecosystem: {0}")]
    UnknownEcosystem(String),
    /// Unknown environment name
    #[error("unknown environment: {0}")]
    UnknownEnv(String),
    /// Token id missing from the configuration
    #[error("unknown token: {0}")]
    UnknownToken(String),
    /// Pool id missing from the configuration
    #[error("unknown pool: {0}")]
    UnknownPool(String),
    /// No bridge configured for an ecosystem
    #[error("no bridge configured for {0}")]
    UnknownBridge(EcosystemId),
    /// Token is not part of a pool
    #[error("token {token} is not in pool {pool}")]
    TokenNotInPool { token: String, pool: String },
    /// No one- or two-pool route connects the tokens
    #[error("no route from {input} to {output}")]
    NoRoute { input: String, output: String },
    /// Two-pool routes need one pool math per pool
    #[error("expected {expected} pool maths but got {actual}")]
    MissingPoolMath { expected: usize, actual: usize },
    /// Only add and swap outputs can feed a second pool operation
    #[error("operation cannot be the second step of a route")]
    InvalidSecondOperation,
    /// The first hop's confirmed transaction did not show the intermediate token
    #[error("no observed amount of {0} to feed the next operation")]
    MissingObservedAmount(String),
    /// A required wallet was not connected at submission time
    #[error("no {0} wallet connected")]
    MissingWallet(EcosystemId),
    /// Inbound transfer without a signature set keypair
    #[error("missing signature set keypair for {0}")]
    MissingSignatureSet(String),
    /// Malformed interaction id
    #[error("invalid interaction id: {0}")]
    InvalidInteractionId(String),
    /// Inconsistent configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error(transparent)]
    PoolMath(#[from] PoolMathError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
