use thiserror::Error;

/// Canonical basalt error taxonomy used across crates.
///
/// Classification guidance:
/// - [`EngineError::Cancelled`]: the fragment was cancelled (user abort, peer failure, deadline)
/// - [`EngineError::MemoryLimitExceeded`]: a tracker in the fragment/query chain went over limit
/// - [`EngineError::RemoteRpcFailed`] / [`EngineError::RemoteRpcTimeout`]: exchange transport
///   failures, terminal for the query at this layer (no retry)
/// - [`EngineError::Internal`]: invariant violation inside the runtime; always a bug
/// - [`EngineError::InvalidArgument`]: malformed plan/descriptor/request contract violations
/// - [`EngineError::ResourceExhausted`]: worker tokens, queue slots, or handles unavailable
/// - [`EngineError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum EngineError {
    /// Execution was cancelled before completion.
    ///
    /// Carries the cancellation reason recorded on the fragment context
    /// (explicit cancel request, peer-driver failure, query deadline).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A memory tracker rejected an allocation.
    ///
    /// The message includes the breakdown of the heaviest trackers under the
    /// failed limit so the coordinator can report where memory went.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// A transmit RPC to a peer failed.
    #[error("remote rpc failed: {0}")]
    RemoteRpcFailed(String),

    /// A transmit RPC to a peer timed out.
    #[error("remote rpc timeout: {0}")]
    RemoteRpcTimeout(String),

    /// Invariant violation inside the execution runtime.
    ///
    /// Examples:
    /// - chunk column lengths diverge
    /// - driver observed an operator state transition that must not happen
    #[error("internal error: {0}")]
    Internal(String),

    /// Malformed plan, descriptor or request.
    ///
    /// Examples:
    /// - unknown plan-node/slot reference
    /// - aggregate call the resolver has no entry for
    /// - transmit request for an unregistered fragment instance
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded resource (worker token, queue slot) was unavailable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error is a cancellation (as opposed to a first-cause failure).
    ///
    /// Used when latching the first non-OK status on a fragment: a concurrent
    /// cancellation must not mask the failure that triggered it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }
}

/// Standard basalt result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
