// error.rs - RPC error taxonomy
//
// Every error that can reach a client is a variant here. The Display string
// is the wire format: a classifying keyword, a colon, and a subclause.
// Clients and tests match by substring, so the strings are load-bearing.

use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    // =========================================================================
    // Request shape
    // =========================================================================
    /// Malformed envelope, bad params shape, or unknown method.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing, expired, or invalid authentication.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // =========================================================================
    // Signatures
    // =========================================================================
    /// No signing scheme recovered the expected signer.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Weighted signer set below the session quorum.
    #[error("operation denied: quorum not reached")]
    QuorumNotReached { have: u64, need: u64 },

    // =========================================================================
    // State machine
    // =========================================================================
    /// Submitted version is not stored version + 1.
    #[error("incorrect version: expected {expected}, got {got}")]
    IncorrectVersion { expected: u64, got: u64 },

    /// Catch-all policy rejection; the subclause names the rule.
    #[error("operation denied: {0}")]
    OperationDenied(String),

    // =========================================================================
    // Funds
    // =========================================================================
    /// A ledger debit would push the account below zero.
    #[error("insufficient balance: {asset} balance of {account} is {available}, need {required}")]
    InsufficientBalance {
        account: String,
        asset: String,
        available: Decimal,
        required: Decimal,
    },

    /// A session key debit would exceed its lifetime cap.
    #[error("operation denied: session key spending validation failed: insufficient session key allowance")]
    InsufficientAllowance,

    // =========================================================================
    // Lookups
    // =========================================================================
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("app session not found: {0}")]
    AppSessionNotFound(String),

    #[error("unknown session key: {0}")]
    UnknownSessionKey(String),

    // =========================================================================
    // Session key authority
    // =========================================================================
    /// The signing key lacks the scope required for this operation.
    #[error("insufficient permissions for the active session key")]
    InsufficientPermission,

    /// The referenced key does not belong to the caller.
    #[error("not an active session key of this user")]
    NotActiveSessionKey,

    /// Registration collided with a key already bound to another wallet.
    #[error("operation denied: session key already registered to another wallet")]
    SessionKeyConflict,

    // =========================================================================
    // Internal
    // =========================================================================
    /// Store failure. Wrapped so the sqlx detail never reaches the wire.
    #[error("internal error: storage failure")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Shorthand for `OperationDenied` with a borrowed subclause.
    pub fn denied(subclause: impl Into<String>) -> Self {
        RpcError::OperationDenied(subclause.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        RpcError::InvalidRequest(reason.into())
    }

    /// True for errors that must terminate the broker after log flush.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn wire_strings_carry_class_keyword_and_subclause() {
        assert_eq!(
            RpcError::denied("non-zero allocation detected").to_string(),
            "operation denied: non-zero allocation detected"
        );
        assert_eq!(
            RpcError::IncorrectVersion { expected: 4, got: 42 }.to_string(),
            "incorrect version: expected 4, got 42"
        );
        assert_eq!(
            RpcError::QuorumNotReached { have: 30, need: 100 }.to_string(),
            "operation denied: quorum not reached"
        );
        assert!(RpcError::InsufficientAllowance
            .to_string()
            .contains("session key spending validation failed: insufficient session key allowance"));
    }

    #[test]
    fn balance_error_names_account_and_amounts() {
        let err = RpcError::InsufficientBalance {
            account: "0xabc".into(),
            asset: "usdc".into(),
            available: dec!(10),
            required: dec!(25),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("insufficient balance:"));
        assert!(msg.contains("usdc"));
        assert!(msg.contains("25"));
    }

    #[test]
    fn database_errors_do_not_leak_detail() {
        let err = RpcError::Database(sqlx::Error::PoolClosed);
        assert_eq!(err.to_string(), "internal error: storage failure");
        assert!(err.is_fatal());
    }
}
