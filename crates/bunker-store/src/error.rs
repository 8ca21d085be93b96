//! Error types for `bunker-store`.

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database failed. Treated as `Internal` at the RPC
    /// boundary; the process keeps running.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The token has already been redeemed.
    #[error("token already redeemed")]
    AlreadyRedeemed,

    /// A token or policy has expired.
    #[error("{what} expired")]
    Expired { what: String },

    /// A ledger row was already settled; transitions are terminal.
    #[error("request already settled")]
    AlreadySettled,
}

impl StoreError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn expired(what: impl Into<String>) -> Self {
        Self::Expired { what: what.into() }
    }
}
