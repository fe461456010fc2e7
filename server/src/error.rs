//! Error taxonomy for the realtime core.
//!
//! Registry and index lookups never fail: absence is reported with `Option`
//! or `bool`. Only the variants below ever reach a client, and only on the
//! connection that caused them.

use thiserror::Error;

use crate::db::models::UserId;

/// Failure inside a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Handshake credential rejected by the token verifier or the directory.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token invalid")]
    Invalid,

    #[error("unknown user {0}")]
    UnknownUser(UserId),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("{0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Persistence(String),
}

impl ChatError {
    /// Numeric code carried in the `error` event.
    pub fn code(&self) -> u16 {
        match self {
            Self::Authentication(_) => 401,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::Invalid(_) => 400,
            Self::Persistence(_) => 503,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Authorization(_) => "authorization",
            Self::NotFound(_) => "not-found",
            Self::Invalid(_) => "invalid",
            Self::Persistence(_) => "persistence",
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        Self::Persistence(err.to_string())
    }
}
