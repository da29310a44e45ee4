use thiserror::Error;

/// Failures surfaced by the quota core.
///
/// Clamped deltas, ignored system-quota updates and over-subscribed
/// minimums are resolved in place and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("quota '{quota}' references missing parent '{parent}'")]
    ParentNotFound { quota: String, parent: String },

    #[error("quota '{quota}' references parent '{parent}' which is not a parent group")]
    ParentNotParentGroup { quota: String, parent: String },

    #[error("quota '{quota}' is part of a parent cycle")]
    Cycle { quota: String },

    #[error("quota '{0}' not found")]
    QuotaNotFound(String),

    #[error("quota '{0}' is a parent group; its request and used are derived from children")]
    ParentGroupDelta(String),

    #[error("invalid quota name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid quota spec: {0}")]
    InvalidSpec(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;
