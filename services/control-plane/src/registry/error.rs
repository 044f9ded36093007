//! Registry error types.

use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness or ownership constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The region reached its server limit while claiming.
    #[error("region {region_id} is at its server limit ({current}/{limit})")]
    RegionFull {
        region_id: String,
        limit: i64,
        current: i64,
    },

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A stored row could not be decoded into a record.
    #[error("corrupt {entity} row: {message}")]
    Corrupt {
        entity: &'static str,
        message: String,
    },

    /// In-memory tables were poisoned by a panicking writer.
    #[error("registry lock poisoned")]
    Poisoned,
}

impl RegistryError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn corrupt(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            entity,
            message: message.into(),
        }
    }
}
