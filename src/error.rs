//! Error taxonomy shared by the health engine.

use crate::db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence is temporarily unavailable; the caller should retry.
    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("store error: {0}")]
    Store(DbError),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }

    /// Classify a store error, naming the entity a missing row belongs to.
    pub fn from_db(err: DbError, entity: &'static str, id: i64) -> Self {
        match err {
            DbError::NotFound => EngineError::NotFound { entity, id },
            other => other.into(),
        }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            EngineError::TransientStore(err.to_string())
        } else {
            EngineError::Store(err)
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_store_errors() {
        let err = EngineError::from_db(DbError::NotFound, "incident", 7);
        assert!(matches!(err, EngineError::NotFound { entity: "incident", id: 7 }));
        assert_eq!(err.to_string(), "incident with id 7 not found");

        let err: EngineError = DbError::Unavailable("poisoned".to_string()).into();
        assert!(err.is_transient());

        let err: EngineError = DbError::Migration("bad".to_string()).into();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
