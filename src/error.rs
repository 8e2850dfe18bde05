use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the pipeline. The split that matters operationally is
/// retryable (leave on the queue, redelivery handles it) versus terminal
/// (dead-letter), plus one special case: a unique-constraint violation from a
/// concurrent writer, which is a successful merge rather than a failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// The referenced raw entity does not resolve (yet). Retryable: the
    /// producing transaction may simply not have committed.
    #[error("entity not found: {entity_id} ({entity_type})")]
    EntityNotFound { entity_id: Uuid, entity_type: String },

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Unique constraint violation: a concurrent writer already merged this
    /// row. Treated as success by callers, never surfaced to operators.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.code().as_deref() == Some("23505") {
                return PipelineError::ConstraintViolation(db.message().to_string());
            }
        }
        PipelineError::Database(e)
    }
}

impl PipelineError {
    /// Whether a queue consumer should leave the message for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_)
                | PipelineError::EntityNotFound { .. }
                | PipelineError::EmbeddingUnavailable(_)
        )
    }

    /// True when a concurrent writer won an upsert race; the caller treats
    /// the operation as having succeeded via the winner's merge.
    pub fn is_merge(&self) -> bool {
        matches!(self, PipelineError::ConstraintViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_failures_are_retryable() {
        assert!(PipelineError::EmbeddingUnavailable("timeout".into()).is_retryable());
    }

    #[test]
    fn missing_entities_are_retryable() {
        let e = PipelineError::EntityNotFound {
            entity_id: Uuid::new_v4(),
            entity_type: "memory".into(),
        };
        assert!(e.is_retryable());
        assert!(!e.is_merge());
    }

    #[test]
    fn configuration_errors_are_terminal() {
        let e = PipelineError::Configuration("bad threshold".into());
        assert!(!e.is_retryable());
        assert!(!e.is_merge());
    }

    #[test]
    fn constraint_violations_are_merges() {
        let e = PipelineError::ConstraintViolation("entity_summaries_entity_key".into());
        assert!(e.is_merge());
        assert!(!e.is_retryable());
    }
}
