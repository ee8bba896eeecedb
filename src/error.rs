use thiserror::Error;

/// Errors raised by the persisted stores that callers may want to branch on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user_id is required for user-scoped memories")]
    MissingUserId,
    #[error("identifier '{0}' contains no usable characters")]
    InvalidKey(String),
}

/// Errors raised while talking to an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation() {
        let err = CollaboratorError::Timeout {
            operation: "model completion",
            secs: 5,
        };
        assert_eq!(err.to_string(), "model completion timed out after 5s");
    }
}
