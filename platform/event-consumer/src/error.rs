//! Thin error wrapper over `event_bus::MessagingError` plus `sqlx::Error`,
//! so the state machine in `consumer.rs` only ever matches on the §4.7
//! seven-way classification and never on a raw `sqlx`/`lapin` type.

use event_bus::{ErrorClass, MessagingError};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// A database failure from an outbox operation — classified `Storage`
    /// (§4.7 rule 2's "... or storage" branch).
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A database failure from an inbox claim/status operation — classified
    /// `Inbox` (§4.7 rule 2's "Database error subclasses → inbox (when from
    /// repository)" branch). Kept distinct from [`Self::Sqlx`] so the
    /// consumer state machine's circuit breaker and `error_type` metric tag
    /// can tell inbox-claim trouble apart from plain storage trouble.
    #[error("inbox database error: {0}")]
    Inbox(sqlx::Error),
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::Messaging(e) => e.class(),
            RepositoryError::Sqlx(e) => classify_sqlx_error(e),
            RepositoryError::Inbox(e) => match classify_sqlx_error(e) {
                ErrorClass::Storage => ErrorClass::Inbox,
                other => other, // schema-mismatch SQLSTATEs still surface as Config
            },
        }
    }
}

/// `sqlx::Error` is classified `Storage` except for the schema-mismatch
/// SQLSTATEs called out in SPEC_FULL.md §6.3, which are `Config` (the
/// repository assumes the tables already exist and treats a missing
/// column/table as a setup mistake, not a transient fault).
fn classify_sqlx_error(err: &sqlx::Error) -> ErrorClass {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            match code.as_ref() {
                "42703" | "42P01" => return ErrorClass::Config, // undefined_column / undefined_table
                _ => {}
            }
        }
    }
    ErrorClass::Storage
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),
}

impl ConsumerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConsumerError::Messaging(e) => e.class(),
            ConsumerError::Repository(e) => e.class(),
            ConsumerError::Handler(_) => ErrorClass::Handler,
            ConsumerError::HandlerTimeout(_) => ErrorClass::Timeout,
        }
    }
}
