use thiserror::Error;

pub mod context;

pub type Result<T> = std::result::Result<T, Error>;

pub use context::{ErrorChain, ErrorContext, OptionExt};

/// Broad classification of engine failures
///
/// Callers that only care about the category of a failure (for example to decide
/// whether to retry a unit of work) match on the kind instead of the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entity metadata is missing, malformed or does not allow the operation
    Schema,
    /// A portable query could not be translated for the target dialect
    Query,
    /// More (or other) rows than the operation's contract allows
    Cardinality,
    /// A required row does not exist
    NotFound,
    /// A version-predicated write matched no row
    OptimisticLock,
    /// Data source configuration problems
    Configuration,
    /// The session is no longer usable
    SessionState,
    /// The dialect cannot express the requested operation
    Unsupported,
    /// The database driver reported a failure
    Driver,
    /// Local I/O or parsing failure
    Io,
}

/// Main error type for the persistence engine
#[derive(Error, Debug)]
pub enum Error {
    // Schema errors
    #[error("No entity schema registered for '{0}'")]
    SchemaNotFound(String),

    #[error("Field '{field}' not found on entity '{entity}'")]
    FieldNotFound { entity: String, field: String },

    #[error("Entity '{entity}' is view-only and cannot be used for {operation}")]
    ViewOnlyMutation { entity: String, operation: String },

    #[error("Invalid schema for entity '{entity}': {message}")]
    InvalidSchema { entity: String, message: String },

    #[error("Conversion error: {0}")]
    Conversion(String),

    // Query errors
    #[error(
        "Restriction on '{field}' of '{entity}' has {count} values, exceeding the {max} allowed by the dialect"
    )]
    TooManyClauseValues {
        entity: String,
        field: String,
        count: usize,
        max: usize,
    },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    // Cardinality errors
    #[error("Multiple results found for single-result query on '{entity}'")]
    MultipleResultFound { entity: String },

    #[error("Multiple child records found for single child '{child}' of '{entity}' with id {id}")]
    MultipleChildFound {
        entity: String,
        child: String,
        id: String,
    },

    #[error("Duplicate key '{key}' found while building map of '{entity}' by '{field}'")]
    DuplicateKeyFound {
        entity: String,
        field: String,
        key: String,
    },

    // Not found errors
    #[error("Record of '{entity}' with id {id} not found")]
    RecordNotFound { entity: String, id: String },

    #[error("No record of '{entity}' matches the query")]
    NoMatchingRecord { entity: String },

    // Optimistic locking
    #[error("Record of '{entity}' with id {id} and version {version} not found")]
    RecordVersionMismatch {
        entity: String,
        id: String,
        version: String,
    },

    // Configuration errors
    #[error("Data source '{0}' is already configured")]
    AlreadyConfigured(String),

    #[error("Data source '{0}' is not configured")]
    UnknownConfiguration(String),

    #[error("Invalid data source configuration: {0}")]
    InvalidConfiguration(String),

    // Session state
    #[error("Database session is closed")]
    SessionClosed,

    #[error("{dialect} dialect does not support {feature}")]
    UnsupportedFeature { dialect: String, feature: String },

    #[error("Database error on data source '{data_source}' while {context}: {source}")]
    Driver {
        data_source: String,
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "config")]
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Error with context chain
    #[error("{message}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn schema_not_found(entity: impl Into<String>) -> Self {
        Self::SchemaNotFound(entity.into())
    }

    pub fn field_not_found(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn view_only(entity: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::ViewOnlyMutation {
            entity: entity.into(),
            operation: operation.into(),
        }
    }

    pub fn invalid_schema(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn record_not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::RecordNotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn version_mismatch(
        entity: impl Into<String>,
        id: impl ToString,
        version: impl ToString,
    ) -> Self {
        Self::RecordVersionMismatch {
            entity: entity.into(),
            id: id.to_string(),
            version: version.to_string(),
        }
    }

    pub fn unsupported(dialect: impl Into<String>, feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            dialect: dialect.into(),
            feature: feature.into(),
        }
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Wrap a driver error with the data source and the operation being performed
    pub fn driver(
        data_source: impl Into<String>,
        context: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        Self::Driver {
            data_source: data_source.into(),
            context: context.into(),
            source,
        }
    }

    // Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers and return the underlying error
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::WithContext { source, .. } = current {
            current = source;
        }
        current
    }

    /// Get the category of the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaNotFound(_)
            | Error::FieldNotFound { .. }
            | Error::ViewOnlyMutation { .. }
            | Error::InvalidSchema { .. }
            | Error::Conversion(_) => ErrorKind::Schema,
            Error::TooManyClauseValues { .. } | Error::InvalidQuery(_) => ErrorKind::Query,
            Error::MultipleResultFound { .. }
            | Error::MultipleChildFound { .. }
            | Error::DuplicateKeyFound { .. } => ErrorKind::Cardinality,
            Error::RecordNotFound { .. } | Error::NoMatchingRecord { .. } => ErrorKind::NotFound,
            Error::RecordVersionMismatch { .. } => ErrorKind::OptimisticLock,
            Error::AlreadyConfigured(_)
            | Error::UnknownConfiguration(_)
            | Error::InvalidConfiguration(_) => ErrorKind::Configuration,
            Error::SessionClosed => ErrorKind::SessionState,
            Error::UnsupportedFeature { .. } => ErrorKind::Unsupported,
            Error::Driver { .. } => ErrorKind::Driver,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
            #[cfg(feature = "config")]
            Error::Toml(_) => ErrorKind::Io,
            Error::WithContext { source, .. } => source.kind(),
        }
    }

    /// Check if error is retryable
    ///
    /// Only connectivity failures qualify. Optimistic lock failures need the caller
    /// to reload the record first, so they are not reported as retryable here.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Driver { source, .. } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Get a stable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            Error::FieldNotFound { .. } => "FIELD_NOT_FOUND",
            Error::ViewOnlyMutation { .. } => "VIEW_ONLY_MUTATION",
            Error::InvalidSchema { .. } => "INVALID_SCHEMA",
            Error::Conversion(_) => "CONVERSION",
            Error::TooManyClauseValues { .. } => "TOO_MANY_CLAUSE_VALUES",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::MultipleResultFound { .. } => "MULTIPLE_RESULT_FOUND",
            Error::MultipleChildFound { .. } => "MULTIPLE_CHILD_FOUND",
            Error::DuplicateKeyFound { .. } => "DUPLICATE_KEY_FOUND",
            Error::RecordNotFound { .. } => "RECORD_WITH_PK_NOT_FOUND",
            Error::NoMatchingRecord { .. } => "NO_MATCHING_RECORD",
            Error::RecordVersionMismatch { .. } => "RECORD_WITH_PK_VERSION_NOT_FOUND",
            Error::AlreadyConfigured(_) => "DATASOURCE_ALREADY_CONFIGURED",
            Error::UnknownConfiguration(_) => "DATASOURCE_IS_UNKNOWN",
            Error::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Error::SessionClosed => "SESSION_IS_CLOSED",
            Error::UnsupportedFeature { .. } => "UNSUPPORTED_FEATURE",
            Error::Driver { .. } => "DRIVER",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
            #[cfg(feature = "config")]
            Error::Toml(_) => "CONFIG_PARSE",
            Error::WithContext { source, .. } => source.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_context_chain() {
        let err = Error::version_mismatch("Account", 7, 3)
            .with_context("updating account")
            .with_context("closing month");

        assert_eq!(err.kind(), ErrorKind::OptimisticLock);
        assert_eq!(err.error_code(), "RECORD_WITH_PK_VERSION_NOT_FOUND");
        assert!(matches!(err.root(), Error::RecordVersionMismatch { .. }));
    }

    #[test]
    fn test_retryable_only_for_connectivity() {
        let timed_out = Error::driver("main", "fetching rows", sqlx::Error::PoolTimedOut);
        assert!(timed_out.is_retryable());

        let not_found = Error::record_not_found("Account", 1);
        assert!(!not_found.is_retryable());

        let protocol = Error::driver(
            "main",
            "fetching rows",
            sqlx::Error::Protocol("bad packet".into()),
        );
        assert!(!protocol.is_retryable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::TooManyClauseValues {
            entity: "Account".into(),
            field: "id".into(),
            count: 1000,
            max: 999,
        };
        let message = err.to_string();
        assert!(message.contains("1000"));
        assert!(message.contains("999"));
        assert!(message.contains("Account"));
    }
}
