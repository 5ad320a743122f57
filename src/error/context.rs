//! Error context and chaining utilities
//!
//! Session operations wrap lower-level failures with the entity and operation
//! they were running, so a driver error surfaces as a readable chain such as
//! `deleting children of Invoice -> Database error on data source 'main' ...`.

use super::Error;
use std::fmt;

/// Trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to the error
    fn context<C>(self, context: C) -> Result<T, Error>
    where
        C: Into<String>;

    /// Add context with lazy evaluation
    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn context<C>(self, context: C) -> Result<T, Error>
    where
        C: Into<String>,
    {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

/// Flattened view of an error and its context wrappers
pub struct ErrorChain<'a> {
    error: &'a Error,
    chain: Vec<String>,
}

impl<'a> ErrorChain<'a> {
    pub fn new(error: &'a Error) -> Self {
        let mut chain = Vec::new();
        let mut current = error;
        loop {
            match current {
                Error::WithContext { message, source } => {
                    chain.push(message.clone());
                    current = source;
                }
                other => {
                    chain.push(other.to_string());
                    break;
                }
            }
        }
        Self { error, chain }
    }

    /// Messages from the outermost context down to the root cause
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn root_cause(&self) -> &Error {
        self.error.root()
    }

    /// Format the error chain for logging
    pub fn format_for_log(&self) -> String {
        self.chain.join(" -> ")
    }
}

impl<'a> fmt::Display for ErrorChain<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_for_log())
    }
}

/// Extension trait turning a missing value into a schema error
pub trait OptionExt<T> {
    /// Convert None into [`Error::InvalidSchema`] for the given entity
    fn or_invalid_schema<F, C>(self, entity: &str, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_invalid_schema<F, C>(self, entity: &str, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::invalid_schema(entity, f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_chaining() {
        let with_context = Error::record_not_found("Account", 42)
            .with_context("loading account")
            .with_context("closing month");

        if let Error::WithContext { message, source } = with_context {
            assert_eq!(message, "closing month");
            if let Error::WithContext { message, source } = source.as_ref() {
                assert_eq!(message, "loading account");
                assert!(matches!(source.as_ref(), Error::RecordNotFound { .. }));
            }
        } else {
            panic!("Expected WithContext error");
        }
    }

    #[test]
    fn test_error_chain_formatting() {
        let error = Error::SessionClosed
            .with_context("committing")
            .with_context("month end");

        let chain = ErrorChain::new(&error);

        assert_eq!(chain.chain().len(), 3);
        assert_eq!(
            chain.format_for_log(),
            "month end -> committing -> Database session is closed"
        );
        assert!(matches!(chain.root_cause(), Error::SessionClosed));
    }

    #[test]
    fn test_result_context() {
        let result: Result<(), Error> = Err(Error::invalid_query("empty select"));
        let with_context = result.context("listing accounts");

        match with_context {
            Err(e) => {
                assert!(matches!(e, Error::WithContext { .. }));
                assert_eq!(e.error_code(), "INVALID_QUERY");
            }
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_option_ext() {
        let missing: Option<u8> = None;
        let err = missing
            .or_invalid_schema("Account", || "no id field")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchema { .. }));
    }
}
