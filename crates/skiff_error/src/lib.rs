//! Error types shared across skiff crates.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Coarse classification for errors that callers may want to branch on.
///
/// Most errors are `Internal`. The remaining codes exist for conditions the
/// scheduler surfaces to users with distinct semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A bug or violated invariant inside skiff.
    Internal,
    /// No worker nodes were available to host a stage.
    NoNodesAvailable,
    /// The operation was canceled.
    Canceled,
    /// Functionality that hasn't been implemented yet.
    NotImplemented,
    /// An error produced by an external collaborator (connector, remote task).
    External,
}

/// The skiff error type.
///
/// Carries a message, an optional source error, and optional key/value fields
/// providing context for the failure. Fields are appended to the rendered
/// message.
#[derive(Debug, Clone)]
pub struct DbError {
    code: ErrorCode,
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
    fields: Vec<(&'static str, String)>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        DbError {
            code: ErrorCode::Internal,
            message: message.into(),
            source: None,
            fields: Vec::new(),
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: Box<dyn Error + Send + Sync>,
    ) -> Self {
        DbError {
            code: ErrorCode::Internal,
            message: message.into(),
            source: Some(Arc::from(source)),
            fields: Vec::new(),
        }
    }

    /// Attach a key/value field to the error.
    pub fn with_field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Set the error code.
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for (key, value) in &self.fields {
            write!(f, "; {key} = {value}")?;
        }
        if let Some(source) = &self.source {
            write!(f, "; source: {source}")?;
        }
        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as _)
    }
}

/// Extension trait for attaching context to results holding foreign errors.
pub trait ResultExt<T> {
    /// Wrap the error with a static context message.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap the error with a lazily built context message.
    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| DbError::with_source(msg, Box::new(e)))
    }

    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| DbError::with_source(f(), Box::new(e)))
    }
}

/// Extension trait for turning a missing optional value into an error.
pub trait OptionExt<T> {
    /// Return the value, or an error naming what was missing.
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(format!("Missing required value: {what}"))),
        }
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        return Err($crate::DbError::new(format!("Not yet implemented: {msg}"))
            .with_code($crate::ErrorCode::NotImplemented));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_fields() {
        let err = DbError::new("No worker nodes available")
            .with_code(ErrorCode::NoNodesAvailable)
            .with_field("stage_id", 4);
        assert_eq!(
            "No worker nodes available; stage_id = 4",
            err.to_string()
        );
        assert_eq!(ErrorCode::NoNodesAvailable, err.code());
    }

    #[test]
    fn context_wraps_source() {
        let res: Result<(), _> = "nope".parse::<u64>().map(|_| ());
        let err = res.context("Failed to parse count").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse count"));
        assert!(err.source().is_some());
    }

    #[test]
    fn required_on_none() {
        let v: Option<u32> = None;
        let err = v.required("bucket count").unwrap_err();
        assert_eq!("Missing required value: bucket count", err.to_string());
    }
}
