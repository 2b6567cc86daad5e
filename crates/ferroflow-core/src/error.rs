use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::table::DescriptorError;

/// Upper bound on the response body excerpt carried by errors.
pub const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// Option and table-name validation failures, raised before any network call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown table '{value}', expected one of {expected}")]
    UnknownTable { value: String, expected: String },

    #[error("table_configuration for '{table}' must include non-empty {options}")]
    MissingOptions { table: String, options: String },

    #[error("table_configuration for '{table}' is contradictory: {message}")]
    ConflictingOptions { table: String, message: String },

    #[error("invalid value '{value}' for option '{option}': {reason}")]
    InvalidOption {
        option: String,
        value: String,
        reason: String,
    },

    #[error("invalid JSON in '{option}' option: {value}")]
    InvalidJson { option: String, value: String },

    #[error("connection option '{option}' is required")]
    MissingConnectionOption { option: String },
}

impl ConfigError {
    pub fn unknown_table(value: impl Into<String>, valid: &[&str]) -> Self {
        Self::UnknownTable {
            value: value.into(),
            expected: valid.join(", "),
        }
    }

    pub fn missing_options(table: impl Into<String>, options: &[&str]) -> Self {
        let quoted = options
            .iter()
            .map(|option| format!("'{option}'"))
            .collect::<Vec<_>>()
            .join(" and ");
        Self::MissingOptions {
            table: table.into(),
            options: quoted,
        }
    }

    pub fn invalid_option(
        option: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            option: option.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Where a failed upstream call happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub table: Option<String>,
    pub endpoint: String,
    pub status: Option<u16>,
    pub body: String,
}

impl ErrorContext {
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = truncate_body(body);
        self
    }
}

impl Display for ErrorContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "table={table} ")?;
        }
        write!(f, "endpoint={}", self.endpoint)?;
        if let Some(status) = self.status {
            write!(f, " status={status}")?;
        }
        if !self.body.is_empty() {
            write!(f, " body={}", self.body)?;
        }
        Ok(())
    }
}

/// Tagged failure of a connector operation.
///
/// Only [`ConnectorError::Transient`] is eligible for retry; everything else
/// is surfaced to the caller as-is and leaves the stored offset untouched.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transient upstream failure: {message} ({context})")]
    Transient {
        context: ErrorContext,
        message: String,
    },

    #[error("upstream request failed: {message} ({context})")]
    Fatal {
        context: ErrorContext,
        message: String,
    },

    #[error("unexpected response shape: expected {expected}, got {actual} ({context})")]
    Protocol {
        context: ErrorContext,
        expected: String,
        actual: String,
    },

    #[error("{operation} is not supported for table '{table}' (ingestion type {mode})")]
    Unsupported {
        operation: &'static str,
        table: String,
        mode: String,
    },

    #[error("failed to decode response ({context}): {source}")]
    Decode {
        context: ErrorContext,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Catalog(#[from] DescriptorError),
}

impl ConnectorError {
    pub fn transient(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::Transient {
            context,
            message: message.into(),
        }
    }

    pub fn fatal(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::Fatal {
            context,
            message: message.into(),
        }
    }

    pub fn protocol(
        context: ErrorContext,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            context,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "connector.config",
            Self::Transient { .. } => "connector.transient",
            Self::Fatal { .. } => "connector.fatal",
            Self::Protocol { .. } => "connector.protocol",
            Self::Unsupported { .. } => "connector.unsupported",
            Self::Decode { .. } => "connector.decode",
            Self::Catalog(_) => "connector.catalog",
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Upstream status code, when the failure came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { context, .. }
            | Self::Fatal { context, .. }
            | Self::Protocol { context, .. }
            | Self::Decode { context, .. } => context.status,
            Self::Config(_) | Self::Unsupported { .. } | Self::Catalog(_) => None,
        }
    }

    /// Attaches the table name to errors raised below the dispatch layer.
    pub fn in_table(self, table: &str) -> Self {
        match self {
            Self::Transient { context, message } => Self::Transient {
                context: context.with_table(table),
                message,
            },
            Self::Fatal { context, message } => Self::Fatal {
                context: context.with_table(table),
                message,
            },
            Self::Protocol {
                context,
                expected,
                actual,
            } => Self::Protocol {
                context: context.with_table(table),
                expected,
                actual,
            },
            Self::Decode { context, source } => Self::Decode {
                context: context.with_table(table),
                source,
            },
            other => other,
        }
    }
}

/// Short name of a JSON value's shape, used in protocol violations.
pub fn json_shape(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_table_lists_valid_names() {
        let error = ConfigError::unknown_table("isues", &["issues", "commits"]);

        assert_eq!(
            error.to_string(),
            "unknown table 'isues', expected one of issues, commits"
        );
    }

    #[test]
    fn missing_options_names_table_and_keys() {
        let error = ConfigError::missing_options("issues", &["owner", "repo"]);

        assert_eq!(
            error.to_string(),
            "table_configuration for 'issues' must include non-empty 'owner' and 'repo'"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = ConnectorError::transient(ErrorContext::endpoint("/x"), "timeout");
        let fatal = ConnectorError::fatal(ErrorContext::endpoint("/x"), "gone");

        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!ConnectorError::from(ConfigError::unknown_table("x", &[])).is_retryable());
        assert_eq!(fatal.code(), "connector.fatal");
    }

    #[test]
    fn fatal_error_display_carries_full_context() {
        let context = ErrorContext::endpoint("/repos/acme/widgets/issues")
            .with_status(500)
            .with_body("boom");
        let error = ConnectorError::fatal(context, "server error").in_table("issues");

        let rendered = error.to_string();
        assert!(rendered.contains("table=issues"));
        assert!(rendered.contains("endpoint=/repos/acme/widgets/issues"));
        assert!(rendered.contains("status=500"));
        assert!(rendered.contains("body=boom"));
        assert_eq!(error.status(), Some(500));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY_CHARS + 50);
        let context = ErrorContext::endpoint("/").with_body(&body);

        assert_eq!(context.body.len(), MAX_ERROR_BODY_CHARS + 3);
        assert!(context.body.ends_with("..."));
    }
}
