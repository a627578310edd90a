//! Error types for the import library.

use std::fmt;

use thiserror::Error;

/// Main error type for import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tokio_postgres::Error),

    /// Source catalog error reported by a dialect without a driver error
    #[error("Source catalog error: {0}")]
    Catalog(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Metadata retrieval failed for a specific table
    #[error("Metadata retrieval failed for table {table}: {message}")]
    Metadata { table: String, message: String },

    /// Target schema could not be derived for a specific table
    #[error("Schema build failed for table {table}: {message}")]
    Schema { table: String, message: String },

    /// Source type code that has no target mapping
    #[error("Unsupported type code {code} for column {column}")]
    UnsupportedType { column: String, code: i32 },

    /// Value conversion failed for one column
    #[error("Failed conversion for column {column}: {message}")]
    Conversion { column: String, message: String },

    /// A source value could not be read or represented
    #[error("Invalid value: {0}")]
    Value(String),

    /// Target store operation failed
    #[error("Target store error: {0}")]
    Target(#[from] TargetError),

    /// Bulk upload failed
    #[error("Upload failed for {path}: {message}")]
    Upload { path: String, message: String },

    /// Nothing was imported
    #[error("No tables succeeded out of {0}")]
    NoTablesSucceeded(usize),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Metadata error
    pub fn metadata(table: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Metadata {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Schema error
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Conversion error
    pub fn conversion(column: impl Into<String>, message: impl ToString) -> Self {
        ImportError::Conversion {
            column: column.into(),
            message: message.to_string(),
        }
    }

    /// Create an Upload error
    pub fn upload(path: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Upload {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImportError::Config(_) | ImportError::Yaml(_) | ImportError::Json(_) => 1,
            ImportError::Source(_) | ImportError::Catalog(_) | ImportError::Pool { .. } => 2,
            ImportError::Target(_) | ImportError::Upload { .. } => 3,
            ImportError::NoTablesSucceeded(_) => 4,
            ImportError::Metadata { .. }
            | ImportError::Schema { .. }
            | ImportError::UnsupportedType { .. }
            | ImportError::Conversion { .. }
            | ImportError::Value(_) => 5,
            ImportError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

/// Status code reported by a target store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    BadRequest,
    SchemeError,
    NotFound,
    Overloaded,
    Unavailable,
    Aborted,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::SchemeError => "SCHEME_ERROR",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::Overloaded => "OVERLOADED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Internal => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// One entry of a target store's nested issue tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub message: String,
    pub issues: Vec<Issue>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            issues: Vec::new(),
        }
    }

    /// Attach a nested issue.
    pub fn with_child(mut self, child: Issue) -> Self {
        self.issues.push(child);
        self
    }
}

/// Structured failure status returned by a target store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct TargetError {
    pub status: StatusCode,
    pub issues: Vec<Issue>,
}

impl TargetError {
    pub fn new(status: StatusCode, issues: Vec<Issue>) -> Self {
        Self { status, issues }
    }

    /// Failure with a single top-level message.
    pub fn message(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, vec![Issue::new(message)])
    }

    /// Message of the deepest issue reached by following the first issue at
    /// every level. `None` when the status carries no issues.
    pub fn innermost_message(&self) -> Option<&str> {
        let mut issue = self.issues.first()?;
        while let Some(child) = issue.issues.first() {
            issue = child;
        }
        Some(&issue.message)
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.status)?;
        fn walk(f: &mut fmt::Formatter<'_>, issues: &[Issue]) -> fmt::Result {
            for issue in issues {
                write!(f, "; {}", issue.message)?;
                walk(f, &issue.issues)?;
            }
            Ok(())
        }
        walk(f, &self.issues)
    }
}
