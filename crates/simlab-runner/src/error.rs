use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A batch operation cannot start (or continue) without risking the
    /// integrity of existing data. Nothing has been written when this is
    /// returned.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// A non-empty field failed to parse as its declared type, or a row did
    /// not match the agreed column layout.
    #[error("malformed record in run {run_id} at {location}: {message}")]
    MalformedRecord {
        run_id: i64,
        location: String,
        message: String,
    },

    /// The batch submission command was unavailable or rejected a script.
    #[error("submission command `{command}` failed for {script}: {message}")]
    ExternalToolFailure {
        command: String,
        script: PathBuf,
        message: String,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Stable machine-readable code, used by the CLI's JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::PreconditionViolation(_) => "precondition_violation",
            Error::MalformedRecord { .. } => "malformed_record",
            Error::ExternalToolFailure { .. } => "external_tool_failure",
            Error::Io { .. } => "io_error",
            Error::Csv(e) if e.is_io_error() => "io_error",
            Error::Sqlite(_) => "store_error",
            Error::Json(_) | Error::Yaml(_) => "document_error",
            Error::Csv(_) => "malformed_record",
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Error::PreconditionViolation(message.into())
    }

    pub(crate) fn malformed(
        run_id: i64,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::MalformedRecord {
            run_id,
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Attaches the offending path to a raw I/O error.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
