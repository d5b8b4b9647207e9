use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single fetch attempt.
///
/// Cloneable so that one outcome can be cached as a negative entry and replayed to
/// every thread that waited on the same key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timeout while fetching {uri}")]
    Timeout { uri: String },

    #[error("unknown host '{host}' while fetching {uri}")]
    UnknownHost { uri: String, host: String },

    #[error("not found: {uri}")]
    NotFound { uri: String },

    #[error("transport error while fetching {uri}: {details}")]
    Transport { uri: String, details: String },
}

impl FetchError {
    /// The key (URI) the failed fetch was made for
    pub fn uri(&self) -> &str {
        match self {
            FetchError::Timeout { uri }
            | FetchError::UnknownHost { uri, .. }
            | FetchError::NotFound { uri }
            | FetchError::Transport { uri, .. } => uri,
        }
    }

    /// Short tag used when the error is persisted in a marker file
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::UnknownHost { .. } => "unknown-host",
            FetchError::NotFound { .. } => "not-found",
            FetchError::Transport { .. } => "transport",
        }
    }
}

/// Errors that abort construction or startup; never retried automatically
#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("cannot create cache directory {path}: {reason}")]
    CacheDirectoryNotCreatable { path: PathBuf, reason: String },

    #[error("cache directory {path} is not usable: {reason}")]
    CacheDirectoryNotUsable { path: PathBuf, reason: String },

    #[error("bootstrap grammar {location} failed to compile: {details}")]
    BootstrapGrammar { location: String, details: String },

    #[error("HTTP client initialization failed: {details}")]
    HttpClient { details: String },

    #[error("engine already started")]
    EngineAlreadyStarted,

    #[error("invalid thread count: {0}")]
    InvalidThreadCount(usize),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("validation root {path} is not accessible: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },
}

/// Main application error type
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    #[error("Schema parsing error: {url} - {details}")]
    SchemaParsing { url: String, details: String },

    #[error("XML validation failed: {file} - {details}")]
    ValidationFailed { file: PathBuf, details: String },

    #[error("Schema URL extraction failed: {file} - no schema location found")]
    SchemaUrlNotFound { file: PathBuf },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LibXML2 internal error: {details}")]
    LibXml2Internal { details: String },

    #[error("Engine is not running")]
    EngineNotRunning,

    #[error("Job for {root} was already submitted")]
    JobAlreadySubmitted { root: PathBuf },

    #[error("Job for {root} was already canceled")]
    JobAlreadyCanceled { root: PathBuf },

    #[error("Rule evaluation failed: {details}")]
    RuleEngine { details: String },
}

/// Cache-specific error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache write error: {key} - {details}")]
    WriteError { key: String, details: String },
}

/// LibXML2-specific error types
#[derive(Error, Debug)]
pub enum LibXml2Error {
    #[error("Schema parsing failed: {details}")]
    SchemaParseFailed { details: String },

    #[error("Validation context creation failed")]
    ValidationContextCreationFailed,

    #[error("File validation failed with code {code}: {file}")]
    ValidationFailed { code: i32, file: PathBuf },

    #[error("Memory allocation failed in libxml2")]
    MemoryAllocation,
}

impl From<CacheError> for ValidationError {
    fn from(err: CacheError) -> Self {
        ValidationError::Cache(err.to_string())
    }
}

impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        let CacheError::WriteError { key, details } = err;
        FetchError::Transport { uri: key, details }
    }
}

impl From<LibXml2Error> for ValidationError {
    fn from(err: LibXml2Error) -> Self {
        ValidationError::LibXml2Internal {
            details: err.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ValidationError>;

/// LibXML2 result type alias
pub type LibXml2Result<T> = std::result::Result<T, LibXml2Error>;
