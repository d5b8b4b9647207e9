//! # validate-xml Library
//!
//! Concurrent XML Schema validation with single-flight, persistently cached schema
//! downloads, a per-validator grammar pool and a fair worker pool that interleaves
//! files from any number of submitted validation jobs.

pub mod cache;
pub mod check_handles;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_filter;
pub mod grammar_pool;
pub mod handle_resolver;
pub mod http_client;
pub mod job;
pub mod libxml2;
pub mod lru;
pub mod output;
pub mod report;
pub mod schema_loader;
pub mod validator;

pub use cache::{
    CachePolicy, CacheStats, DiskStore, EntryStore, Fetcher, MaxAge, MemoryStore,
    SingleFlightFetchCache,
};
pub use check_handles::CheckHandles;
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use config::{CheckPids, Config, ConfigError, ConfigManager};
pub use engine::Engine;
pub use error::{FetchError, InitializationError, ValidationError};
pub use file_filter::GlobFilter;
pub use grammar_pool::{FreezeCache, Grammar, GrammarDescriptor, GrammarPool};
pub use handle_resolver::{HandleResolver, HandleResolverConfig, ResolverStats};
pub use http_client::{HttpClient, HttpClientConfig};
pub use job::{FileFilter, FileProcessor, JobHandler, ValidationJob};
pub use libxml2::{LibXml2Wrapper, ValidationResult, XmlSchemaPtr};
pub use lru::BoundedLru;
pub use output::{Output, Summary};
pub use report::{Message, Severity, ValidationReport};
pub use schema_loader::{SchemaExtractor, SchemaLoader, SchemaLoaderConfig, SchemaReference, SchemaSource};
pub use validator::{Document, Extension, RuleEngine, SchemaValidator, StructuralValidator, Validator};
