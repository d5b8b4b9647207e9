//! Per-file validation pipeline
//!
//! A [`Validator`] runs three stages for every file handed to it by the engine:
//!
//! 1. a [`StructuralValidator`] parses the document and validates it against its
//!    schema; the libxml2-backed [`SchemaValidator`] is the stock implementation
//! 2. an optional [`RuleEngine`]
//! 3. any number of [`Extension`]s
//!
//! Stages 2 and 3 only see documents that passed stage 1.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{InitializationError, Result, ValidationError};
use crate::grammar_pool::{Grammar, GrammarPool};
use crate::job::FileProcessor;
use crate::libxml2::{
    CompiledSchema, Diagnostic, DiagnosticLevel, LibXml2Wrapper, ValidationResult,
    register_bundled_resource,
};
use crate::report::{Message, Severity, ValidationReport};
use crate::schema_loader::{
    BUNDLED_XML_SCHEMA, SchemaExtractor, SchemaLoader, SchemaReference, SchemaSource,
    XML_NAMESPACE, XML_SCHEMA_LOCATION,
};

/// A schema-valid document handed to the later stages
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    text: String,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Parses and schema-validates a file.
///
/// Returns the document when it is schema-valid, `None` when it is not; either way
/// the diagnostics end up in `report`.
pub trait StructuralValidator: Send + Sync {
    fn validate(&self, file: &Path, report: &mut ValidationReport) -> Result<Option<Document>>;
}

/// Evaluates rules on a schema-valid document
pub trait RuleEngine: Send + Sync {
    fn evaluate(&self, document: &Document, report: &mut ValidationReport) -> Result<()>;
}

/// Namespace-specific checks on a schema-valid document
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, document: &Document, report: &mut ValidationReport) -> Result<()>;
}

/// libxml2-backed schema validation with a per-instance grammar pool
///
/// Construction compiles the bundled `xml.xsd`, caches it as the only primary grammar
/// and locks the pool; schemas met afterwards land in the pool's shadow tier.
pub struct SchemaValidator {
    libxml2: LibXml2Wrapper,
    pool: GrammarPool<CompiledSchema>,
    loader: Arc<SchemaLoader>,
    extractor: SchemaExtractor,
}

impl SchemaValidator {
    pub fn new(loader: Arc<SchemaLoader>) -> std::result::Result<Self, InitializationError> {
        Self::with_pool(loader, GrammarPool::new())
    }

    pub fn with_pool(
        loader: Arc<SchemaLoader>,
        pool: GrammarPool<CompiledSchema>,
    ) -> std::result::Result<Self, InitializationError> {
        let libxml2 = LibXml2Wrapper::new();
        let bootstrap_error = |details: String| InitializationError::BootstrapGrammar {
            location: XML_SCHEMA_LOCATION.to_string(),
            details,
        };

        register_bundled_resource(XML_SCHEMA_LOCATION, BUNDLED_XML_SCHEMA)
            .map_err(|e| bootstrap_error(e.to_string()))?;
        let schema = libxml2
            .parse_schema_from_memory(BUNDLED_XML_SCHEMA)
            .map_err(|e| bootstrap_error(e.to_string()))?;

        let bootstrap = SchemaReference {
            namespace: XML_NAMESPACE.to_string(),
            location: XML_SCHEMA_LOCATION.to_string(),
            source: SchemaSource::Bundled,
        };
        pool.cache_grammars(&[CompiledSchema::new(bootstrap.descriptor(), schema)]);
        pool.lock_pool();
        debug!("grammar pool locked with bootstrap schema {}", XML_SCHEMA_LOCATION);

        Ok(Self {
            libxml2,
            pool,
            loader,
            extractor: SchemaExtractor::new(),
        })
    }

    pub fn pool(&self) -> &GrammarPool<CompiledSchema> {
        &self.pool
    }

    /// The compiled grammar for `reference`, from the pool or freshly compiled
    fn grammar(&self, reference: &SchemaReference) -> Result<CompiledSchema> {
        let descriptor = reference.descriptor();
        if let Some(grammar) = self.pool.retrieve_grammar(&descriptor) {
            trace!("reusing grammar for namespace '{}'", grammar.namespace());
            return Ok(grammar);
        }

        let bytes = self.loader.load(reference)?;
        let schema = self
            .libxml2
            .parse_schema_from_memory(&bytes)
            .map_err(|e| ValidationError::SchemaParsing {
                url: reference.location.clone(),
                details: e.to_string(),
            })?;
        let grammar = CompiledSchema::new(descriptor, schema);
        self.pool.cache_grammars(std::slice::from_ref(&grammar));
        Ok(grammar)
    }
}

impl StructuralValidator for SchemaValidator {
    fn validate(&self, file: &Path, report: &mut ValidationReport) -> Result<Option<Document>> {
        let bytes = fs::read(file)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let grammar = match self
            .extractor
            .primary_reference(&text, file)
            .and_then(|reference| self.grammar(&reference))
        {
            Ok(grammar) => grammar,
            Err(err) => {
                report.error(describe_schema_failure(&err));
                return Ok(None);
            }
        };

        let result = self.libxml2.validate_file(grammar.schema(), file)?;
        for diagnostic in result.diagnostics() {
            report.add(to_message(diagnostic));
        }

        match result {
            ValidationResult::Valid { .. } => Ok(Some(Document::new(file, text))),
            ValidationResult::Invalid { error_count, diagnostics } => {
                if !diagnostics.iter().any(|d| d.level >= DiagnosticLevel::Error) {
                    report.error(format!(
                        "document is not valid ({} schema violation(s))",
                        error_count
                    ));
                }
                Ok(None)
            }
            ValidationResult::InternalError { code } => Err(ValidationError::LibXml2Internal {
                details: format!("validation returned {}", code),
            }),
        }
    }
}

fn to_message(diagnostic: &Diagnostic) -> Message {
    let severity = match diagnostic.level {
        DiagnosticLevel::Warning => Severity::Warning,
        DiagnosticLevel::Error | DiagnosticLevel::Fatal => Severity::Error,
    };
    Message::new(severity, diagnostic.message.clone()).at(diagnostic.line, diagnostic.column)
}

fn describe_schema_failure(err: &ValidationError) -> String {
    match err {
        ValidationError::SchemaUrlNotFound { .. } => {
            "no schema reference (xsi:schemaLocation or xsi:noNamespaceSchemaLocation) found".to_string()
        }
        ValidationError::Fetch(fetch) => format!("unable to load schema: {}", fetch),
        ValidationError::SchemaParsing { url, details } => {
            format!("unable to compile schema {}: {}", url, details)
        }
        other => other.to_string(),
    }
}

/// The [`FileProcessor`] the engine drives
pub struct Validator {
    structural: Box<dyn StructuralValidator>,
    rules: Option<Box<dyn RuleEngine>>,
    extensions: Vec<Box<dyn Extension>>,
}

impl Validator {
    pub fn new(structural: impl StructuralValidator + 'static) -> Self {
        Self {
            structural: Box::new(structural),
            rules: None,
            extensions: Vec::new(),
        }
    }

    pub fn with_rule_engine(mut self, rules: impl RuleEngine + 'static) -> Self {
        self.rules = Some(Box::new(rules));
        self
    }

    pub fn with_extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }
}

impl FileProcessor for Validator {
    fn process(&self, file: &Path) -> Result<ValidationReport> {
        let mut report = ValidationReport::new(file);
        let Some(document) = self.structural.validate(file, &mut report)? else {
            return Ok(report);
        };

        if let Some(rules) = &self.rules {
            rules.evaluate(&document, &mut report).map_err(|e| ValidationError::RuleEngine {
                details: e.to_string(),
            })?;
        }
        for extension in &self.extensions {
            trace!("running extension {} on {}", extension.name(), file.display());
            extension.validate(&document, &mut report)?;
        }
        Ok(report)
    }
}
