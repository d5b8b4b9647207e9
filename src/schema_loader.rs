use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::cache::{Bytes, CachePolicy, CacheStats, DiskStore, Fetcher, SingleFlightFetchCache};
use crate::error::{FetchError, InitializationError, Result, ValidationError};
use crate::grammar_pool::GrammarDescriptor;
use crate::http_client::{HttpClient, HttpClientConfig};

/// Namespace of the `xml:` attributes
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Canonical location of the schema for [`XML_NAMESPACE`]
pub const XML_SCHEMA_LOCATION: &str = "http://www.w3.org/2001/xml.xsd";

/// Schema for [`XML_NAMESPACE`], shipped with the binary
pub static BUNDLED_XML_SCHEMA: &[u8] = include_bytes!("../resources/xml.xsd");

static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
static ROOT_TAG_REGEX: OnceLock<Regex> = OnceLock::new();
static SCHEMA_LOCATION_REGEX: OnceLock<Regex> = OnceLock::new();
static NO_NAMESPACE_REGEX: OnceLock<Regex> = OnceLock::new();
static DEFAULT_NAMESPACE_REGEX: OnceLock<Regex> = OnceLock::new();

fn comment_regex() -> &'static Regex {
    COMMENT_REGEX.get_or_init(|| Regex::new(r#"(?s)<!--.*?-->"#).expect("Failed to compile comment regex"))
}

/// A start tag; PIs and doctype start with `<?` or `<!` and never match
fn root_tag_regex() -> &'static Regex {
    ROOT_TAG_REGEX.get_or_init(|| {
        Regex::new(r#"<[A-Za-z_][\w.:-]*(?:\s[^>]*)?>"#).expect("Failed to compile root tag regex")
    })
}

fn schema_location_regex() -> &'static Regex {
    SCHEMA_LOCATION_REGEX.get_or_init(|| {
        Regex::new(r#"[\w.-]+:schemaLocation\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile schemaLocation regex")
    })
}

fn no_namespace_regex() -> &'static Regex {
    NO_NAMESPACE_REGEX.get_or_init(|| {
        Regex::new(r#"[\w.-]+:noNamespaceSchemaLocation\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile noNamespaceSchemaLocation regex")
    })
}

fn default_namespace_regex() -> &'static Regex {
    DEFAULT_NAMESPACE_REGEX.get_or_init(|| {
        Regex::new(r#"\sxmlns\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile xmlns regex")
    })
}

/// Text of the document's first start tag, comments skipped
fn root_tag(document: &str) -> Option<String> {
    let without_comments = comment_regex().replace_all(document, "");
    root_tag_regex()
        .find(&without_comments)
        .map(|tag| tag.as_str().to_string())
}

fn attribute_value<'a>(caps: &regex::Captures<'a>) -> &'a str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map_or("", |m| m.as_str())
}

/// Where a schema document comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaSource {
    Local(PathBuf),
    Remote(String),
    Bundled,
}

/// A schema reference found in a document
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaReference {
    /// Target namespace, empty for `noNamespaceSchemaLocation`
    pub namespace: String,
    /// Location as written in the document
    pub location: String,
    pub source: SchemaSource,
}

impl SchemaReference {
    /// Grammar descriptor used to look this schema up in a pool
    pub fn descriptor(&self) -> GrammarDescriptor {
        GrammarDescriptor::new(&self.namespace)
            .with_system_id(&self.location, self.expanded_location())
            .with_location_hint(&self.location)
    }

    fn expanded_location(&self) -> String {
        match &self.source {
            SchemaSource::Local(path) => path.display().to_string(),
            SchemaSource::Remote(url) => url.clone(),
            SchemaSource::Bundled => XML_SCHEMA_LOCATION.to_string(),
        }
    }
}

/// Finds `xsi:schemaLocation` / `xsi:noNamespaceSchemaLocation` on the root element
///
/// Uses cached regexes from OnceLock, compiled on first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaExtractor;

impl SchemaExtractor {
    pub fn new() -> Self {
        Self
    }

    /// All schema references on the root element of `document`
    pub fn extract(&self, document: &str, file: &Path) -> Vec<SchemaReference> {
        let Some(root_tag) = root_tag(document) else {
            return Vec::new();
        };
        let root_tag = root_tag.as_str();
        let mut references = Vec::new();

        for caps in schema_location_regex().captures_iter(root_tag) {
            let tokens: Vec<&str> = attribute_value(&caps).split_whitespace().collect();
            for pair in tokens.chunks_exact(2) {
                references.push(Self::reference(pair[0], pair[1], file));
            }
        }

        if let Some(caps) = no_namespace_regex().captures(root_tag) {
            let location = attribute_value(&caps).trim();
            if !location.is_empty() {
                references.push(Self::reference("", location, file));
            }
        }

        references
    }

    /// The reference for the root element's namespace, falling back to the first one
    pub fn primary_reference(&self, document: &str, file: &Path) -> Result<SchemaReference> {
        let mut references = self.extract(document, file);
        let root_namespace = root_tag(document)
            .and_then(|tag| {
                default_namespace_regex()
                    .captures(&tag)
                    .map(|caps| attribute_value(&caps).to_string())
            })
            .unwrap_or_default();

        match references.iter().position(|r| r.namespace == root_namespace) {
            Some(index) => Ok(references.swap_remove(index)),
            None if !references.is_empty() => Ok(references.swap_remove(0)),
            None => Err(ValidationError::SchemaUrlNotFound {
                file: file.to_path_buf(),
            }),
        }
    }

    fn reference(namespace: &str, location: &str, file: &Path) -> SchemaReference {
        SchemaReference {
            namespace: namespace.to_string(),
            location: location.to_string(),
            source: Self::determine_source(namespace, location, file),
        }
    }

    /// Resolve `location` relative to the directory of the referring document
    fn determine_source(namespace: &str, location: &str, file: &Path) -> SchemaSource {
        if namespace == XML_NAMESPACE || location == XML_SCHEMA_LOCATION {
            return SchemaSource::Bundled;
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return SchemaSource::Remote(location.to_string());
        }

        let location = location
            .strip_prefix("file://")
            .or_else(|| location.strip_prefix("file:"))
            .unwrap_or(location);
        let path = Path::new(location);
        if path.is_absolute() {
            SchemaSource::Local(path.to_path_buf())
        } else {
            SchemaSource::Local(file.parent().unwrap_or(Path::new(".")).join(path))
        }
    }
}

/// Downloads schema documents
pub struct SchemaFetcher {
    client: HttpClient,
}

impl SchemaFetcher {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl Fetcher for SchemaFetcher {
    type Output = Bytes;

    fn fetch(&self, key: &str) -> std::result::Result<Bytes, FetchError> {
        debug!("downloading schema {}", key);
        self.client.get(key).map(Arc::new)
    }
}

#[derive(Debug, Clone)]
pub struct SchemaLoaderConfig {
    pub cache_directory: PathBuf,
    pub policy: CachePolicy,
    pub http: HttpClientConfig,
}

impl Default for SchemaLoaderConfig {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            policy: CachePolicy::default(),
            http: HttpClientConfig::default(),
        }
    }
}

/// `<user cache dir>/validate-xml`, or `./.validate-xml-cache` without one
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("validate-xml"))
        .unwrap_or_else(|| PathBuf::from(".validate-xml-cache"))
}

/// Reads schema documents from disk, from the bundled copy or through the
/// persistent single-flight cache
pub struct SchemaLoader {
    cache: SingleFlightFetchCache<SchemaFetcher, DiskStore>,
    bundled: Bytes,
}

impl SchemaLoader {
    pub fn new(config: SchemaLoaderConfig) -> std::result::Result<Self, InitializationError> {
        let store = DiskStore::new(&config.cache_directory)?;
        info!("using schema cache directory {}", store.directory().display());
        let fetcher = SchemaFetcher::new(HttpClient::new(config.http)?);

        Ok(Self {
            cache: SingleFlightFetchCache::new(fetcher, store, config.policy),
            bundled: Arc::new(BUNDLED_XML_SCHEMA.to_vec()),
        })
    }

    pub fn load(&self, reference: &SchemaReference) -> Result<Bytes> {
        match &reference.source {
            SchemaSource::Bundled => Ok(self.bundled.clone()),
            SchemaSource::Local(path) => self.load_local(path),
            SchemaSource::Remote(url) => Ok(self.cache.resolve(url)?),
        }
    }

    fn load_local(&self, path: &Path) -> Result<Bytes> {
        fs::read(path).map(Arc::new).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ValidationError::Fetch(FetchError::NotFound {
                uri: path.display().to_string(),
            }),
            _ => ValidationError::Io(e),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
