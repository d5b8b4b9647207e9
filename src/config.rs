use crate::cache::{CachePolicy, MaxAge};
use crate::cli::{Cli, OutputFormat, VerbosityLevel};
use crate::engine::{DEFAULT_SHUTDOWN_TIMEOUT, default_thread_count};
use crate::grammar_pool::DEFAULT_SHADOW_CAPACITY;
use crate::handle_resolver::{DEFAULT_HANDLE_CACHE_SIZE, HandleResolverConfig};
use crate::http_client::HttpClientConfig;
use crate::schema_loader::{SchemaLoaderConfig, default_cache_directory};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MAX_THREADS: usize = 1000;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub validation: ValidationConfig,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub output: OutputConfig,
    pub files: FileConfig,
}

/// Persistent identifier checking mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckPids {
    #[default]
    Off,
    /// Check handle syntax only
    Syntax,
    /// Check syntax and resolve every handle
    Resolve,
}

impl FromStr for CheckPids {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(CheckPids::Off),
            "syntax" => Ok(CheckPids::Syntax),
            "resolve" => Ok(CheckPids::Resolve),
            other => Err(format!("unknown PID check mode '{}'", other)),
        }
    }
}

/// Validation-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Number of worker threads, defaults to the number of processors
    pub threads: Option<usize>,
    /// How long shutdown waits for busy workers
    pub shutdown_timeout_ms: u64,
    /// Grammars kept per validator once its pool is locked
    pub shadow_cache_size: usize,
    pub check_pids: CheckPids,
}

/// Schema cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory path
    pub directory: PathBuf,
    /// Age in hours after which a downloaded schema is fetched again; never when absent
    pub max_age_hours: Option<u64>,
    /// Seconds a failed download is remembered; 0 retries every time
    pub negative_max_age_secs: u64,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_redirects: usize,
    pub handle_connect_timeout_ms: u64,
    pub handle_read_timeout_ms: u64,
    pub max_concurrent_handle_requests: usize,
    pub handle_cache_size: usize,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormatConfig,
    /// Also print valid files and warnings
    pub verbose: bool,
    /// Errors only
    pub quiet: bool,
    pub debug: bool,
}

/// File processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// File extensions to process
    pub extensions: Vec<String>,
    /// Include patterns (glob syntax)
    pub include_patterns: Vec<String>,
    /// Exclude patterns (glob syntax)
    pub exclude_patterns: Vec<String>,
}

/// Output format configuration (serializable version of CLI OutputFormat)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatConfig {
    #[default]
    Human,
    Json,
}

impl From<OutputFormat> for OutputFormatConfig {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => OutputFormatConfig::Human,
            OutputFormat::Json => OutputFormatConfig::Json,
        }
    }
}

impl From<OutputFormatConfig> for OutputFormat {
    fn from(format: OutputFormatConfig) -> Self {
        match format {
            OutputFormatConfig::Human => OutputFormat::Human,
            OutputFormatConfig::Json => OutputFormat::Json,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            threads: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            shadow_cache_size: DEFAULT_SHADOW_CAPACITY,
            check_pids: CheckPids::Off,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_age_hours: None,
            negative_max_age_secs: 3600,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            read_timeout_ms: 60_000,
            max_redirects: 4,
            handle_connect_timeout_ms: 5_000,
            handle_read_timeout_ms: 10_000,
            max_concurrent_handle_requests: 8,
            handle_cache_size: DEFAULT_HANDLE_CACHE_SIZE,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_patterns: vec![],
            exclude_patterns: vec![],
        }
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment -> CLI
    pub fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(cli, &SystemEnvProvider)
    }

    pub fn load_config_with(cli: &Cli, env: &impl EnvProvider) -> Result<Config> {
        let config = match &cli.config {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::find_config_file()?.unwrap_or_default(),
        };
        let config = Self::apply_environment_overrides_with(env, config)?;
        let config = Self::merge_with_cli(config, cli);
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON); missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => Ok(config),
                Err(_) => Ok(serde_json::from_str(&content)?),
            },
        }
    }

    /// Find configuration file in standard locations
    pub fn find_config_file() -> Result<Option<Config>> {
        let mut directories = vec![PathBuf::new()];
        if let Some(config_dir) = dirs::config_dir() {
            directories.push(config_dir.join("validate-xml"));
        }
        Self::find_config_file_in(&directories)
    }

    pub fn find_config_file_in(directories: &[PathBuf]) -> Result<Option<Config>> {
        let config_names = [
            "validate-xml.toml",
            "validate-xml.json",
            ".validate-xml.toml",
            ".validate-xml.json",
        ];

        for directory in directories {
            for name in &config_names {
                let path = directory.join(name);
                if path.is_file() {
                    return Ok(Some(Self::load_from_file(&path)?));
                }
            }
        }
        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        // Validation settings
        if let Some(threads) = parse_env(env, "VALIDATE_XML_THREADS")? {
            config.validation.threads = Some(threads);
        }
        if let Some(timeout) = parse_env(env, "VALIDATE_XML_SHUTDOWN_TIMEOUT_MS")? {
            config.validation.shutdown_timeout_ms = timeout;
        }
        if let Some(mode) = parse_env(env, "VALIDATE_XML_CHECK_PIDS")? {
            config.validation.check_pids = mode;
        }

        // Cache settings
        if let Some(cache_dir) = env.get("VALIDATE_XML_CACHE_DIR") {
            config.cache.directory = PathBuf::from(cache_dir);
        }
        if let Some(hours) = parse_env(env, "VALIDATE_XML_CACHE_MAX_AGE_HOURS")? {
            config.cache.max_age_hours = Some(hours);
        }
        if let Some(secs) = parse_env(env, "VALIDATE_XML_NEGATIVE_MAX_AGE_SECS")? {
            config.cache.negative_max_age_secs = secs;
        }

        // Network settings
        if let Some(timeout) = parse_env(env, "VALIDATE_XML_CONNECT_TIMEOUT_MS")? {
            config.network.connect_timeout_ms = timeout;
        }
        if let Some(timeout) = parse_env(env, "VALIDATE_XML_READ_TIMEOUT_MS")? {
            config.network.read_timeout_ms = timeout;
        }

        // Output settings
        if let Some(verbose) = parse_env(env, "VALIDATE_XML_VERBOSE")? {
            config.output.verbose = verbose;
        }
        if let Some(quiet) = parse_env(env, "VALIDATE_XML_QUIET")? {
            config.output.quiet = quiet;
        }
        if let Some(format) = env.get("VALIDATE_XML_FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormatConfig::Human,
                "json" => OutputFormatConfig::Json,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid VALIDATE_XML_FORMAT value: {}",
                        format
                    )));
                }
            };
        }

        // File settings
        if let Some(extensions) = env.get("VALIDATE_XML_EXTENSIONS") {
            config.files.extensions = split_list(&extensions);
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        // Validation settings
        if cli.no_threads {
            config.validation.threads = Some(1);
        } else if cli.threads.is_some() {
            config.validation.threads = cli.threads;
        }
        if cli.check_and_resolve_pids {
            config.validation.check_pids = CheckPids::Resolve;
        } else if cli.check_pids {
            config.validation.check_pids = CheckPids::Syntax;
        }

        // Cache settings
        if let Some(cache_dir) = &cli.schema_cache_dir {
            config.cache.directory = cache_dir.clone();
        }

        // Output settings
        if let Some(format) = cli.format {
            config.output.format = format.into();
        }
        if cli.verbose || cli.quiet || cli.debug {
            config.output.verbose = cli.verbose;
            config.output.quiet = cli.quiet;
            config.output.debug = cli.debug;
        }

        // File settings
        if let Some(extensions) = cli.get_extensions() {
            config.files.extensions = extensions;
        }
        if !cli.include_patterns.is_empty() {
            config.files.include_patterns = cli.include_patterns.clone();
        }
        if !cli.exclude_patterns.is_empty() {
            config.files.exclude_patterns = cli.exclude_patterns.clone();
        }

        config
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if let Some(threads) = config.validation.threads {
            if threads == 0 {
                return Err(ConfigError::Validation(
                    "Number of threads must be greater than 0".to_string(),
                ));
            }
            if threads > MAX_THREADS {
                return Err(ConfigError::Validation(format!(
                    "Number of threads cannot exceed {}",
                    MAX_THREADS
                )));
            }
        }
        if config.validation.shadow_cache_size == 0 {
            return Err(ConfigError::Validation(
                "Shadow cache size must be greater than 0".to_string(),
            ));
        }

        let network = &config.network;
        for (name, value) in [
            ("Connect timeout", network.connect_timeout_ms),
            ("Read timeout", network.read_timeout_ms),
            ("Handle connect timeout", network.handle_connect_timeout_ms),
            ("Handle read timeout", network.handle_read_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be greater than 0", name)));
            }
        }
        if network.max_concurrent_handle_requests == 0 {
            return Err(ConfigError::Validation(
                "Concurrent handle requests must be greater than 0".to_string(),
            ));
        }
        if network.handle_cache_size == 0 {
            return Err(ConfigError::Validation(
                "Handle cache size must be greater than 0".to_string(),
            ));
        }

        if config.output.verbose && config.output.quiet {
            return Err(ConfigError::Validation(
                "Cannot enable both verbose and quiet modes".to_string(),
            ));
        }

        if config.files.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "At least one file extension must be specified".to_string(),
            ));
        }
        for ext in &config.files.extensions {
            if ext.contains('/') || ext.contains('\\') || ext.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "Invalid file extension: {}",
                    ext
                )));
            }
        }

        Ok(())
    }

    /// Get the effective thread count
    pub fn get_thread_count(config: &Config) -> usize {
        config.validation.threads.unwrap_or_else(default_thread_count)
    }

    pub fn get_shutdown_timeout(config: &Config) -> Duration {
        Duration::from_millis(config.validation.shutdown_timeout_ms)
    }

    pub fn get_verbosity(config: &Config) -> VerbosityLevel {
        if config.output.quiet {
            VerbosityLevel::Quiet
        } else if config.output.debug {
            VerbosityLevel::Debug
        } else if config.output.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    pub fn get_cache_policy(config: &Config) -> CachePolicy {
        CachePolicy {
            max_age: MaxAge::from_secs(config.cache.max_age_hours.map(|h| h.saturating_mul(3600))),
            negative_max_age: MaxAge::from_secs(Some(config.cache.negative_max_age_secs)),
        }
    }

    pub fn get_schema_loader_config(config: &Config) -> SchemaLoaderConfig {
        SchemaLoaderConfig {
            cache_directory: config.cache.directory.clone(),
            policy: Self::get_cache_policy(config),
            http: HttpClientConfig {
                connect_timeout: Duration::from_millis(config.network.connect_timeout_ms),
                read_timeout: Duration::from_millis(config.network.read_timeout_ms),
                max_redirects: config.network.max_redirects,
                ..HttpClientConfig::default()
            },
        }
    }

    pub fn get_handle_resolver_config(config: &Config) -> HandleResolverConfig {
        HandleResolverConfig {
            http: HttpClientConfig {
                connect_timeout: Duration::from_millis(config.network.handle_connect_timeout_ms),
                read_timeout: Duration::from_millis(config.network.handle_read_timeout_ms),
                max_redirects: config.network.max_redirects,
                max_concurrent_requests: Some(config.network.max_concurrent_handle_requests),
                ..HttpClientConfig::default()
            },
            cache_size: config.network.handle_cache_size,
        }
    }
}

fn parse_env<T: FromStr>(env: &impl EnvProvider, key: &str) -> Result<Option<T>> {
    match env.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value))),
        None => Ok(None),
    }
}

/// Comma separated list, leading dots and blanks removed
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_start_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Mock environment variable provider for testing
    #[derive(Default)]
    struct MockEnvProvider {
        vars: HashMap<String, String>,
    }

    impl MockEnvProvider {
        fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
            self.vars.insert(key.into(), value.into());
        }
    }

    impl EnvProvider for MockEnvProvider {
        fn get(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }
    }

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["validate-xml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.validation.threads, None);
        assert_eq!(config.validation.shutdown_timeout_ms, 5000);
        assert_eq!(config.validation.shadow_cache_size, 8);
        assert_eq!(config.validation.check_pids, CheckPids::Off);

        assert!(config.cache.directory.to_string_lossy().contains("validate-xml"));
        assert_eq!(config.cache.max_age_hours, None);
        assert_eq!(config.cache.negative_max_age_secs, 3600);

        assert_eq!(config.network.connect_timeout_ms, 60_000);
        assert_eq!(config.network.max_redirects, 4);
        assert_eq!(config.network.handle_connect_timeout_ms, 5_000);
        assert_eq!(config.network.handle_read_timeout_ms, 10_000);
        assert_eq!(config.network.max_concurrent_handle_requests, 8);
        assert_eq!(config.network.handle_cache_size, 16 * 1024);

        assert_eq!(config.output.format, OutputFormatConfig::Human);
        assert_eq!(config.files.extensions, vec!["xml"]);
        assert!(ConfigManager::validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_partial_toml_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[validation]
threads = 8
check_pids = "resolve"

[cache]
directory = "/tmp/cache"
max_age_hours = 48

[output]
format = "json"

[files]
extensions = ["xml", "cmdi"]
"#,
        )
        .unwrap();

        let config = ConfigManager::load_from_file(&config_path).unwrap();
        assert_eq!(config.validation.threads, Some(8));
        assert_eq!(config.validation.check_pids, CheckPids::Resolve);
        assert_eq!(config.validation.shutdown_timeout_ms, 5000);
        assert_eq!(config.cache.directory, PathBuf::from("/tmp/cache"));
        assert_eq!(config.cache.max_age_hours, Some(48));
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.output.format, OutputFormatConfig::Json);
        assert_eq!(config.files.extensions, vec!["xml", "cmdi"]);
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        fs::write(
            &config_path,
            r#"{"network": {"connect_timeout_ms": 1500, "max_redirects": 2}, "output": {"verbose": true}}"#,
        )
        .unwrap();

        let config = ConfigManager::load_from_file(&config_path).unwrap();
        assert_eq!(config.network.connect_timeout_ms, 1500);
        assert_eq!(config.network.max_redirects, 2);
        assert_eq!(config.network.read_timeout_ms, 60_000);
        assert!(config.output.verbose);
    }

    #[test]
    fn test_unsupported_and_invalid_files() {
        let temp_dir = TempDir::new().unwrap();

        let yaml = temp_dir.path().join("config.yaml");
        fs::write(&yaml, "threads: 4").unwrap();
        assert!(matches!(
            ConfigManager::load_from_file(&yaml),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "yaml"
        ));

        let toml = temp_dir.path().join("config.toml");
        fs::write(&toml, "[validation\nthreads = ").unwrap();
        assert!(matches!(
            ConfigManager::load_from_file(&toml),
            Err(ConfigError::TomlParsing(_))
        ));

        let json = temp_dir.path().join("config.json");
        fs::write(&json, "{ not json").unwrap();
        assert!(matches!(
            ConfigManager::load_from_file(&json),
            Err(ConfigError::JsonParsing(_))
        ));

        assert!(matches!(
            ConfigManager::load_from_file(&temp_dir.path().join("absent.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_find_config_file_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::write(second.path().join(".validate-xml.json"), r#"{"validation": {"threads": 3}}"#).unwrap();

        let dirs = [first.path().to_path_buf(), second.path().to_path_buf()];
        let found = ConfigManager::find_config_file_in(&dirs).unwrap().unwrap();
        assert_eq!(found.validation.threads, Some(3));

        fs::write(first.path().join("validate-xml.toml"), "[validation]\nthreads = 2\n").unwrap();
        let found = ConfigManager::find_config_file_in(&dirs).unwrap().unwrap();
        assert_eq!(found.validation.threads, Some(2));

        assert!(ConfigManager::find_config_file_in(&[]).unwrap().is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let mut env = MockEnvProvider::default();
        env.set("VALIDATE_XML_THREADS", "16");
        env.set("VALIDATE_XML_CACHE_DIR", "/custom/cache");
        env.set("VALIDATE_XML_NEGATIVE_MAX_AGE_SECS", "0");
        env.set("VALIDATE_XML_CHECK_PIDS", "syntax");
        env.set("VALIDATE_XML_FORMAT", "JSON");
        env.set("VALIDATE_XML_EXTENSIONS", "xml, .cmdi,");

        let config = ConfigManager::apply_environment_overrides_with(&env, Config::default()).unwrap();
        assert_eq!(config.validation.threads, Some(16));
        assert_eq!(config.cache.directory, PathBuf::from("/custom/cache"));
        assert_eq!(config.cache.negative_max_age_secs, 0);
        assert_eq!(config.validation.check_pids, CheckPids::Syntax);
        assert_eq!(config.output.format, OutputFormatConfig::Json);
        assert_eq!(config.files.extensions, vec!["xml", "cmdi"]);
    }

    #[test]
    fn test_invalid_environment_values() {
        let mut env = MockEnvProvider::default();
        env.set("VALIDATE_XML_THREADS", "many");
        let result = ConfigManager::apply_environment_overrides_with(&env, Config::default());
        assert!(matches!(result, Err(ConfigError::Environment(msg)) if msg.contains("VALIDATE_XML_THREADS")));

        let mut env = MockEnvProvider::default();
        env.set("VALIDATE_XML_CHECK_PIDS", "always");
        assert!(ConfigManager::apply_environment_overrides_with(&env, Config::default()).is_err());
    }

    #[test]
    fn test_merge_with_cli() {
        let args = cli(&[
            "-t",
            "4",
            "-e",
            "cmdi",
            "-c",
            "/tmp/schemas",
            "-P",
            "--format",
            "json",
            "-v",
            "--exclude",
            "**/old/**",
            "data",
        ]);
        let config = ConfigManager::merge_with_cli(Config::default(), &args);

        assert_eq!(config.validation.threads, Some(4));
        assert_eq!(config.validation.check_pids, CheckPids::Resolve);
        assert_eq!(config.cache.directory, PathBuf::from("/tmp/schemas"));
        assert_eq!(config.output.format, OutputFormatConfig::Json);
        assert!(config.output.verbose);
        assert_eq!(config.files.extensions, vec!["cmdi"]);
        assert_eq!(config.files.exclude_patterns, vec!["**/old/**"]);

        let single = ConfigManager::merge_with_cli(Config::default(), &cli(&["--no-threads", "-p", "data"]));
        assert_eq!(single.validation.threads, Some(1));
        assert_eq!(single.validation.check_pids, CheckPids::Syntax);
    }

    #[test]
    fn test_cli_beats_environment_beats_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("validate-xml.toml");
        fs::write(&config_path, "[validation]\nthreads = 2\n[network]\nmax_redirects = 1\n").unwrap();

        let mut env = MockEnvProvider::default();
        env.set("VALIDATE_XML_THREADS", "3");
        env.set("VALIDATE_XML_CONNECT_TIMEOUT_MS", "250");

        let path = config_path.to_string_lossy().to_string();
        let config = ConfigManager::load_config_with(&cli(&["--config", &path, "-t", "5", "data"]), &env).unwrap();
        assert_eq!(config.validation.threads, Some(5));
        assert_eq!(config.network.connect_timeout_ms, 250);
        assert_eq!(config.network.max_redirects, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.validation.threads = Some(0);
        assert!(matches!(ConfigManager::validate_config(&config), Err(ConfigError::Validation(_))));

        config.validation.threads = Some(MAX_THREADS + 1);
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.network.handle_read_timeout_ms = 0;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.output.verbose = true;
        config.output.quiet = true;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.files.extensions = vec!["x/ml".to_string()];
        assert!(ConfigManager::validate_config(&config).is_err());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.cache.max_age_hours = Some(2);
        config.network.handle_connect_timeout_ms = 1234;

        let policy = ConfigManager::get_cache_policy(&config);
        assert_eq!(policy.max_age, MaxAge::Limited(Duration::from_secs(7200)));
        assert_eq!(policy.negative_max_age, MaxAge::Limited(Duration::from_secs(3600)));

        let handles = ConfigManager::get_handle_resolver_config(&config);
        assert_eq!(handles.http.connect_timeout, Duration::from_millis(1234));
        assert_eq!(handles.http.max_concurrent_requests, Some(8));

        assert_eq!(ConfigManager::get_shutdown_timeout(&config), Duration::from_secs(5));
        assert_eq!(ConfigManager::get_verbosity(&config), VerbosityLevel::Normal);
        config.output.debug = true;
        assert_eq!(ConfigManager::get_verbosity(&config), VerbosityLevel::Debug);
    }
}
