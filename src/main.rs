use std::process::ExitCode;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use validate_xml::{
    CheckHandles, CheckPids, Cli, ConfigManager, Engine, FileFilter, FileProcessor, GlobFilter,
    GrammarPool, JobHandler, Output, SchemaLoader, SchemaValidator, Summary, ValidationJob,
    ValidationReport, Validator, VerbosityLevel,
};

/// Prints reports as they arrive and tracks the jobs still running
struct RunHandler {
    output: Output,
    summary: Mutex<Summary>,
    pending_jobs: Mutex<usize>,
    all_finished: Condvar,
}

impl RunHandler {
    fn new(output: Output) -> Self {
        Self {
            output,
            summary: Mutex::new(Summary::default()),
            pending_jobs: Mutex::new(0),
            all_finished: Condvar::new(),
        }
    }

    fn expect_job(&self) {
        *self.pending_jobs.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn wait_for_jobs(&self) {
        let mut pending = self.pending_jobs.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending > 0 {
            pending = self
                .all_finished
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn report(&self, report: &ValidationReport) {
        let mut summary = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        summary.record(report);
        if let Some(text) = self.output.format_report(report) {
            println!("{}", text);
        }
    }
}

impl JobHandler for RunHandler {
    fn on_validation_success(&self, report: &ValidationReport) {
        self.report(report);
    }

    fn on_validation_failure(&self, report: &ValidationReport) {
        self.report(report);
    }

    fn on_job_finished(&self, canceled: bool) {
        debug!("job finished (canceled: {})", canceled);
        let mut pending = self.pending_jobs.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.all_finished.notify_all();
        }
    }
}

fn init_logging(verbosity: VerbosityLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(verbosity.default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Validate every path; `Ok(true)` when all files are valid
fn run(cli: &Cli) -> Result<bool> {
    cli.validate().map_err(anyhow::Error::msg)?;
    let config = ConfigManager::load_config(cli).context("Failed to load configuration")?;
    let verbosity = ConfigManager::get_verbosity(&config);
    init_logging(verbosity);

    let loader = Arc::new(SchemaLoader::new(ConfigManager::get_schema_loader_config(&config))?);
    let pool = GrammarPool::with_shadow_capacity(config.validation.shadow_cache_size);
    let mut validator = Validator::new(SchemaValidator::with_pool(Arc::clone(&loader), pool)?);

    let resolver = match config.validation.check_pids {
        CheckPids::Off => None,
        CheckPids::Syntax => {
            validator = validator.with_extension(CheckHandles::syntax_only());
            None
        }
        CheckPids::Resolve => {
            let check = CheckHandles::resolving(ConfigManager::get_handle_resolver_config(&config))?;
            let resolver = check.resolver();
            validator = validator.with_extension(check);
            resolver
        }
    };

    let processor: Arc<dyn FileProcessor> = Arc::new(validator);
    let filter: Arc<dyn FileFilter> = Arc::new(
        GlobFilter::new()
            .with_extensions(config.files.extensions.clone())
            .with_include_patterns(&config.files.include_patterns)?
            .with_exclude_patterns(&config.files.exclude_patterns)?,
    );
    let handler = Arc::new(RunHandler::new(Output::new(verbosity, config.output.format.into())));

    let threads = ConfigManager::get_thread_count(&config);
    let engine = Engine::new();
    engine.start(threads)?;
    info!("validating with {} worker threads", threads);

    let started = Instant::now();
    for path in &cli.paths {
        let job = ValidationJob::new(
            path,
            Some(Arc::clone(&filter)),
            handler.clone(),
            Arc::clone(&processor),
        )?;
        handler.expect_job();
        engine.submit(Arc::new(job))?;
    }
    handler.wait_for_jobs();
    engine.shutdown(ConfigManager::get_shutdown_timeout(&config));

    let mut summary = handler.summary.lock().unwrap_or_else(PoisonError::into_inner).clone();
    summary.duration = started.elapsed();
    println!("{}", handler.output.format_summary(&summary));

    debug!("schema cache statistics: {:?}", loader.stats());
    if let Some(resolver) = resolver {
        let stats = resolver.statistics();
        debug!(
            "handle resolver: total requests {}, running requests {}, cache hits {}, cache misses {}, cache size {}, timeouts {}, unknown hosts {}, errors {}",
            stats.total_requests,
            stats.current_requests,
            stats.cache_hits,
            stats.cache_misses,
            stats.cache_size,
            stats.timeouts,
            stats.unknown_hosts,
            stats.errors
        );
    }

    Ok(summary.all_valid())
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
