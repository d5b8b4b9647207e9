//! Validation jobs
//!
//! A [`ValidationJob`] is one submitted unit of work: a root (directory or single file),
//! an optional [`FileFilter`], the [`JobHandler`] that receives its results and the
//! [`FileProcessor`] that validates each file. Files are enumerated lazily, one at a
//! time, as engine workers ask for them.
//!
//! Life cycle: `Active -> Draining -> Finished`. A job leaves `Active` when its
//! enumerator runs dry or it is canceled, and becomes `Finished` once no file is in
//! flight. The transition to `Finished` is decided under the job lock, so
//! [`JobHandler::on_job_finished`] fires exactly once.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::{InitializationError, Result, ValidationError};
use crate::report::ValidationReport;

/// Predicate deciding which regular files a job validates
pub trait FileFilter: Send + Sync {
    fn accept(&self, path: &Path) -> bool;
}

impl<F> FileFilter for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn accept(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Receiver of a job's results. Called from worker threads.
pub trait JobHandler: Send + Sync {
    fn on_job_started(&self) {}

    fn on_validation_success(&self, report: &ValidationReport);

    fn on_validation_failure(&self, report: &ValidationReport);

    fn on_job_finished(&self, canceled: bool);
}

/// Validates one file
pub trait FileProcessor: Send + Sync {
    fn process(&self, file: &Path) -> Result<ValidationReport>;
}

/// Depth-first walk over a root with an explicit stack of sorted directory listings
struct FileEnumerator {
    root: Option<PathBuf>,
    filter: Option<Arc<dyn FileFilter>>,
    stack: Vec<Frame>,
}

struct Frame {
    entries: Vec<PathBuf>,
    cursor: usize,
}

impl FileEnumerator {
    fn new(root: PathBuf, filter: Option<Arc<dyn FileFilter>>) -> Self {
        Self {
            root: Some(root),
            filter,
            stack: Vec::new(),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter.accept(path))
    }

    fn push_directory(&mut self, directory: &Path) {
        let listing = match fs::read_dir(directory) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("skipping unreadable directory {}: {}", directory.display(), e);
                return;
            }
        };

        let mut entries: Vec<PathBuf> = listing
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("error while listing {}: {}", directory.display(), e);
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        self.stack.push(Frame { entries, cursor: 0 });
    }

    fn next_file(&mut self) -> Option<PathBuf> {
        if let Some(root) = self.root.take() {
            if root.is_dir() {
                self.push_directory(&root);
            } else if root.is_file() && self.accepts(&root) {
                return Some(root);
            } else {
                return None;
            }
        }

        loop {
            let frame = self.stack.last_mut()?;
            let Some(path) = frame.entries.get(frame.cursor).cloned() else {
                self.stack.pop();
                continue;
            };
            frame.cursor += 1;

            let file_type = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata.file_type(),
                Err(e) => {
                    warn!("cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };

            if file_type.is_dir() {
                self.push_directory(&path);
            } else if file_type.is_symlink() {
                // linked files are validated, linked directories are not descended
                if path.is_file() && self.accepts(&path) {
                    return Some(path);
                }
            } else if file_type.is_file() && self.accepts(&path) {
                return Some(path);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Draining,
    Finished,
}

struct JobState {
    phase: Phase,
    enumerator: Option<FileEnumerator>,
    in_flight: usize,
    canceled: bool,
    finish_notified: bool,
}

impl JobState {
    /// Move to `Finished` if nothing more can happen; returns the `canceled` flag to
    /// report when this call made the transition
    fn try_finish(&mut self) -> Option<bool> {
        if self.phase == Phase::Draining && self.in_flight == 0 {
            self.phase = Phase::Finished;
            return Some(self.canceled);
        }
        None
    }
}

pub struct ValidationJob {
    root: PathBuf,
    handler: Arc<dyn JobHandler>,
    processor: Arc<dyn FileProcessor>,
    state: Mutex<JobState>,
    finished: Condvar,
    submitted: AtomicBool,
}

impl ValidationJob {
    /// Create a job over `root`, which must exist
    pub fn new(
        root: impl Into<PathBuf>,
        filter: Option<Arc<dyn FileFilter>>,
        handler: Arc<dyn JobHandler>,
        processor: Arc<dyn FileProcessor>,
    ) -> Result<Self> {
        let root = root.into();
        if let Err(e) = fs::metadata(&root) {
            return Err(InitializationError::InvalidRoot {
                path: root,
                reason: e.to_string(),
            }
            .into());
        }

        Ok(Self {
            state: Mutex::new(JobState {
                phase: Phase::Active,
                enumerator: Some(FileEnumerator::new(root.clone(), filter)),
                in_flight: 0,
                canceled: false,
                finish_notified: false,
            }),
            root,
            handler,
            processor,
            finished: Condvar::new(),
            submitted: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_canceled(&self) -> bool {
        self.lock_state().canceled
    }

    pub fn is_finished(&self) -> bool {
        self.lock_state().phase == Phase::Finished
    }

    /// Number of files handed out and not yet returned
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    /// Next file to validate, or `None` once the job is exhausted or canceled
    pub fn get_file_for_processing(&self) -> Option<PathBuf> {
        let mut state = self.lock_state();
        if state.phase != Phase::Active {
            return None;
        }

        if let Some(file) = state.enumerator.as_mut().and_then(FileEnumerator::next_file) {
            state.in_flight += 1;
            return Some(file);
        }

        debug!("no more files in {}", self.root.display());
        state.enumerator = None;
        state.phase = Phase::Draining;
        let finish = state.try_finish();
        drop(state);

        if let Some(canceled) = finish {
            self.signal_finished(canceled);
        }
        None
    }

    /// Hand back a file obtained from [`get_file_for_processing`](Self::get_file_for_processing)
    pub fn return_file_from_processing(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.in_flight > 0, "returned more files than handed out");
        state.in_flight = state.in_flight.saturating_sub(1);
        let finish = state.try_finish();
        drop(state);

        if let Some(canceled) = finish {
            self.signal_finished(canceled);
        }
    }

    /// Stop handing out files. Files already in flight still report their results.
    ///
    /// With `wait`, blocks until `on_job_finished` has returned. Canceling a finished
    /// job does nothing; canceling twice is an error.
    pub fn cancel(&self, wait: bool) -> Result<()> {
        let mut state = self.lock_state();
        if state.canceled {
            return Err(ValidationError::JobAlreadyCanceled {
                root: self.root.clone(),
            });
        }
        if state.phase == Phase::Finished {
            return Ok(());
        }

        debug!("canceling job for {}", self.root.display());
        self.stop_dispatch(state);

        if wait {
            let mut state = self.lock_state();
            while !state.finish_notified {
                state = self
                    .finished
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        Ok(())
    }

    /// Run the processor on `file` and deliver the report to the handler.
    ///
    /// Errors and panics become a failure report for that file. Returns `false` when
    /// the handler panicked; the job then stops dispatching and finishes as canceled
    /// once its in-flight files are returned.
    pub(crate) fn process_file(&self, file: &Path) -> bool {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(file)));

        let mut report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                let mut report = ValidationReport::new(file);
                report.error(e.to_string());
                report
            }
            Err(payload) => {
                let mut report = ValidationReport::new(file);
                report.error(format!("validation aborted: {}", panic_message(payload.as_ref())));
                report
            }
        };
        report.duration = started.elapsed();

        let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
            if report.is_success() {
                self.handler.on_validation_success(&report);
            } else {
                self.handler.on_validation_failure(&report);
            }
        }));

        if let Err(payload) = delivered {
            error!(
                "aborting job for {}: handler panicked on {}: {}",
                self.root.display(),
                file.display(),
                panic_message(payload.as_ref())
            );
            self.abort();
            return false;
        }
        true
    }

    /// Stop dispatching after a handler failure. Unlike [`cancel`](Self::cancel) this
    /// may follow a user cancel.
    fn abort(&self) {
        let state = self.lock_state();
        if state.phase == Phase::Finished {
            return;
        }
        self.stop_dispatch(state);
    }

    fn stop_dispatch(&self, mut state: MutexGuard<'_, JobState>) {
        state.canceled = true;
        state.enumerator = None;
        state.phase = Phase::Draining;
        let finish = state.try_finish();
        drop(state);

        if let Some(canceled) = finish {
            self.signal_finished(canceled);
        }
    }

    pub(crate) fn on_submitted(&self) -> Result<()> {
        if self.submitted.swap(true, Ordering::AcqRel) {
            return Err(ValidationError::JobAlreadySubmitted {
                root: self.root.clone(),
            });
        }
        self.handler.on_job_started();
        Ok(())
    }

    fn signal_finished(&self, canceled: bool) {
        debug!(
            "job for {} finished{}",
            self.root.display(),
            if canceled { " (canceled)" } else { "" }
        );
        if panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_job_finished(canceled))).is_err() {
            warn!("finish handler for {} panicked", self.root.display());
        }

        let mut state = self.lock_state();
        state.finish_notified = true;
        drop(state);
        self.finished.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ValidationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationJob").field("root", &self.root).finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
