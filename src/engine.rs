//! Worker pool that interleaves files from many jobs
//!
//! Every worker repeatedly takes the job under the rotation cursor, asks it for one
//! file, validates that file and hands it back. The cursor moves to the next job after
//! each pick, so a small job submitted behind a large one is not starved.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{InitializationError, Result, ValidationError};
use crate::job::{ValidationJob, panic_message};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker count used when none is configured
pub fn default_thread_count() -> usize {
    num_cpus::get().max(1)
}

struct JobList {
    jobs: Vec<Arc<ValidationJob>>,
    cursor: usize,
}

impl JobList {
    fn remove(&mut self, job: &Arc<ValidationJob>) {
        if let Some(index) = self.jobs.iter().position(|j| Arc::ptr_eq(j, job)) {
            self.jobs.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.cursor >= self.jobs.len() {
            self.cursor = 0;
        }
    }
}

struct Shared {
    list: Mutex<JobList>,
    work_available: Condvar,
    shutdown: AtomicBool,
    live_workers: Mutex<usize>,
    worker_exited: Condvar,
}

impl Shared {
    fn lock_list(&self) -> MutexGuard<'_, JobList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_live(&self) -> MutexGuard<'_, usize> {
        self.live_workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next job in rotation; `None` once shutdown is requested
    fn next_job(&self) -> Option<Arc<ValidationJob>> {
        let mut list = self.lock_list();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if !list.jobs.is_empty() {
                if list.cursor >= list.jobs.len() {
                    list.cursor = 0;
                }
                let index = list.cursor;
                list.cursor = (index + 1) % list.jobs.len();
                return Some(list.jobs[index].clone());
            }
            list = self
                .work_available
                .wait(list)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn remove_job(&self, job: &Arc<ValidationJob>) {
        self.lock_list().remove(job);
    }

    fn request_shutdown(&self) {
        let _list = self.lock_list();
        self.shutdown.store(true, Ordering::Release);
        self.work_available.notify_all();
    }
}

/// Decrements the live-worker count when a worker leaves its loop, panicking or not
struct LiveGuard<'a> {
    shared: &'a Shared,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        let mut live = self.shared.lock_live();
        *live -= 1;
        drop(live);
        self.shared.worker_exited.notify_all();
    }
}

fn worker_loop(shared: &Shared) {
    let _live = LiveGuard { shared };

    while let Some(job) = shared.next_job() {
        let file = match panic::catch_unwind(AssertUnwindSafe(|| job.get_file_for_processing())) {
            Ok(Some(file)) => file,
            Ok(None) => {
                shared.remove_job(&job);
                continue;
            }
            Err(payload) => {
                error!(
                    "dropping job for {}: panic while fetching next file: {}",
                    job.root().display(),
                    panic_message(payload.as_ref())
                );
                shared.remove_job(&job);
                continue;
            }
        };

        debug!("validating {}", file.display());
        let delivered = job.process_file(&file);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.return_file_from_processing())) {
            error!(
                "dropping job for {}: panic while returning {}: {}",
                job.root().display(),
                file.display(),
                panic_message(payload.as_ref())
            );
            shared.remove_job(&job);
        } else if !delivered {
            shared.remove_job(&job);
        }
    }
}

struct Running {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed pool of validation workers consuming a dynamic set of jobs
pub struct Engine {
    running: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    /// Spawn `thread_count` workers
    pub fn start(&self, thread_count: usize) -> std::result::Result<(), InitializationError> {
        if thread_count == 0 {
            return Err(InitializationError::InvalidThreadCount(thread_count));
        }

        let mut running = self.lock_running();
        if running.is_some() {
            return Err(InitializationError::EngineAlreadyStarted);
        }

        let shared = Arc::new(Shared {
            list: Mutex::new(JobList {
                jobs: Vec::new(),
                cursor: 0,
            }),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            live_workers: Mutex::new(0),
            worker_exited: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for id in 0..thread_count {
            let worker_shared = Arc::clone(&shared);
            *shared.lock_live() += 1;
            let spawned = thread::Builder::new()
                .name(format!("worker-{:02x}", id))
                .spawn(move || worker_loop(&worker_shared));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    *shared.lock_live() -= 1;
                    shared.request_shutdown();
                    return Err(InitializationError::WorkerSpawn(e));
                }
            }
        }

        info!("validation engine started with {} worker(s)", thread_count);
        *running = Some(Running { shared, workers });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Add a job to the rotation. Fires the job's `on_job_started`.
    pub fn submit(&self, job: Arc<ValidationJob>) -> Result<()> {
        let running = self.lock_running();
        let Some(state) = running.as_ref() else {
            return Err(ValidationError::EngineNotRunning);
        };
        job.on_submitted()?;

        debug!("submitted job for {}", job.root().display());
        let mut list = state.shared.lock_list();
        list.jobs.push(job);
        drop(list);
        state.shared.work_available.notify_all();
        Ok(())
    }

    /// Jobs still in the rotation
    pub fn active_jobs(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map_or(0, |state| state.shared.lock_list().jobs.len())
    }

    /// Stop the workers, waiting up to `timeout` for them to exit.
    ///
    /// Jobs still in the rotation are abandoned without a finished callback. Workers
    /// busy past the deadline are detached.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(Running { shared, workers }) = self.lock_running().take() else {
            return;
        };

        debug!("shutting down validation engine");
        shared.request_shutdown();

        let deadline = Instant::now() + timeout;
        let mut live = shared.lock_live();
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            live = shared
                .worker_exited
                .wait_timeout(live, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        // Every worker has left its loop; the threads only have to unwind
        let all_exited = *live == 0;
        drop(live);

        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if all_exited || handle.is_finished() {
                if handle.join().is_err() {
                    error!("{} terminated with a panic", name);
                }
            } else {
                warn!("{} did not stop within {:?}, detaching", name, timeout);
            }
        }

        let mut list = shared.lock_list();
        if !list.jobs.is_empty() {
            warn!("abandoning {} unfinished job(s)", list.jobs.len());
            list.jobs.clear();
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}
