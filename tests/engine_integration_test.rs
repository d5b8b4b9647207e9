//! Scheduling behaviour of the engine across jobs

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use validate_xml::error::Result;
use validate_xml::{Engine, FileProcessor, ValidationJob, ValidationReport};

use common::{RecordingHandler, create_files};

/// Blocks every call until the gate is opened
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
    entered: AtomicUsize,
    entered_changed: Condvar,
    entered_lock: Mutex<()>,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        {
            let _guard = self.entered_lock.lock().unwrap();
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.entered_changed.notify_all();
        }
        let open = self.open.lock().unwrap();
        let _open = self.changed.wait_while(open, |open| !*open).unwrap();
    }

    fn wait_entered(&self, count: usize) {
        let guard = self.entered_lock.lock().unwrap();
        let (_guard, timeout) = self
            .entered_changed
            .wait_timeout_while(guard, Duration::from_secs(30), |_| {
                self.entered.load(Ordering::SeqCst) < count
            })
            .unwrap();
        assert!(!timeout.timed_out(), "workers never reached the gate");
    }
}

struct GatedProcessor {
    gate: Arc<Gate>,
}

impl FileProcessor for GatedProcessor {
    fn process(&self, file: &Path) -> Result<ValidationReport> {
        self.gate.pass();
        Ok(ValidationReport::new(file))
    }
}

/// Holds back only the first file until released, then counts processed files
struct FirstFileGated {
    gate: Arc<Gate>,
    processed: AtomicUsize,
}

impl FileProcessor for FirstFileGated {
    fn process(&self, file: &Path) -> Result<ValidationReport> {
        if self.processed.load(Ordering::SeqCst) == 0 {
            self.gate.pass();
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationReport::new(file))
    }
}

/// Records how far the other job had progressed whenever it runs
struct Observer {
    other: Arc<FirstFileGated>,
    seen: Mutex<Vec<usize>>,
}

impl FileProcessor for Observer {
    fn process(&self, file: &Path) -> Result<ValidationReport> {
        self.seen
            .lock()
            .unwrap()
            .push(self.other.processed.load(Ordering::SeqCst));
        Ok(ValidationReport::new(file))
    }
}

#[test]
fn test_small_job_is_not_starved_by_large_job() {
    let temp_dir = TempDir::new().unwrap();
    create_files(&temp_dir.path().join("large"), 1000, "<a/>");
    create_files(&temp_dir.path().join("small"), 2, "<b/>");

    let engine = Engine::new();
    engine.start(1).unwrap();

    let gate = Arc::new(Gate::default());
    let large = Arc::new(FirstFileGated {
        gate: gate.clone(),
        processed: AtomicUsize::new(0),
    });
    let large_handler = Arc::new(RecordingHandler::default());
    let large_job = ValidationJob::new(
        temp_dir.path().join("large"),
        None,
        large_handler.clone(),
        large.clone(),
    )
    .unwrap();
    engine.submit(Arc::new(large_job)).unwrap();
    gate.wait_entered(1);

    let observer = Arc::new(Observer {
        other: large.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let small_handler = Arc::new(RecordingHandler::default());
    let small_job = ValidationJob::new(
        temp_dir.path().join("small"),
        None,
        small_handler.clone(),
        observer.clone(),
    )
    .unwrap();
    engine.submit(Arc::new(small_job)).unwrap();
    gate.open();

    assert!(!small_handler.wait_finished());
    assert!(!large_handler.wait_finished());

    let seen = observer.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    // Round-robin: the small job gets every other file
    assert!(seen.iter().all(|&n| n < 10), "small job waited for {:?} large files", seen);
    assert_eq!(small_handler.reports().len(), 2);
    assert_eq!(large_handler.reports().len(), 1000);

    engine.shutdown(Duration::from_secs(5));
}

#[test]
fn test_cancel_delivers_only_in_flight_files() {
    const WORKERS: usize = 3;

    let temp_dir = TempDir::new().unwrap();
    create_files(temp_dir.path(), 20, "<a/>");

    let engine = Engine::new();
    engine.start(WORKERS).unwrap();

    let gate = Arc::new(Gate::default());
    let handler = Arc::new(RecordingHandler::default());
    let job = Arc::new(
        ValidationJob::new(
            temp_dir.path(),
            None,
            handler.clone(),
            Arc::new(GatedProcessor { gate: gate.clone() }),
        )
        .unwrap(),
    );
    engine.submit(job.clone()).unwrap();

    gate.wait_entered(WORKERS);
    assert_eq!(job.in_flight(), WORKERS);
    job.cancel(false).unwrap();
    assert!(handler.finished().is_empty());
    gate.open();

    assert!(handler.wait_finished());
    assert_eq!(handler.reports().len(), WORKERS);
    assert_eq!(handler.finished(), vec![true]);
    assert!(job.is_finished());

    engine.shutdown(Duration::from_secs(5));
}

#[test]
fn test_many_jobs_share_the_workers() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::new();
    engine.start(4).unwrap();

    struct Pass;
    impl FileProcessor for Pass {
        fn process(&self, file: &Path) -> Result<ValidationReport> {
            Ok(ValidationReport::new(file))
        }
    }
    let processor: Arc<dyn FileProcessor> = Arc::new(Pass);

    let handlers: Vec<Arc<RecordingHandler>> = (0..8)
        .map(|i| {
            let root = temp_dir.path().join(format!("job{}", i));
            create_files(&root, i * 5, "<a/>");
            let handler = Arc::new(RecordingHandler::default());
            let job = ValidationJob::new(root, None, handler.clone(), processor.clone()).unwrap();
            engine.submit(Arc::new(job)).unwrap();
            handler
        })
        .collect();

    for (i, handler) in handlers.iter().enumerate() {
        assert!(!handler.wait_finished());
        assert_eq!(handler.reports().len(), i * 5);
        assert_eq!(handler.finished().len(), 1);
    }

    engine.shutdown(Duration::from_secs(5));
}
