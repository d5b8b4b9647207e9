#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use validate_xml::{JobHandler, ValidationReport};

pub const NOTE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
    <xs:element name="note">
        <xs:complexType>
            <xs:sequence>
                <xs:element name="to" type="xs:string"/>
                <xs:element name="body" type="xs:string"/>
            </xs:sequence>
        </xs:complexType>
    </xs:element>
</xs:schema>"#;

/// A note document pointing at `schema_location`
pub fn note_xml(schema_location: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<note xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
      xsi:noNamespaceSchemaLocation="{}">
    <to>Tove</to>
    {}
</note>"#,
        schema_location, body
    )
}

/// `count` files named `file0000.xml`... under `dir`
pub fn create_files(dir: &Path, count: usize, content: &str) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let path = dir.join(format!("file{:04}.xml", i));
            fs::write(&path, content).unwrap();
            path
        })
        .collect()
}

#[derive(Default)]
struct Recorded {
    reports: Vec<ValidationReport>,
    finished: Vec<bool>,
}

/// Keeps every report and finish notification of one job
#[derive(Default)]
pub struct RecordingHandler {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingHandler {
    pub fn reports(&self) -> Vec<ValidationReport> {
        self.recorded.lock().unwrap().reports.clone()
    }

    pub fn finished(&self) -> Vec<bool> {
        self.recorded.lock().unwrap().finished.clone()
    }

    /// Block until the job finished, returning its canceled flag
    pub fn wait_finished(&self) -> bool {
        let recorded = self.recorded.lock().unwrap();
        let (recorded, timeout) = self
            .changed
            .wait_timeout_while(recorded, Duration::from_secs(30), |r| r.finished.is_empty())
            .unwrap();
        assert!(!timeout.timed_out(), "job did not finish");
        recorded.finished[0]
    }

    fn push(&self, report: &ValidationReport) {
        self.recorded.lock().unwrap().reports.push(report.clone());
        self.changed.notify_all();
    }
}

impl JobHandler for RecordingHandler {
    fn on_validation_success(&self, report: &ValidationReport) {
        self.push(report);
    }

    fn on_validation_failure(&self, report: &ValidationReport) {
        self.push(report);
    }

    fn on_job_finished(&self, canceled: bool) {
        self.recorded.lock().unwrap().finished.push(canceled);
        self.changed.notify_all();
    }
}
