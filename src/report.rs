//! Per-file validation reports

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One diagnostic; line and column are 1-based, `None` when unknown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
}

impl Message {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, line: Option<u32>, column: Option<u32>) -> Self {
        self.line = line;
        self.column = column;
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "[{}] (line={}, column={}) {}", self.severity, line, column, self.message)
            }
            (Some(line), None) => write!(f, "[{}] (line={}) {}", self.severity, line, self.message),
            _ => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Accumulated diagnostics for one file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub file: PathBuf,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_severity: Option<Severity>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl ValidationReport {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            messages: Vec::new(),
            highest_severity: None,
            duration: Duration::ZERO,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn add(&mut self, message: Message) {
        if self.highest_severity < Some(message.severity) {
            self.highest_severity = Some(message.severity);
        }
        self.messages.push(message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.add(Message::new(Severity::Info, message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.add(Message::new(Severity::Warning, message));
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.add(Message::new(Severity::Error, message));
    }

    /// A file is a failure iff it carries at least one error
    pub fn is_success(&self) -> bool {
        self.highest_severity != Some(Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages.iter().filter(|m| m.severity == severity).count()
    }
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}
