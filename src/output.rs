//! Report and summary formatting
//!
//! Per-file reports and the closing summary, as colored human-readable text or as
//! JSON lines.

use serde::Serialize;
use std::time::Duration;

use crate::cli::{OutputFormat, VerbosityLevel};
use crate::report::{Severity, ValidationReport};

/// Totals over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub files: usize,
    pub valid: usize,
    pub invalid: usize,
    pub warnings: usize,
    pub errors: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl Summary {
    pub fn record(&mut self, report: &ValidationReport) {
        self.files += 1;
        if report.is_success() {
            self.valid += 1;
        } else {
            self.invalid += 1;
        }
        self.warnings += report.count(Severity::Warning);
        self.errors += report.count(Severity::Error);
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 { self.files as f64 / secs } else { 0.0 }
    }

    pub fn all_valid(&self) -> bool {
        self.invalid == 0
    }
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    summary: &'a Summary,
    throughput: f64,
}

/// Output formatter
pub struct Output {
    verbosity: VerbosityLevel,
    format: OutputFormat,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel, format: OutputFormat) -> Self {
        Self {
            verbosity,
            format,
            show_colors: format == OutputFormat::Human && atty::is(atty::Stream::Stdout),
        }
    }

    pub fn with_colors(mut self, show_colors: bool) -> Self {
        self.show_colors = show_colors;
        self
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    /// The text to print for one file, if any. Failures are always shown.
    pub fn format_report(&self, report: &ValidationReport) -> Option<String> {
        if report.is_success() && self.verbosity < VerbosityLevel::Verbose {
            return None;
        }

        match self.format {
            OutputFormat::Json => serde_json::to_string(report).ok(),
            OutputFormat::Human => Some(self.format_human_report(report)),
        }
    }

    fn format_human_report(&self, report: &ValidationReport) -> String {
        let status = if !report.is_success() {
            self.colorize("✗ INVALID", "31")
        } else if report.highest_severity == Some(Severity::Warning) {
            self.colorize("⚠ VALID", "33")
        } else {
            self.colorize("✓ VALID", "32")
        };

        let mut output = format!(
            "{}  {} ({})",
            status,
            report.file().display(),
            format_duration(report.duration)
        );
        for message in &report.messages {
            if message.severity == Severity::Info && self.verbosity < VerbosityLevel::Verbose {
                continue;
            }
            output.push_str(&format!("\n    {}", message));
        }
        output
    }

    pub fn format_summary(&self, summary: &Summary) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(&JsonSummary {
                summary,
                throughput: summary.throughput(),
            })
            .unwrap_or_default(),
            OutputFormat::Human => self.format_human_summary(summary),
        }
    }

    fn format_human_summary(&self, summary: &Summary) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return format!(
                "Files: {} Invalid: {} Errors: {}",
                summary.files, summary.invalid, summary.errors
            );
        }

        let mut output = String::new();
        output.push_str("Validation Summary:\n");
        output.push_str(&format!("  Total files: {}\n", summary.files));
        output.push_str(&format!("  {} {}\n", self.colorize("Valid:", "32"), summary.valid));
        if summary.invalid > 0 {
            output.push_str(&format!("  {} {}\n", self.colorize("Invalid:", "31"), summary.invalid));
        }
        if summary.warnings > 0 {
            output.push_str(&format!("  {} {}\n", self.colorize("Warnings:", "33"), summary.warnings));
        }
        if summary.errors > 0 {
            output.push_str(&format!("  {} {}\n", self.colorize("Errors:", "31"), summary.errors));
        }
        output.push_str(&format!("  Duration: {}\n", format_duration(summary.duration)));
        output.push_str(&format!("  Throughput: {:.1} files/sec", summary.throughput()));
        output
    }
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}
