use crate::error::{Result, ValidationError};
use crate::job::FileFilter;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Selects files by extension and include/exclude glob patterns
#[derive(Debug, Clone)]
pub struct GlobFilter {
    /// File extensions to accept, lower case, without the dot
    extensions: Vec<String>,
    /// Include patterns set
    include_set: Option<GlobSet>,
    /// Exclude patterns set
    exclude_set: Option<GlobSet>,
}

impl GlobFilter {
    pub fn new() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_set: None,
            exclude_set: None,
        }
    }

    /// Set file extensions to accept; an empty list accepts every extension
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Only accept paths matching at least one of `patterns`
    pub fn with_include_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.include_set = build_set(patterns, "include")?;
        Ok(self)
    }

    /// Reject paths matching any of `patterns`
    pub fn with_exclude_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.exclude_set = build_set(patterns, "exclude")?;
        Ok(self)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Check if a file should be processed based on extensions and patterns
    pub fn should_process(&self, path: &Path) -> bool {
        if !self.extensions.is_empty() {
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                return false;
            };
            if !self.extensions.contains(&extension.to_lowercase()) {
                return false;
            }
        }

        // Exclusion wins over inclusion
        if let Some(exclude_set) = &self.exclude_set
            && exclude_set.is_match(path)
        {
            return false;
        }

        if let Some(include_set) = &self.include_set {
            return include_set.is_match(path);
        }

        true
    }
}

impl Default for GlobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileFilter for GlobFilter {
    fn accept(&self, path: &Path) -> bool {
        self.should_process(path)
    }
}

fn build_set(patterns: &[String], kind: &str) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| ValidationError::Config(format!("Invalid glob pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| ValidationError::Config(format!("Failed to build {} glob set: {}", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FileProcessor, JobHandler, ValidationJob};
    use crate::report::ValidationReport;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn create_test_directory() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("subdir1")).unwrap();
        fs::create_dir_all(root.join("subdir2/nested")).unwrap();

        fs::write(root.join("file1.xml"), "<?xml version=\"1.0\"?>").unwrap();
        fs::write(root.join("file2.XML"), "<?xml version=\"1.0\"?>").unwrap();
        fs::write(root.join("file3.txt"), "text file").unwrap();
        fs::write(root.join("subdir1/nested.xml"), "<?xml version=\"1.0\"?>").unwrap();
        fs::write(root.join("subdir2/nested/deep.xml"), "<?xml version=\"1.0\"?>").unwrap();
        fs::write(root.join("subdir2/nested/other.cmdi"), "<CMD/>").unwrap();

        temp_dir
    }

    #[derive(Default)]
    struct Collect {
        files: Mutex<Vec<String>>,
    }

    impl JobHandler for Collect {
        fn on_validation_success(&self, report: &ValidationReport) {
            let name = report.file().file_name().unwrap().to_string_lossy().to_string();
            self.files.lock().unwrap().push(name);
        }

        fn on_validation_failure(&self, _report: &ValidationReport) {}

        fn on_job_finished(&self, _canceled: bool) {}
    }

    struct Pass;

    impl FileProcessor for Pass {
        fn process(&self, file: &Path) -> Result<ValidationReport> {
            Ok(ValidationReport::new(file))
        }
    }

    /// Drive a job by hand and return the accepted file names in walk order
    fn walk(root: &Path, filter: GlobFilter) -> Vec<String> {
        let handler = Arc::new(Collect::default());
        let job = ValidationJob::new(root, Some(Arc::new(filter)), handler.clone(), Arc::new(Pass)).unwrap();
        while let Some(file) = job.get_file_for_processing() {
            handler.on_validation_success(&ValidationReport::new(file));
            job.return_file_from_processing();
        }
        let files = handler.files.lock().unwrap().clone();
        files
    }

    #[test]
    fn test_default_accepts_xml_case_insensitively() {
        let temp_dir = create_test_directory();
        let files = walk(temp_dir.path(), GlobFilter::new());
        assert_eq!(files, ["file1.xml", "file2.XML", "nested.xml", "deep.xml"]);
    }

    #[test]
    fn test_multiple_extensions() {
        let temp_dir = create_test_directory();
        let filter = GlobFilter::new().with_extensions(vec!["xml".to_string(), ".cmdi".to_string()]);
        assert_eq!(walk(temp_dir.path(), filter).len(), 5);
    }

    #[test]
    fn test_include_patterns() {
        let temp_dir = create_test_directory();
        let filter = GlobFilter::new()
            .with_include_patterns(&["**/nested*".to_string()])
            .unwrap();
        // deep.xml lives under nested/ but literal_separator keeps `*` inside one component
        assert_eq!(walk(temp_dir.path(), filter), ["nested.xml"]);
    }

    #[test]
    fn test_exclude_patterns() {
        let temp_dir = create_test_directory();
        let filter = GlobFilter::new()
            .with_exclude_patterns(&["**/subdir2/**".to_string()])
            .unwrap();
        let files = walk(temp_dir.path(), filter);
        assert_eq!(files.len(), 3);
        assert!(!files.contains(&"deep.xml".to_string()));
    }

    #[test]
    fn test_should_process() {
        let filter = GlobFilter::new();
        assert!(filter.should_process(Path::new("test.xml")));
        assert!(!filter.should_process(Path::new("test.txt")));
        assert!(!filter.should_process(Path::new("test")));

        let any = GlobFilter::new().with_extensions(Vec::new());
        assert!(any.should_process(Path::new("test")));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = GlobFilter::new().with_include_patterns(&["[unclosed".to_string()]);
        assert!(matches!(result, Err(ValidationError::Config(_))));
    }
}
