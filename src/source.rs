use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Read-through cache of source files, used to show the line behind a report entry.
///
/// Files are read once; files that cannot be read are remembered as missing.
#[derive(Debug, Default)]
pub struct SourceLines {
    files: Mutex<HashMap<String, Option<Arc<Vec<String>>>>>,
}

impl SourceLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the content of `filename` instead of reading it from disk.
    pub fn with_source(self, filename: impl Into<String>, source: &str) -> Self {
        let lines = source.lines().map(str::to_string).collect();
        self.lock().insert(filename.into(), Some(Arc::new(lines)));
        self
    }

    /// The trimmed text of a 1-based line, if the file is readable and the line is not blank.
    pub fn line(&self, filename: &str, lineno: u32) -> Option<String> {
        let index = usize::try_from(lineno).ok()?.checked_sub(1)?;
        let lines = self.file(filename)?;
        let line = lines.get(index)?.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    fn file(&self, filename: &str) -> Option<Arc<Vec<String>>> {
        let mut files = self.lock();
        files
            .entry(filename.to_string())
            .or_insert_with(|| {
                std::fs::read_to_string(filename)
                    .ok()
                    .map(|content| Arc::new(content.lines().map(str::to_string).collect()))
            })
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Arc<Vec<String>>>>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
