//! Result sink: the collaborator that persists finished results and attachment bodies

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use stepwise_common::{Result, TestResult};

/// Receives finished results and attachment bodies.
///
/// Implementations own serialization and storage. Calls may arrive from any
/// thread; the sink is responsible for its own synchronization.
pub trait ResultSink: Send + Sync {
    /// Accept a finished scenario result
    fn report_result(&self, result: TestResult) -> Result<()>;

    /// Store an in-memory attachment body under `file_name`
    fn attach_data(&self, body: &[u8], file_name: &str) -> Result<()>;

    /// Store the contents of `source` under `file_name`
    fn attach_file(&self, source: &Path, file_name: &str) -> Result<()>;
}

pub type SharedSink = Arc<dyn ResultSink>;

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<TestResult>>,
    data: Mutex<HashMap<String, Vec<u8>>>,
    files: Mutex<HashMap<String, PathBuf>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().clone()
    }

    /// Body stored for an in-memory attachment
    pub fn data(&self, file_name: &str) -> Option<Vec<u8>> {
        self.data.lock().get(file_name).cloned()
    }

    /// Source path recorded for a file attachment
    pub fn file(&self, file_name: &str) -> Option<PathBuf> {
        self.files.lock().get(file_name).cloned()
    }

    pub fn attachment_count(&self) -> usize {
        self.data.lock().len() + self.files.lock().len()
    }
}

impl ResultSink for MemorySink {
    fn report_result(&self, result: TestResult) -> Result<()> {
        self.results.lock().push(result);
        Ok(())
    }

    fn attach_data(&self, body: &[u8], file_name: &str) -> Result<()> {
        self.data.lock().insert(file_name.to_string(), body.to_vec());
        Ok(())
    }

    fn attach_file(&self, source: &Path, file_name: &str) -> Result<()> {
        self.files
            .lock()
            .insert(file_name.to_string(), source.to_path_buf());
        Ok(())
    }
}
