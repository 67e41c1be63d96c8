// packages/engine/src/output/mod.rs
//! Trial output sinks
//!
//! An `Output` is a file-backed column sink written with a header-then-rows
//! protocol: the first line is the comma-joined column header, each
//! subsequent line one comma-joined row of `Value` encodings per step. The
//! file is created lazily on the first row so an experiment that never
//! steps leaves nothing behind. Writes are serialized by the sink's own
//! mutex; callers never coordinate.

use crate::attrs::Value;
use crate::utils::errors::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct OutputState {
    writer: Option<BufWriter<File>>,
    /// Rows pushed since the last flush; the removal gate checks this.
    pending: u64,
    rows: u64,
}

/// A file-backed column sink for one trial.
#[derive(Debug)]
pub struct Output {
    header: Vec<String>,
    path: PathBuf,
    state: Mutex<OutputState>,
}

impl Output {
    pub fn new(header: Vec<String>, path: PathBuf) -> Self {
        Self {
            header,
            path,
            state: Mutex::new(OutputState {
                writer: None,
                pending: 0,
                rows: 0,
            }),
        }
    }

    /// Append one row. The row must be co-ordered with the header; the
    /// file and its header line are created on the first call.
    pub fn push_row(&self, values: &[Value]) -> Result<()> {
        debug_assert_eq!(values.len(), self.header.len());

        let mut state = self.state.lock().expect("output state poisoned");
        if state.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut writer = BufWriter::new(File::create(&self.path)?);
            writeln!(writer, "{}", self.header.join(","))?;
            debug!(path = %self.path.display(), "output sink opened");
            state.writer = Some(writer);
        }

        let row = values
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let writer = state.writer.as_mut().expect("writer installed above");
        writeln!(writer, "{}", row)?;
        state.pending += 1;
        state.rows += 1;
        Ok(())
    }

    /// Push every pending byte down to the file.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().expect("output state poisoned");
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        state.pending = 0;
        Ok(())
    }

    /// True when no rows are waiting to be flushed. Removal from an
    /// experiment requires this.
    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("output state poisoned").pending == 0
    }

    /// Total rows written since creation, header excluded.
    pub fn rows(&self) -> u64 {
        self.state.lock().expect("output state poisoned").rows
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.path == other.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proj_e1_t0");
        let output = Output::new(vec!["step".into(), "meanAge".into()], path.clone());

        output
            .push_row(&[Value::ULong(0), Value::Double(0.0)])
            .unwrap();
        output
            .push_row(&[Value::ULong(1), Value::Double(1.0)])
            .unwrap();
        output.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["step,meanAge", "0,0", "1,1"]);
    }

    #[test]
    fn test_no_file_until_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proj_e1_t0");
        let output = Output::new(vec!["step".into()], path.clone());
        assert!(!path.exists());
        output.push_row(&[Value::ULong(0)]).unwrap();
        output.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_empty_gate() {
        let dir = tempfile::tempdir().unwrap();
        let output = Output::new(vec!["step".into()], dir.path().join("o"));
        assert!(output.is_empty());
        output.push_row(&[Value::ULong(0)]).unwrap();
        assert!(!output.is_empty());
        output.flush().unwrap();
        assert!(output.is_empty());
        assert_eq!(output.rows(), 1);
    }

    #[test]
    fn test_value_equality() {
        let a = Output::new(vec!["step".into()], PathBuf::from("/tmp/x"));
        let b = Output::new(vec!["step".into()], PathBuf::from("/tmp/x"));
        let c = Output::new(vec!["step".into()], PathBuf::from("/tmp/y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
