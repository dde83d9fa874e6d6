//! Crash-safe file replacement.
//!
//! Content goes to a uniquely named temporary sibling, is fsynced, then
//! renamed over the final path. A reader sees either the old file or the
//! complete new one; an interrupted write leaves only a `.tmp` sibling.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Error, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Extension of in-flight temporary files.
pub const TEMP_EXTENSION: &str = "tmp";

/// Replaces `path` with `bytes` atomically.
///
/// # Errors
/// Propagates I/O failures; the previous file (if any) is left intact.
pub fn write_atomically(path: impl AsRef<Path>, bytes: &[u8]) -> IoResult<()> {
    let mut writer = AtomicFileWriter::new(path.as_ref().to_path_buf())?;
    writer.write_all(bytes)?;
    writer.finalize()
}

/// Write-to-temp-then-rename writer for one file.
///
/// Dropping the writer without [`AtomicFileWriter::finalize`] removes the
/// temporary file and leaves the final path untouched.
#[derive(Debug)]
pub struct AtomicFileWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFileWriter {
    /// Opens a temporary sibling of `final_path`.
    ///
    /// # Errors
    /// Fails if the temporary file cannot be created.
    pub fn new(final_path: PathBuf) -> IoResult<Self> {
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = final_path.with_file_name(format!("{file_name}.{}.{TEMP_EXTENSION}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Appends bytes to the temporary file.
    ///
    /// # Errors
    /// Propagates write failures.
    pub fn write_all(&mut self, bytes: &[u8]) -> IoResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Other, "writer already consumed"))?;
        writer.write_all(bytes)
    }

    /// Flush, fsync, rename. After this returns the file is durable.
    ///
    /// # Errors
    /// Propagates flush, sync and rename failures.
    pub fn finalize(mut self) -> IoResult<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Other, "writer already consumed"))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Other, "temp_path already consumed"))?;
        if let Err(e) = fs::rename(&temp_path, &self.final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}
