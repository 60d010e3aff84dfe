//! File-backed capture handler
//!
//! Writes consumed buffers to a file in a target directory. Files are named
//! after the local time they were opened, so [`StreamCaptureHandler::split`]
//! can start a fresh file mid-recording. Optionally reads input from a file
//! as well, which is what a decode pipeline needs.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::buffer::BufferHeader;
use crate::error::HandlerError;
use crate::handler::{CaptureHandler, FillResult};

struct Streams {
    input: Option<BufReader<File>>,
    output: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    processed: u64,
    files_opened: usize,
}

/// Producer/sink backed by files on disk
pub struct StreamCaptureHandler {
    directory: PathBuf,
    extension: String,
    streams: Mutex<Streams>,
}

impl StreamCaptureHandler {
    /// Sink writing into `directory` with files ending in `extension`
    pub fn new(directory: impl AsRef<Path>, extension: &str) -> Result<Self, HandlerError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        let handler = Self {
            directory,
            extension: extension.trim_start_matches('.').to_string(),
            streams: Mutex::new(Streams {
                input: None,
                output: None,
                current_path: None,
                processed: 0,
                files_opened: 0,
            }),
        };
        handler.new_file()?;
        Ok(handler)
    }

    /// Producer reading `input`, and sink writing into `directory`
    pub fn transform(
        input: impl AsRef<Path>,
        directory: impl AsRef<Path>,
        extension: &str,
    ) -> Result<Self, HandlerError> {
        let handler = Self::new(directory, extension)?;
        let file = File::open(input.as_ref())?;
        handler.streams.lock().input = Some(BufReader::new(file));
        Ok(handler)
    }

    /// Close the current output file and start a new one
    pub fn split(&self) -> Result<PathBuf, HandlerError> {
        self.new_file()
    }

    /// Path of the file currently being written
    pub fn current_path(&self) -> Option<PathBuf> {
        self.streams.lock().current_path.clone()
    }

    /// Bytes written across all output files
    pub fn processed(&self) -> u64 {
        self.streams.lock().processed
    }

    /// Flush buffered output to disk
    pub fn flush(&self) -> Result<(), HandlerError> {
        if let Some(output) = self.streams.lock().output.as_mut() {
            output.flush()?;
        }
        Ok(())
    }

    fn new_file(&self) -> Result<PathBuf, HandlerError> {
        let mut streams = self.streams.lock();
        if let Some(mut output) = streams.output.take() {
            output.flush()?;
        }

        let stamp = Local::now().format("%d-%b-%y %H-%M-%S");
        let mut path = self.directory.join(format!("{}.{}", stamp, self.extension));
        // Splitting twice within a second must not overwrite the earlier file
        let mut n = 1;
        while path.exists() {
            path = self
                .directory
                .join(format!("{} ({}).{}", stamp, n, self.extension));
            n += 1;
        }

        let file = File::create(&path)?;
        tracing::info!("Opened capture file {}", path.display());
        streams.output = Some(BufWriter::new(file));
        streams.current_path = Some(path.clone());
        streams.files_opened += 1;
        Ok(path)
    }
}

impl CaptureHandler for StreamCaptureHandler {
    fn name(&self) -> &str {
        "stream-capture"
    }

    fn fill(&self, buffer: &mut [u8]) -> Result<FillResult, HandlerError> {
        let mut streams = self.streams.lock();
        let input = streams.input.as_mut().ok_or(HandlerError::NoStream("input"))?;

        let mut written = 0;
        while written < buffer.len() {
            let n = input.read(&mut buffer[written..])?;
            if n == 0 {
                return Ok(FillResult::end(written));
            }
            written += n;
        }
        Ok(FillResult::data(written))
    }

    fn consume(&self, buffer: &BufferHeader) -> Result<(), HandlerError> {
        let mut streams = self.streams.lock();
        let output = streams.output.as_mut().ok_or(HandlerError::NoStream("output"))?;
        output.write_all(buffer.data())?;
        streams.processed += buffer.length() as u64;
        Ok(())
    }
}

impl Drop for StreamCaptureHandler {
    fn drop(&mut self) {
        let streams = self.streams.get_mut();
        if let Some(output) = streams.output.as_mut() {
            if let Err(e) = output.flush() {
                tracing::warn!("Failed to flush capture file: {}", e);
            }
        }
        tracing::debug!(
            "Capture handler closed after {} bytes in {} files",
            streams.processed,
            streams.files_opened
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fill_reads_input_until_end() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input.bin");
        fs::write(&input, vec![9u8; 10]).unwrap();

        let handler = StreamCaptureHandler::transform(&input, dir.path().join("out"), "raw").unwrap();
        let mut scratch = [0u8; 4];
        assert_eq!(handler.fill(&mut scratch).unwrap(), FillResult::data(4));
        assert_eq!(handler.fill(&mut scratch).unwrap(), FillResult::data(4));
        assert_eq!(handler.fill(&mut scratch).unwrap(), FillResult::end(2));
        assert_eq!(handler.fill(&mut scratch).unwrap(), FillResult::end(0));
    }

    #[test]
    fn test_sink_without_input_cannot_fill() {
        let dir = tempdir().unwrap();
        let handler = StreamCaptureHandler::new(dir.path(), "h264").unwrap();
        let mut scratch = [0u8; 4];
        assert!(matches!(
            handler.fill(&mut scratch),
            Err(HandlerError::NoStream("input"))
        ));
    }

    #[test]
    fn test_split_opens_new_file() {
        let dir = tempdir().unwrap();
        let handler = StreamCaptureHandler::new(dir.path(), ".h264").unwrap();
        let first = handler.current_path().unwrap();
        let second = handler.split().unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
        assert_eq!(second.extension().unwrap(), "h264");
    }
}
