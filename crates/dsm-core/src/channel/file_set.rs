//! Read a list of files as one channel.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use tracing::{debug, info};

use super::{IoChannel, DEFAULT_BUFFER_SIZE};

/// Reads each file of a set in turn.
///
/// The first read from every file reports [`IoChannel::is_new_input`], so a
/// reader resets its framing and re-reads the stream preamble at each file
/// boundary. End of file is reported after the last file.
pub struct FileSetChannel {
    name: String,
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, File)>,
    new_input: bool,
    buffer_size: usize,
}

impl FileSetChannel {
    /// Channel over `paths`, opened lazily in order.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let pending: VecDeque<PathBuf> = paths.into_iter().map(Into::into).collect();
        let name = match pending.front() {
            Some(first) if pending.len() == 1 => first.display().to_string(),
            Some(first) => format!("{} (+{} more)", first.display(), pending.len() - 1),
            None => "empty file set".to_string(),
        };
        Self {
            name,
            pending,
            current: None,
            new_input: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set the preferred transfer size.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Path of the file currently being read.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current.as_ref().map(|(p, _)| p)
    }

    /// Files not yet opened.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl IoChannel for FileSetChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.new_input = false;
        let mut opened = false;
        loop {
            if self.current.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    return Ok(0);
                };
                let file = File::open(&path)?;
                info!(path = %path.display(), "opened input file");
                self.current = Some((path, file));
                opened = true;
            }
            let Some((path, file)) = self.current.as_mut() else {
                continue;
            };
            let n = file.read(buf)?;
            if n > 0 {
                self.new_input = opened;
                return Ok(n);
            }
            debug!(path = %path.display(), "end of input file");
            self.current = None;
        }
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file set channels are read-only",
        ))
    }

    fn close(&mut self) -> io::Result<()> {
        self.current = None;
        self.pending.clear();
        Ok(())
    }

    fn is_new_input(&self) -> bool {
        self.new_input
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}
