//! PTY (pseudo-terminal) plumbing.
//!
//! Wraps a portable-pty master/child pair behind one shareable handle so a
//! reader thread, a writer, and a supervisor can operate on the same PTY
//! without coordinating ownership.

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("failed to clone PTY reader: {0}")]
    CloneReader(String),
    #[error("failed to take PTY writer: {0}")]
    Writer(String),
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Shared PTY handle.
///
/// Reader and writer sit behind separate locks so input writes are never
/// blocked by an in-progress blocking read. Blocking [`Pty::read`] calls
/// belong on a dedicated thread; everything else is cheap.
pub struct Pty {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Pty {
    /// Open a PTY of the given size and spawn `cmd` on its slave side.
    pub fn spawn(cmd: CommandBuilder, size: PtySize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::CloneReader(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Writer(e.to_string()))?;

        Ok(Self {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    /// Blocking read from the PTY master.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().unwrap();
        reader.read(buf)
    }

    /// Write raw bytes to the PTY.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data)
    }

    /// Write one shell line (appends a newline) and flush.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Flush the PTY writer.
    pub fn flush(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush()
    }

    /// Resize the PTY.
    pub fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        let master = self.master.lock().unwrap();
        master
            .resize(size)
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Poll the child without blocking. `Ok(None)` means still running.
    pub fn try_wait(&self) -> Result<Option<portable_pty::ExitStatus>, PtyError> {
        let mut child = self.child.lock().unwrap();
        child
            .try_wait()
            .map_err(|e| PtyError::Io(io::Error::other(e.to_string())))
    }

    /// Kill the child process.
    pub fn kill(&self) -> Result<(), PtyError> {
        let mut child = self.child.lock().unwrap();
        child
            .kill()
            .map_err(|e| PtyError::Io(io::Error::other(e.to_string())))
    }

    /// Rewrap the writer so tests can make writes fail mid-call while the
    /// shell itself keeps running.
    #[cfg(test)]
    pub(crate) fn wrap_writer(
        &self,
        wrap: impl FnOnce(Box<dyn Write + Send>) -> Box<dyn Write + Send>,
    ) {
        let mut writer = self.writer.lock().unwrap();
        let inner = std::mem::replace(&mut *writer, Box::new(io::sink()));
        *writer = wrap(inner);
    }
}

/// Size of the controlling terminal, 80x24 when there is none.
pub fn terminal_size() -> PtySize {
    if let Some((cols, rows)) = term_size::dimensions() {
        PtySize {
            rows: rows as u16,
            cols: cols as u16,
            pixel_width: 0,
            pixel_height: 0,
        }
    } else {
        PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}
