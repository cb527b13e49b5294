//! Log forwarding from the host process to the bridge.
//!
//! The child writes framed records (`level: i32`, `size: i32`, UTF-8
//! payload) into a pipe; the bridge drains them without blocking and
//! re-emits them with `tracing`.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Target under which forwarded records are emitted
pub const LOG_TARGET: &str = "plugin-host";

const RECORD_HEADER_SIZE: usize = 8;

/// Create a pipe with both ends closed on exec.
///
/// Returns `(read_end, write_end)`.
#[allow(unsafe_code)]
pub fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for two descriptors
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() returned two fresh descriptors
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read, &write] {
        // SAFETY: fd is valid
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

pub fn level_code(level: Level) -> i32 {
    match level {
        Level::ERROR => 0,
        Level::WARN => 1,
        Level::INFO => 2,
        Level::DEBUG => 3,
        Level::TRACE => 4,
    }
}

/// A record received from the pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: i32,
    pub message: String,
}

impl LogRecord {
    /// Re-emit the record. Quiet records are demoted to debug level.
    pub fn emit(&self, loud: bool) {
        let msg = self.message.as_str();
        if !loud {
            tracing::debug!(target: LOG_TARGET, "{}", msg);
            return;
        }
        match self.level {
            0 => tracing::error!(target: LOG_TARGET, "{}", msg),
            1 => tracing::warn!(target: LOG_TARGET, "{}", msg),
            2 => tracing::info!(target: LOG_TARGET, "{}", msg),
            3 => tracing::debug!(target: LOG_TARGET, "{}", msg),
            _ => tracing::trace!(target: LOG_TARGET, "{}", msg),
        }
    }
}

/// Read end of the log pipe
pub struct LogReader {
    file: Option<File>,
}

impl LogReader {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Read the next record if one is available without blocking.
    ///
    /// The pipe is closed on end-of-file, hang-up or error.
    #[allow(unsafe_code)]
    pub fn poll_record(&mut self) -> Option<LogRecord> {
        let file = self.file.as_mut()?;

        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!("Couldn't poll log pipe: {}", err);
                self.close();
            }
            return None;
        }
        if ret == 0 {
            return None;
        }

        if pfd.revents & libc::POLLIN != 0 {
            match read_record(file) {
                Ok(record) => return Some(record),
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        tracing::error!("Couldn't read log pipe: {}", e);
                    }
                }
            }
        }
        // hang-up, error or end of file
        self.close();
        None
    }

    /// Emit every record that is available right now
    pub fn read_available(&mut self, loud: bool) {
        while let Some(record) = self.poll_record() {
            record.emit(loud);
        }
    }
}

fn read_record(file: &mut File) -> io::Result<LogRecord> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header)?;
    let level = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    let size = i32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
    let size = usize::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative record size"))?;
    let mut payload = vec![0u8; size];
    file.read_exact(&mut payload)?;
    Ok(LogRecord {
        level,
        message: String::from_utf8_lossy(&payload).into_owned(),
    })
}

/// Write end of the log pipe, usable as a `tracing_subscriber` writer
#[derive(Clone)]
pub struct LogPipe {
    file: Arc<Mutex<File>>,
}

impl LogPipe {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Arc::new(Mutex::new(File::from(fd))),
        }
    }

    /// Writer for one record at the given level
    pub fn writer(&self, level: Level) -> RecordWriter<'_> {
        RecordWriter {
            pipe: self,
            level: level_code(level),
            buf: Vec::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogPipe {
    type Writer = RecordWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        self.writer(*meta.level())
    }
}

/// Collects one formatted event and sends it as a single record on drop
pub struct RecordWriter<'a> {
    pipe: &'a LogPipe,
    level: i32,
    buf: Vec<u8>,
}

impl Write for RecordWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordWriter<'_> {
    fn drop(&mut self) {
        while self.buf.last().is_some_and(|&b| b == b'\n') {
            self.buf.pop();
        }
        if self.buf.is_empty() {
            return;
        }
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + self.buf.len());
        record.extend_from_slice(&self.level.to_ne_bytes());
        record.extend_from_slice(&(self.buf.len() as i32).to_ne_bytes());
        record.extend_from_slice(&self.buf);
        // nowhere left to report a failure
        let _ = self.pipe.file.lock().write_all(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_cross_the_pipe() {
        let (read, write) = create_pipe().unwrap();
        let mut reader = LogReader::new(read);
        let pipe = LogPipe::new(write);

        assert_eq!(reader.poll_record(), None);
        assert!(reader.is_open());

        writeln!(pipe.writer(Level::WARN), "plugin {} loaded", "Gain").unwrap();
        write!(pipe.make_writer(), "second").unwrap();

        assert_eq!(
            reader.poll_record(),
            Some(LogRecord {
                level: 1,
                message: "plugin Gain loaded".to_string()
            })
        );
        assert_eq!(reader.poll_record().unwrap().level, 2);
        assert_eq!(reader.poll_record(), None);
        assert!(reader.is_open());

        drop(pipe);
        assert_eq!(reader.poll_record(), None);
        assert!(!reader.is_open());
    }

    #[test]
    fn test_empty_records_are_skipped() {
        let (read, write) = create_pipe().unwrap();
        let mut reader = LogReader::new(read);
        let pipe = LogPipe::new(write);

        drop(pipe.writer(Level::ERROR));
        writeln!(pipe.writer(Level::ERROR)).unwrap();
        assert_eq!(reader.poll_record(), None);
    }

    #[test]
    fn test_level_codes() {
        assert_eq!(level_code(Level::ERROR), 0);
        assert_eq!(level_code(Level::TRACE), 4);
    }
}
