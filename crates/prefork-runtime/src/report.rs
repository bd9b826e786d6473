//! Exit-report channel
//!
//! A single pipe shared by every worker. Workers write one frame right
//! before they exit; the supervisor drains the read end after each reap,
//! so a report is always in the pipe before its sender is reaped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;

use prefork_core::{ExitReport, ProcessId, ReportDecoder, REPORT_FRAME_LEN};

use crate::error::ReportError;

/// Create the channel. Both ends are close-on-exec.
pub fn channel() -> Result<(ReportReceiver, ReportSender), ReportError> {
    let (read_end, write_end) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| ReportError::Pipe(e.into()))?;

    let flags = fcntl(read_end.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| ReportError::Pipe(e.into()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(|e| ReportError::Pipe(e.into()))?;

    Ok((ReportReceiver::new(read_end), ReportSender::new(write_end)))
}

/// Worker side.
#[derive(Debug)]
pub struct ReportSender {
    file: File,
}

impl ReportSender {
    fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }

    /// Adopt the write end handed to a re-executed worker.
    ///
    /// # Safety
    ///
    /// `fd` must be open and owned by nobody else in this process.
    pub unsafe fn from_inherited_fd(fd: RawFd) -> Result<Self, ReportError> {
        if fcntl(fd, FcntlArg::F_GETFD).is_err() {
            return Err(ReportError::InvalidFd(fd));
        }
        let owned = OwnedFd::from_raw_fd(fd);
        fcntl(owned.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|_| ReportError::InvalidFd(fd))?;
        Ok(Self::new(owned))
    }

    /// Write one frame. Frames are smaller than `PIPE_BUF`, so the write is
    /// atomic with respect to other workers.
    pub fn send(&self, report: &ExitReport) -> Result<(), ReportError> {
        (&self.file).write_all(&report.encode()).map_err(ReportError::Send)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Supervisor side. Non-blocking.
#[derive(Debug)]
pub struct ReportReceiver {
    file: File,
    decoder: ReportDecoder,
    pending: HashMap<ProcessId, u32>,
}

impl ReportReceiver {
    fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            decoder: ReportDecoder::new(),
            pending: HashMap::new(),
        }
    }

    /// Read everything currently in the pipe. Returns the number of frames
    /// decoded.
    pub fn drain(&mut self) -> Result<usize, ReportError> {
        let mut buf = [0u8; REPORT_FRAME_LEN * 64];
        let mut frames = 0;
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for frame in self.decoder.feed(&buf[..n]) {
                        match frame {
                            Ok(report) => {
                                frames += 1;
                                self.pending.insert(report.pid, report.replacements);
                            }
                            Err(e) => tracing::warn!(error = %e, "Discarding malformed exit report"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReportError::Receive(e)),
            }
        }
        Ok(frames)
    }

    /// Replacement count reported by `pid`, if any.
    pub fn take(&mut self, pid: ProcessId) -> Result<Option<u32>, ReportError> {
        self.drain()?;
        Ok(self.pending.remove(&pid))
    }
}
