//! Worker → supervisor exit report.
//!
//! Before it terminates, a worker tells the supervisor how many
//! replacement workers to spawn. The count travels in a fixed-size frame
//! over a pipe shared by every worker, so it is independent of the OS exit
//! code (which keeps its conventional 0 = success meaning).
//!
//! # Frame layout (little endian, 12 bytes)
//!
//! ```text
//! 0      2   3   4        8             12
//! +------+---+---+--------+-------------+
//! | 'PF' |ver|rsv|  pid   | replacements|
//! +------+---+---+--------+-------------+
//! ```
//!
//! Frames are far below `PIPE_BUF`, so concurrent writes from different
//! workers never interleave.

use crate::error::ProtocolError;

/// Frame magic ("PF").
pub const REPORT_MAGIC: u16 = 0x5046;

/// Current frame version.
pub const REPORT_VERSION: u8 = 1;

/// Encoded frame length in bytes.
pub const REPORT_FRAME_LEN: usize = 12;

/// Why a worker is leaving the pool.
///
/// Carried only for logging on the worker side; the supervisor acts on
/// the replacement count alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Shutdown requested by the supervisor
    Shutdown,
    /// Served its connection quota and wants a fresh process
    Recycle,
    /// Unrecoverable error in the accept loop
    Failure,
}

impl ExitCause {
    /// Replacements a worker asks for when leaving for this reason.
    #[inline]
    pub const fn replacements(self) -> u32 {
        match self {
            ExitCause::Shutdown => 0,
            ExitCause::Recycle | ExitCause::Failure => 1,
        }
    }

    /// Conventional process exit code for this reason.
    #[inline]
    pub const fn exit_code(self) -> i32 {
        match self {
            ExitCause::Shutdown | ExitCause::Recycle => 0,
            ExitCause::Failure => 1,
        }
    }
}

/// A decoded exit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Reporting worker's process id
    pub pid: i32,
    /// Number of workers the supervisor should spawn in its place
    pub replacements: u32,
}

impl ExitReport {
    pub const fn new(pid: i32, replacements: u32) -> Self {
        Self { pid, replacements }
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> [u8; REPORT_FRAME_LEN] {
        let mut frame = [0u8; REPORT_FRAME_LEN];
        frame[0..2].copy_from_slice(&REPORT_MAGIC.to_le_bytes());
        frame[2] = REPORT_VERSION;
        frame[4..8].copy_from_slice(&self.pid.to_le_bytes());
        frame[8..12].copy_from_slice(&self.replacements.to_le_bytes());
        frame
    }

    /// Decode one frame from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REPORT_FRAME_LEN {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        if magic != REPORT_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        if buf[2] != REPORT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(buf[2]));
        }
        let pid = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let replacements = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self { pid, replacements })
    }
}

/// Reassembles frames from a byte stream that may split them.
#[derive(Debug, Default)]
pub struct ReportDecoder {
    pending: Vec<u8>,
}

impl ReportDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every complete frame they finish.
    ///
    /// A frame that fails to decode is skipped and returned as an error in
    /// its slot; the stream resynchronizes on the next frame boundary.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ExitReport, ProtocolError>> {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() / REPORT_FRAME_LEN * REPORT_FRAME_LEN;
        let out = self.pending[..whole]
            .chunks_exact(REPORT_FRAME_LEN)
            .map(ExitReport::decode)
            .collect();
        self.pending.drain(..whole);
        out
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
