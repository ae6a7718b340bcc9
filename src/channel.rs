//! The per-session byte stream and control requests handed over by the
//! transport layer.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use portable_pty::PtySize;

/// Request type carrying the initial terminal geometry.
pub const PTY_REQUEST: &str = "pty-req";
/// Request type carrying a terminal resize.
pub const WINDOW_CHANGE: &str = "window-change";

/// A bidirectional byte stream carrying one interactive session.
///
/// All methods take `&self` so both pump directions can share one channel.
/// `close` must be idempotent and must wake any reader blocked in `read`.
pub trait Channel: Send + Sync {
    /// Blocking read. `Ok(0)` means the remote side finished.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn close(&self);

    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A typed control request with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: String,
    pub payload: Bytes,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Build a `window-change` request the way SSH packs it: columns, rows,
    /// pixel width, pixel height, all big-endian u32.
    pub fn window_change(columns: u32, rows: u32) -> Self {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&columns.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        Self::new(WINDOW_CHANGE, payload)
    }

    /// `(columns, rows)` if this is a well-formed `window-change`.
    pub fn as_window_change(&self) -> Option<(u32, u32)> {
        if self.kind != WINDOW_CHANGE {
            return None;
        }
        parse_dims(&self.payload)
    }
}

/// Read the two leading big-endian u32 fields of a payload.
pub fn parse_dims(payload: &[u8]) -> Option<(u32, u32)> {
    Some((read_u32(payload, 0)?, read_u32(payload, 4)?))
}

fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes: [u8; 4] = payload.get(offset..end)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Negotiated terminal size of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub columns: u32,
    pub rows: u32,
}

impl TerminalGeometry {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    /// Decode an SSH `pty-req` payload: string TERM, u32 columns, u32 rows,
    /// u32 pixel width, u32 pixel height, string modes. Only the TERM string
    /// and the two character dimensions are required.
    pub fn from_pty_request(payload: &[u8]) -> Option<Self> {
        let term_len = read_u32(payload, 0)? as usize;
        let offset = 4usize.checked_add(term_len)?;
        let columns = read_u32(payload, offset)?;
        let rows = read_u32(payload, offset.checked_add(4)?)?;
        Some(Self { columns, rows })
    }

    pub fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: clamp_u16(self.rows),
            cols: clamp_u16(self.columns),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

fn clamp_u16(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

/// Whether an I/O error is the ordinary end of a stream rather than a fault.
///
/// On Unix a pty master reports `EIO` once the slave side has closed.
pub fn is_end_of_stream(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    false
}

#[derive(Default)]
struct MemoryState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    input_finished: bool,
    closed: bool,
}

/// In-process [`Channel`] whose remote side is driven by method calls.
///
/// Used to embed a session without a network transport and in tests.
#[derive(Default)]
pub struct MemoryChannel {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the remote side had sent them.
    pub fn push_input(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.inbound.extend(data.iter().copied());
        self.changed.notify_all();
    }

    /// Remote side sends EOF once queued input has been read.
    pub fn finish_input(&self) {
        let mut state = self.state.lock();
        state.input_finished = true;
        self.changed.notify_all();
    }

    /// Everything written to the remote side so far.
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().outbound.clone()
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the output contains `needle`. Returns whether it did.
    pub fn wait_for_output(&self, needle: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            String::from_utf8_lossy(&state.outbound).contains(needle)
        })
    }

    /// Wait until the channel has been closed. Returns whether it was.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.closed)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&MemoryState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !done(&state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state);
            }
        }
        true
    }
}

impl Channel for MemoryChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Ok(0);
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.input_finished {
                return Ok(0);
            }
            self.changed.wait(&mut state);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.outbound.extend_from_slice(buf);
        self.changed.notify_all();
        Ok(buf.len())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }
}
