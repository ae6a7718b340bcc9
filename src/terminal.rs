use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::channel::{Channel, TerminalGeometry};

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current size of the controlling terminal.
pub fn terminal_size() -> Result<TerminalGeometry, TerminalError> {
    let (cols, rows) = size().map_err(TerminalError::Size)?;
    Ok(TerminalGeometry::new(u32::from(cols), u32::from(rows)))
}

/// The process's own stdin/stdout as a session channel.
///
/// A read already blocked on stdin cannot be interrupted; after `close` it
/// returns end-of-stream on its next call.
#[derive(Debug, Default)]
pub struct StdioChannel {
    closed: AtomicBool,
}

impl StdioChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for StdioChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let n = io::stdin().lock().read(buf)?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut out = io::stdout().lock();
        let n = out.write(buf)?;
        out.flush()?;
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
