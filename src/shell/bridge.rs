//! Byte pumps between a remote channel and a local shell process.
//!
//! Each direction runs on its own blocking thread. Whichever side finishes
//! first tears the session down through [`Teardown`], which is safe to call
//! any number of times from any task.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::ChildKiller;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, ShellError};
use crate::channel::{is_end_of_stream, Channel, ChannelRequest, TerminalGeometry};

/// How often the waiter checks for process exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A started process, reduced to what the bridge needs.
pub(crate) trait ShellProcess: Send {
    /// Reap the process if it has exited. `Ok(None)` while it runs; the
    /// inner `None` means the exit code is unavailable.
    fn try_wait(&mut self) -> io::Result<Option<Option<u32>>>;
}

/// Applies window-change events to the process's terminal.
pub(crate) trait Resizer: Send + Sync {
    fn resize(&self, geometry: TerminalGeometry) -> Result<(), ShellError>;
}

/// Resizer for backends whose terminal size is fixed at open.
pub(crate) struct Unresizable;

impl Resizer for Unresizable {
    fn resize(&self, geometry: TerminalGeometry) -> Result<(), ShellError> {
        tracing::trace!(?geometry, "resize ignored by fixed-size backend");
        Ok(())
    }
}

/// Everything an opened backend hands to the bridge.
pub(crate) struct ShellIo {
    pub kind: BackendKind,
    pub input: Box<dyn Write + Send>,
    /// One or more output streams, all relayed to the channel.
    pub outputs: Vec<Box<dyn Read + Send>>,
    pub process: Box<dyn ShellProcess>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    /// Owns the terminal, if any; dropped once the session ends.
    pub resizer: Box<dyn Resizer>,
    pub buffer_size: usize,
}

/// One-shot teardown shared by the pumps and the driver.
pub(crate) struct Teardown {
    channel: Arc<dyn Channel>,
    remote_closed: AtomicBool,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl Teardown {
    pub fn new(channel: Arc<dyn Channel>, killer: Box<dyn ChildKiller + Send + Sync>) -> Self {
        Self {
            channel,
            remote_closed: AtomicBool::new(false),
            killer: Mutex::new(Some(killer)),
        }
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    pub fn close_remote(&self) {
        if !self.remote_closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("closing remote channel");
            self.channel.close();
        }
    }

    /// Kill the process (if still running) and close the remote side.
    pub fn terminate(&self) {
        if let Some(mut killer) = self.killer.lock().take() {
            if let Err(e) = killer.kill() {
                // Usually the process already exited on its own.
                tracing::debug!(error = %e, "kill after teardown failed");
            }
        }
        self.close_remote();
    }

    /// Block until the process exits and reap it.
    ///
    /// Each check runs with the killer locked and drops the killer once the
    /// process is reaped, so `terminate` never signals a recycled pid.
    pub fn reap(&self, process: &mut dyn ShellProcess) -> io::Result<Option<u32>> {
        loop {
            {
                let mut killer = self.killer.lock();
                if let Some(code) = process.try_wait()? {
                    killer.take();
                    return Ok(code);
                }
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::Acquire)
    }
}

fn log_stream_error(direction: &'static str, err: &io::Error) {
    if is_end_of_stream(err) {
        tracing::debug!(direction, error = %err, "stream ended");
    } else {
        tracing::error!(direction, error = %err, "stream failed");
    }
}

/// Remote -> process. Ends when the remote finishes, then terminates the
/// process.
fn pump_remote_to_process(teardown: &Teardown, mut input: Box<dyn Write + Send>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match teardown.channel().read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log_stream_error("remote->process", &e);
                break;
            }
        };
        if let Err(e) = input.write_all(&buf[..n]).and_then(|()| input.flush()) {
            log_stream_error("remote->process", &e);
            break;
        }
    }
    drop(input);
    teardown.terminate();
}

/// Process -> remote. A clean end of output leaves teardown to the driver;
/// a failed write to the remote tears down immediately.
fn pump_process_to_remote(teardown: &Teardown, mut output: Box<dyn Read + Send>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match output.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log_stream_error("process->remote", &e);
                if !is_end_of_stream(&e) {
                    teardown.terminate();
                }
                return;
            }
        };
        if let Err(e) = teardown.channel().write_all(&buf[..n]) {
            if !teardown.is_remote_closed() {
                log_stream_error("process->remote", &e);
            }
            teardown.terminate();
            return;
        }
    }
}

fn spawn_pump<F>(name: &'static str, pump: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(pump));
        if let Err(e) = result {
            tracing::error!(pump = name, "pump panicked: {:?}", e);
        }
    })
}

async fn await_pump(name: &'static str, handle: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(pump = name, error = %e, "pump task failed"),
        Err(_) => tracing::warn!(
            pump = name,
            timeout_ms = limit.as_millis() as u64,
            "pump still blocked after drain timeout, abandoning"
        ),
    }
}

/// Apply or discard control requests until the session is done.
async fn relay_requests(
    mut requests: mpsc::Receiver<ChannelRequest>,
    resizer: Box<dyn Resizer>,
    done: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = done.cancelled() => break,
            request = requests.recv() => match request {
                Some(r) => r,
                None => break,
            },
        };
        if request.kind != crate::channel::WINDOW_CHANGE {
            tracing::trace!(kind = %request.kind, "discarding session request");
            continue;
        }
        match request.as_window_change() {
            Some((columns, rows)) => {
                if let Err(e) = resizer.resize(TerminalGeometry::new(columns, rows)) {
                    tracing::warn!(columns, rows, error = %e, "resize failed");
                }
            }
            None => tracing::warn!(len = request.payload.len(), "malformed window-change payload"),
        }
    }
    // Releases the terminal.
    drop(resizer);
}

/// Run a session to completion.
///
/// Returns the process exit code. The remote channel is always closed when
/// this returns.
pub(crate) async fn run(
    io: ShellIo,
    channel: Arc<dyn Channel>,
    requests: mpsc::Receiver<ChannelRequest>,
    drain_timeout: Duration,
) -> Result<Option<u32>, ShellError> {
    let ShellIo {
        kind,
        input,
        outputs,
        mut process,
        killer,
        resizer,
        buffer_size,
    } = io;

    let teardown = Arc::new(Teardown::new(channel, killer));
    let done = CancellationToken::new();

    let relay = tokio::spawn(relay_requests(requests, resizer, done.clone()));

    let inbound = {
        let teardown = Arc::clone(&teardown);
        spawn_pump("remote->process", move || {
            pump_remote_to_process(&teardown, input, buffer_size)
        })
    };
    let outbound: Vec<JoinHandle<()>> = outputs
        .into_iter()
        .map(|output| {
            let teardown = Arc::clone(&teardown);
            spawn_pump("process->remote", move || {
                pump_process_to_remote(&teardown, output, buffer_size)
            })
        })
        .collect();

    let waiter = {
        let teardown = Arc::clone(&teardown);
        tokio::task::spawn_blocking(move || teardown.reap(process.as_mut()))
    };

    let status = match waiter.await {
        Ok(status) => status,
        Err(e) => Err(io::Error::other(e)),
    };
    match &status {
        Ok(code) => tracing::debug!(backend = ?kind, exit_code = ?code, "shell exited"),
        Err(e) => tracing::error!(backend = ?kind, error = %e, "waiting for shell failed"),
    }

    done.cancel();
    for handle in outbound {
        await_pump("process->remote", handle, drain_timeout).await;
    }
    teardown.close_remote();
    await_pump("remote->process", inbound, drain_timeout).await;
    if let Err(e) = relay.await {
        tracing::error!(error = %e, "request relay failed");
    }

    status.map_err(ShellError::Wait)
}
