use std::io;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::bridge::{Resizer, ShellIo, ShellProcess};
use super::{BackendKind, ShellError};
use crate::channel::TerminalGeometry;
use crate::config::ShellConfig;

pub(crate) const PTY_BUFFER_SIZE: usize = 4096;

/// Open a pseudo-terminal at `geometry` and start the configured shell in it.
///
/// `Native` terminals follow window-change events; `Legacy` ones keep their
/// initial size for the whole session.
pub(crate) fn open(
    kind: BackendKind,
    geometry: TerminalGeometry,
    config: &ShellConfig,
) -> Result<ShellIo, ShellError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(geometry.to_pty_size())
        .map_err(ShellError::OpenPty)?;

    // Take both ends before spawning so a failure here leaves no orphan.
    let reader = pair.master.try_clone_reader().map_err(ShellError::CloneReader)?;
    let writer = pair.master.take_writer().map_err(ShellError::TakeWriter)?;

    let (program, args) = config.pty_command();
    let mut cmd = CommandBuilder::new(&program);
    cmd.args(&args);
    cmd.env("TERM", config.term());

    let child = pair.slave.spawn_command(cmd).map_err(ShellError::Spawn)?;
    // Our copy of the slave would keep the master readable after the shell exits.
    drop(pair.slave);

    tracing::info!(
        backend = ?kind,
        pid = ?child.process_id(),
        program = %program,
        columns = geometry.columns,
        rows = geometry.rows,
        "shell started on pseudo-terminal"
    );

    let killer = child.clone_killer();
    let resizer: Box<dyn Resizer> = match kind {
        BackendKind::Native => Box::new(Console {
            master: Mutex::new(pair.master),
        }),
        _ => Box::new(FixedConsole {
            _master: Mutex::new(pair.master),
            size: geometry,
        }),
    };

    Ok(ShellIo {
        kind,
        input: writer,
        outputs: vec![reader],
        process: Box::new(PtyChild(child)),
        killer,
        resizer,
        buffer_size: PTY_BUFFER_SIZE,
    })
}

struct PtyChild(Box<dyn Child + Send + Sync>);

impl ShellProcess for PtyChild {
    fn try_wait(&mut self) -> io::Result<Option<Option<u32>>> {
        Ok(self.0.try_wait()?.map(|status| Some(status.exit_code())))
    }
}

/// Resizable console.
struct Console {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl Resizer for Console {
    fn resize(&self, geometry: TerminalGeometry) -> Result<(), ShellError> {
        let size: PtySize = geometry.to_pty_size();
        self.master.lock().resize(size).map_err(ShellError::Resize)?;
        tracing::debug!(columns = geometry.columns, rows = geometry.rows, "console resized");
        Ok(())
    }
}

/// Console pinned to its opening size.
struct FixedConsole {
    _master: Mutex<Box<dyn MasterPty + Send>>,
    size: TerminalGeometry,
}

impl Resizer for FixedConsole {
    fn resize(&self, geometry: TerminalGeometry) -> Result<(), ShellError> {
        tracing::debug!(
            requested = ?geometry,
            current = ?self.size,
            "legacy console does not resize"
        );
        Ok(())
    }
}
