//! Shell on plain pipes, used when no pseudo-terminal can be opened.

use std::io::{self, Read};
use std::process::{Command, Stdio};

use portable_pty::ChildKiller;

use super::bridge::{ShellIo, ShellProcess, Unresizable};
use super::{BackendKind, ShellError};
use crate::config::ShellConfig;

pub(crate) const RAW_BUFFER_SIZE: usize = 128;

/// Start the configured raw shell with piped stdin and stderr merged into
/// the output stream.
pub(crate) fn open(config: &ShellConfig) -> Result<ShellIo, ShellError> {
    let (program, args) = config.raw_command();
    let mut cmd = Command::new(&program);
    cmd.args(&args).stdin(Stdio::piped());
    // Own process group, so teardown reaches every command the shell started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg_attr(unix, allow(unused_mut))]
    let mut outputs = attach_output(&mut cmd).map_err(ShellError::Stream)?;
    let mut child = cmd
        .spawn()
        .map_err(|e| ShellError::Spawn(anyhow::anyhow!("{program}: {e}")))?;
    // Release our copies of the write ends so the output reaches EOF on exit.
    drop(cmd);

    let input = child
        .stdin
        .take()
        .ok_or_else(|| ShellError::Stream(io::Error::other("child stdin was not captured")))?;
    #[cfg(not(unix))]
    {
        if let Some(stdout) = child.stdout.take() {
            outputs.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            outputs.push(Box::new(stderr));
        }
    }

    let pid = child.id();
    tracing::info!(backend = ?BackendKind::Raw, pid, program = %program, "shell started on pipes");

    Ok(ShellIo {
        kind: BackendKind::Raw,
        input: Box::new(input),
        outputs,
        process: Box::new(RawChild(child)),
        killer: Box::new(PidKiller { pid }),
        resizer: Box::new(Unresizable),
        buffer_size: RAW_BUFFER_SIZE,
    })
}

/// Point stdout and stderr at one pipe and return its read end.
#[cfg(unix)]
fn attach_output(cmd: &mut Command) -> io::Result<Vec<Box<dyn Read + Send>>> {
    let (reader, writer) = io::pipe()?;
    cmd.stdout(Stdio::from(writer.try_clone()?))
        .stderr(Stdio::from(writer));
    Ok(vec![Box::new(reader)])
}

#[cfg(not(unix))]
fn attach_output(cmd: &mut Command) -> io::Result<Vec<Box<dyn Read + Send>>> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(Vec::new())
}

struct RawChild(std::process::Child);

impl ShellProcess for RawChild {
    fn try_wait(&mut self) -> io::Result<Option<Option<u32>>> {
        Ok(self.0.try_wait()?.map(|status| status.code().map(|c| c as u32)))
    }
}

/// Kills a raw child's process group by pid, since the child itself is
/// owned by the waiter.
#[derive(Debug, Clone, Copy)]
struct PidKiller {
    pid: u32,
}

impl ChildKiller for PidKiller {
    #[cfg(unix)]
    fn kill(&mut self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.pid)
            .ok()
            .filter(|&pid| pid > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain signal delivery to the group led by the child.
        if unsafe { libc::kill(-pid, libc::SIGKILL) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &self.pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }

    fn clone_killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        Box::new(*self)
    }
}
