//! Child processes attached to a pseudo-terminal.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,
    #[error("openpty: {0}")]
    Openpty(#[source] nix::Error),
    #[error("pty setup: {0}")]
    Setup(#[source] io::Error),
    #[error("exec {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A running command and the controlling side of its terminal.
#[derive(Debug)]
pub struct PtyProcess {
    child: Child,
    pid: Pid,
    master: PtyMaster,
}

/// Controlling side of a pty. Cheap to clone; the descriptor closes when the
/// last clone is dropped.
#[derive(Debug, Clone)]
pub struct PtyMaster {
    fd: Arc<AsyncFd<std::fs::File>>,
}

/// Start `command` on a new pty. Must be called inside a tokio runtime.
pub fn spawn(command: &[String]) -> Result<PtyProcess, SpawnError> {
    let (program, args) = command.split_first().ok_or(SpawnError::EmptyCommand)?;

    let pair = openpty(None, None).map_err(SpawnError::Openpty)?;
    let master = PtyMaster::new(pair.master).map_err(SpawnError::Setup)?;
    let slave = pair.slave;

    let stdin = slave.try_clone().map_err(SpawnError::Setup)?;
    let stdout = slave.try_clone().map_err(SpawnError::Setup)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave))
        .kill_on_drop(false);
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| SpawnError::Exec {
        program: program.clone(),
        source,
    })?;
    // The slave descriptors went to the child; drop the parent's copies with
    // `cmd` so the master sees EOF once the child's side closes.
    drop(cmd);

    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| SpawnError::Setup(io::Error::other("child exited before pid was read")))?;
    debug!(%pid, ?command, "Spawned pty child");

    Ok(PtyProcess { child, pid, master })
}

impl PtyProcess {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Split into the exit observer and a handle for signalling.
    pub fn into_parts(self) -> (ExitWaiter, ProcessHandle, PtyMaster) {
        (
            ExitWaiter { child: self.child },
            ProcessHandle { pid: self.pid },
            self.master,
        )
    }
}

/// Owns the child for reaping.
#[derive(Debug)]
pub struct ExitWaiter {
    child: Child,
}

impl ExitWaiter {
    pub async fn wait(mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessHandle {
    pid: Pid,
}

impl ProcessHandle {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Send signal number `signum` to the child.
    pub fn signal(&self, signum: i32) -> nix::Result<()> {
        let signal = Signal::try_from(signum)?;
        kill(self.pid, signal)
    }
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(Self {
            fd: Arc::new(AsyncFd::new(std::fs::File::from(fd))?),
        })
    }

    /// Read whatever the terminal has. Linux reports EIO once the child side
    /// is gone; callers treat any error as end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &std::fs::File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &std::fs::File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads one winsize from a valid pointer.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn size(&self) -> io::Result<(u16, u16)> {
        let mut winsize = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes one winsize through a valid pointer.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCGWINSZ, &mut winsize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn read_to_end(master: &PtyMaster) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), master.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return out,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Err(_) => panic!("pty read timed out"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_output_reaches_master() {
        let process = spawn(&argv(&["/bin/echo", "hi"])).unwrap();
        assert!(process.pid() > 0);
        let (waiter, _handle, master) = process.into_parts();

        let out = read_to_end(&master).await;
        assert_eq!(String::from_utf8_lossy(&out).trim_end(), "hi");
        assert!(waiter.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_input_is_echoed_back() {
        let process = spawn(&argv(&["/bin/cat"])).unwrap();
        let (waiter, handle, master) = process.into_parts();

        master.write_all(b"ping\n").await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&seen).contains("ping\r\nping") {
            let n = tokio::time::timeout(Duration::from_secs(5), master.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            seen.extend_from_slice(&buf[..n]);
        }

        handle.signal(libc::SIGHUP).unwrap();
        assert!(!waiter.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_resize_applies() {
        let process = spawn(&argv(&["/bin/sleep", "30"])).unwrap();
        let (waiter, handle, master) = process.into_parts();
        master.resize(40, 120).unwrap();
        assert_eq!(master.size().unwrap(), (40, 120));

        handle.signal(libc::SIGTERM).unwrap();
        waiter.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failures() {
        assert!(matches!(spawn(&[]), Err(SpawnError::EmptyCommand)));
        assert!(matches!(
            spawn(&argv(&["/nonexistent/definitely-not-here"])),
            Err(SpawnError::Exec { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_signal_number() {
        let process = spawn(&argv(&["/bin/sleep", "30"])).unwrap();
        let (waiter, handle, _master) = process.into_parts();
        assert!(handle.signal(9999).is_err());
        handle.signal(libc::SIGKILL).unwrap();
        waiter.wait().await.unwrap();
    }
}
