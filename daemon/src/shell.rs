//! Interactive shell and command execution inside the stub namespace.

use anyhow::{Context as _, Result};
use nix::pty::{OpenptyResult, openpty};
use nix::unistd::{ForkResult, dup2_stderr, dup2_stdin, dup2_stdout, execvp, fork, setsid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

/// Opens a pty, forks, and runs `$SHELL -i` on the slave side as a session
/// leader. Returns the master fd, which travels back to the CLI over
/// `SCM_RIGHTS`.
pub fn spawn_shell() -> Result<OwnedFd> {
    let OpenptyResult { master, slave } = openpty(None, None).context("openpty failed")?;

    // Safety: the child only calls async-signal-safe functions before exec.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            tracing::debug!(pid = %child, "Spawned interactive shell");
            drop(slave);

            Ok(master)
        }
        ForkResult::Child => {
            let result = (|| -> Result<std::convert::Infallible> {
                setsid().context("setsid failed")?;

                // Make the pty slave our controlling terminal.
                // Safety: slave is an open pty fd.
                if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) } < 0 {
                    return Err(std::io::Error::last_os_error()).context("TIOCSCTTY failed");
                }

                dup2_stdin(&slave)?;
                dup2_stdout(&slave)?;
                dup2_stderr(&slave)?;

                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned());
                let shell = CString::new(shell)?;
                let arg = CString::new("-i")?;

                execvp(&shell, &[shell.clone(), arg]).context("execvp failed")?;
                unreachable!("execvp returned without error")
            })();

            // Exec failed; nothing sensible to do in the forked child.
            tracing::error!("Failed to start shell: {result:?}");
            std::process::exit(127);
        }
    }
}

/// Runs one operator command, its output tied to the CLI's connection fd.
/// Returns the exit status as an errno-style result code.
pub fn run_inet_command(argv: &[String], output: OwnedFd) -> i32 {
    let Some((program, args)) = argv.split_first() else {
        return libc::EINVAL;
    };

    let stdout = match output.try_clone() {
        Ok(fd) => Stdio::from(fd),
        Err(_) => return libc::EIO,
    };

    let status = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::from(output))
        .status();

    match status {
        Ok(status) if status.success() => 0,
        Ok(_) => libc::EIO,
        Err(error) => error.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Runs the configured startup script with the tunnel device name as its
/// argument, logging but not failing on errors.
pub fn run_startup_script(script: &std::path::Path, side: &str, tunnel_device: &str) {
    tracing::info!(script = %script.display(), side, "Running startup script");

    match std::process::Command::new("/bin/sh")
        .arg(script)
        .arg(side)
        .arg(tunnel_device)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(script = %script.display(), %status, "Startup script failed"),
        Err(error) => {
            tracing::warn!(script = %script.display(), "Failed to run startup script: {error}")
        }
    }
}
