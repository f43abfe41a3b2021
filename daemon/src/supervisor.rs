//! Process supervision: signal routing, the namespace clone, and
//! restart-in-place.
//!
//! Signals are consumed through `signalfd` in both processes, never through
//! async handlers. The parent blocks everything except the fatal faults and
//! forwards whatever it receives (minus SIGCHLD) to the child; the child
//! listens only for the termination set.

use anyhow::{Context as _, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::{SigmaskHow, Signal, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn request_restart() {
    RESTART_REQUESTED.store(true, Ordering::Relaxed);
}

pub fn restart_requested() -> bool {
    RESTART_REQUESTED.load(Ordering::Relaxed)
}

/// Blocks every signal except the unmaskable faults and returns the
/// parent's signalfd plus the pre-existing mask (restored in the child).
pub fn init_parent_signals() -> Result<(SignalFd, SigSet)> {
    let mut mask = SigSet::all();
    mask.remove(Signal::SIGILL);
    mask.remove(Signal::SIGSEGV);
    mask.remove(Signal::SIGBUS);

    let mut old_mask = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old_mask))
        .context("sigprocmask failed")?;

    let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("signalfd failed")?;

    Ok((fd, old_mask))
}

/// Child-side signal setup: restore the inherited mask, then block and
/// listen for the termination set only.
pub fn init_child_signals(old_mask: &SigSet) -> Result<SignalFd> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(old_mask), None)
        .context("failed to restore signal mask")?;

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGQUIT);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).context("sigprocmask failed")?;

    SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("signalfd failed")
}

/// Clones the stub-network child into fresh network, UTS, PID and mount
/// namespaces. The callback is the child's entire life; its return value is
/// the child's exit code.
pub fn clone_stub_process(child_main: impl FnMut() -> isize) -> Result<Pid> {
    // The child's bootstrap stack; it switches to regular thread stacks as
    // soon as it spawns its workers.
    let mut stack = vec![0u8; 256 * 1024];

    let flags = CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS;

    // Safety: cloning without CLONE_VM copies the address space, so the
    // child keeps a private copy of this stack no matter when the parent
    // frees its own.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(child_main),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .context("clone failed")?;

    Ok(pid)
}

/// What the parent's signal handler decided.
pub enum SignalDisposition {
    /// Keep running.
    Continue,
    /// The child exited; stop the main loop.
    ChildExited,
}

/// Parent policy: forward everything except SIGCHLD to the child; SIGCHLD
/// from the child ends the daemon.
pub fn handle_parent_signal(fd: &mut SignalFd, child: Pid) -> SignalDisposition {
    let info = match fd.read_signal() {
        Ok(Some(info)) => info,
        Ok(None) => return SignalDisposition::Continue,
        Err(error) => {
            tracing::error!("Failed to read signalfd: {error}");
            return SignalDisposition::Continue;
        }
    };

    let signo = info.ssi_signo as i32;
    if signo != libc::SIGCHLD {
        match Signal::try_from(signo) {
            Ok(signal) => {
                tracing::info!(%signal, "Forwarding signal to the stub process");
                if let Err(error) = nix::sys::signal::kill(child, signal) {
                    tracing::warn!("Failed to forward signal: {error}");
                }
            }
            Err(_) => tracing::debug!(signo, "Ignoring unknown signal"),
        }
        return SignalDisposition::Continue;
    }

    // Stop/continue notifications are not exits.
    if matches!(info.ssi_code, libc::CLD_STOPPED | libc::CLD_CONTINUED) {
        return SignalDisposition::Continue;
    }

    if info.ssi_pid as i32 != child.as_raw() {
        tracing::debug!(pid = info.ssi_pid, "SIGCHLD for an unrelated process");
        return SignalDisposition::Continue;
    }

    tracing::info!("Stub process exited");
    SignalDisposition::ChildExited
}

/// Replaces the current process image with a fresh invocation of ourselves,
/// preserving the original arguments.
pub fn exec_restart() -> Result<()> {
    use std::ffi::CString;

    let args: Vec<CString> = std::env::args()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .context("argument contains a NUL byte")?;
    let program = args.first().context("argv is empty")?.clone();

    tracing::info!("Restarting in place");
    nix::unistd::execvp(&program, &args).context("execvp failed")?;

    Ok(())
}
