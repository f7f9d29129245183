use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use anyhow::Error;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe;
use signal_hook::SigId;

pub use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGWINCH};

/// Signals that end the recording once the child is gone.  Their arrival
/// removes the signal fd from the select loop's read set; the loop itself
/// keeps running until the pty master reaches EOF so that final output is
/// still captured.
pub const EXIT_SIGNALS: [i32; 4] = [SIGCHLD, SIGHUP, SIGTERM, SIGQUIT];

/// Routes signal delivery into a non-blocking pipe.
///
/// Every registered signal writes its own number as a single byte to the
/// write end, so the select loop is the sole consumer of signal state and no
/// handler touches shared mutable data.  Dropping the channel unregisters
/// the handlers.
pub struct SignalPipe {
    read_fd: OwnedFd,
    _write_fd: OwnedFd,
    sig_ids: Vec<SigId>,
}

impl SignalPipe {
    pub fn install(signals: &[i32]) -> Result<Self, Error> {
        let (read_fd, write_fd) = pipe()?;
        fcntl(&read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(&write_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let mut sig_ids = Vec::with_capacity(signals.len());
        let raw_write_fd = write_fd.as_raw_fd();

        for &sig in signals {
            // the handler body only calls write(2), which is async-signal-safe
            let id = unsafe {
                signal_hook::low_level::register(sig, move || {
                    let byte = sig as u8;
                    libc::write(raw_write_fd, std::ptr::addr_of!(byte).cast(), 1);
                })
            }?;
            sig_ids.push(id);
        }

        Ok(Self {
            read_fd,
            _write_fd: write_fd,
            sig_ids,
        })
    }

    /// The read end; becomes readable whenever a registered signal arrives.
    pub fn fd(&self) -> BorrowedFd {
        self.read_fd.as_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.sig_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
