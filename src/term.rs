use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc::{TIOCGWINSZ, TIOCSWINSZ};
use nix::pty::Winsize;
use nix::sys::select::{select, FdSet};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::sys::time::TimeVal;
use nix::unistd::read;

/// Upper bound for a single key read.
const KEY_READ_LEN: usize = 1024;

/// Switches `fd` into raw mode for the lifetime of the returned guard.
///
/// If `fd` is not a tty this does nothing, and the guard restores nothing.
pub fn raw(fd: RawFd) -> RawGuard {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let saved = tcgetattr(borrowed).ok();

    if let Some(ref termios) = saved {
        let mut raw_attrs = termios.clone();
        cfmakeraw(&mut raw_attrs);
        tcsetattr(borrowed, SetArg::TCSAFLUSH, &raw_attrs).ok();
    }

    RawGuard { fd, saved }
}

pub struct RawGuard {
    fd: RawFd,
    saved: Option<Termios>,
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        if let Some(ref termios) = self.saved {
            // let answerback sequences still in flight drain before the
            // terminal leaves raw mode, otherwise they end up on the shell
            thread::sleep(Duration::from_millis(10));
            let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
            tcsetattr(borrowed, SetArg::TCSAFLUSH, termios).ok();
        }
    }
}

/// Waits up to `timeout` seconds for `fd` to become readable and returns up
/// to 1024 bytes.  Returns an empty buffer on timeout; a zero timeout makes
/// this a non-blocking poll.
pub fn read_key(fd: RawFd, timeout: f64) -> Vec<u8> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut read_fds = FdSet::new();
    read_fds.insert(borrowed);

    let timeout = timeout.max(0.0);
    let mut tv = TimeVal::new(
        timeout.trunc() as nix::libc::time_t,
        (timeout.fract() * 1_000_000.0) as nix::libc::suseconds_t,
    );

    match select(None, Some(&mut read_fds), None, None, Some(&mut tv)) {
        Ok(n) if n > 0 && read_fds.contains(borrowed) => {
            let mut buf = [0u8; KEY_READ_LEN];
            match read(borrowed, &mut buf) {
                Ok(n) => buf[..n].to_vec(),
                Err(_) => Vec::new(),
            }
        }
        Ok(_) | Err(Errno::EINTR | Errno::EAGAIN) => Vec::new(),
        Err(_) => Vec::new(),
    }
}

/// If possible, returns the terminal size of the given fd.
pub fn get_winsize(fd: BorrowedFd) -> Option<Winsize> {
    nix::ioctl_read_bad!(_get_window_size, TIOCGWINSZ, Winsize);
    let mut size: Winsize = unsafe { std::mem::zeroed() };
    unsafe { _get_window_size(fd.as_raw_fd(), &mut size).ok()? };
    Some(size)
}

/// Sets the winsize.
pub fn set_winsize(fd: BorrowedFd, cols: u16, rows: u16) -> nix::Result<()> {
    nix::ioctl_write_ptr_bad!(_set_window_size, TIOCSWINSZ, Winsize);
    let size = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { _set_window_size(fd.as_raw_fd(), &size) }?;
    Ok(())
}

/// Returns `(cols, rows)` of the terminal behind `fd`, or 80×24 when `fd` is
/// not a tty.
pub fn tty_size(fd: RawFd) -> (u16, u16) {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    get_winsize(borrowed)
        .filter(|ws| ws.ws_col > 0 && ws.ws_row > 0)
        .map_or((80, 24), |ws| (ws.ws_col, ws.ws_row))
}
