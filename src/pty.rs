use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Instant;

use anyhow::{Error, Result};
use bytes::{Buf, BytesMut};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::select::{select, FdSet};
use nix::sys::termios::tcgetattr;
use nix::sys::wait::waitpid;
use nix::unistd::{execvpe, fork, read, write, ForkResult};

use crate::signals::{SignalPipe, EXIT_SIGNALS, SIGINT, SIGWINCH};
use crate::term;
use crate::worker::AsyncWriter;

/// Upper bound for a single read from the pty master or the tty.
const READ_LEN: usize = 256 * 1024;

/// Control keys recognized while recording.  Each is a short byte string;
/// `prefix` arms a two-key sequence, `pause` and `add_marker` act directly
/// when no prefix is configured.
#[derive(Debug, Clone, Default)]
pub struct KeyBindings {
    pub prefix: Option<Vec<u8>>,
    pub pause: Option<Vec<u8>>,
    pub add_marker: Option<Vec<u8>>,
}

/// Runs `command` under a fresh pty and relays bytes between it and the
/// controlling terminal, emitting timestamped events to `writer`.
///
/// Returns once the pty master reaches EOF and the child has been reaped.
pub fn record(
    command: &[String],
    env: &HashMap<String, String>,
    writer: &AsyncWriter,
    get_tty_size: &dyn Fn() -> (u16, u16),
    notify: &dyn Fn(&str),
    key_bindings: &KeyBindings,
    tty_stdin_fd: RawFd,
    tty_stdout_fd: RawFd,
) -> Result<()> {
    // prepared ahead of fork() so the child only has to exec
    let argv = command
        .iter()
        .filter_map(|arg| CString::new(arg.as_bytes()).ok())
        .collect::<Vec<_>>();
    anyhow::ensure!(!argv.is_empty(), "empty command");
    let envp = env
        .iter()
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect::<Vec<_>>();

    let stdin_borrowed = unsafe { BorrowedFd::borrow_raw(tty_stdin_fd) };
    let term_attrs = tcgetattr(stdin_borrowed).ok();
    let winsize = term::get_winsize(stdin_borrowed);
    let pty = openpty(&winsize, &term_attrs)?;

    if let ForkResult::Parent { child } = unsafe { fork()? } {
        drop(pty.slave);

        let result = supervise(
            &pty.master,
            writer,
            get_tty_size,
            notify,
            key_bindings,
            tty_stdin_fd,
            tty_stdout_fd,
        );

        // close the master before reaping so the child sees hangup
        drop(pty.master);
        waitpid(child, None).ok();

        return result;
    }

    // Child: restore default SIGPIPE, bind the slave as the controlling
    // terminal and become the target executable.
    drop(pty.master);
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if login_tty_compat(pty.slave.into_raw_fd()).is_err() {
            libc::_exit(127);
        }
    }

    let _ = execvpe(&argv[0], &argv, &envp);
    unsafe { libc::_exit(127) }
}

/// Cross-platform implementation of `login_tty`.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
unsafe fn login_tty_compat(fd: i32) -> Result<(), Error> {
    if libc::login_tty(fd) == 0 {
        Ok(())
    } else {
        Err(Error::msg("login_tty failed"))
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
unsafe fn login_tty_compat(fd: i32) -> Result<(), Error> {
    if libc::setsid() == -1 {
        return Err(Error::msg("setsid failed"));
    }

    const TIOCSCTTY: libc::c_ulong = 0x540E;
    if libc::ioctl(fd, TIOCSCTTY, 0) == -1 && libc::ioctl(fd, TIOCSCTTY, 1) == -1 {
        return Err(Error::msg("ioctl TIOCSCTTY failed"));
    }

    if libc::dup2(fd, 0) == -1 || libc::dup2(fd, 1) == -1 || libc::dup2(fd, 2) == -1 {
        return Err(Error::msg("dup2 failed"));
    }

    if fd > 2 {
        libc::close(fd);
    }

    Ok(())
}

fn supervise(
    master: &OwnedFd,
    writer: &AsyncWriter,
    get_tty_size: &dyn Fn() -> (u16, u16),
    notify: &dyn Fn(&str),
    key_bindings: &KeyBindings,
    tty_stdin_fd: RawFd,
    tty_stdout_fd: RawFd,
) -> Result<()> {
    fcntl(master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

    let mut supervisor = Supervisor {
        writer,
        get_tty_size,
        notify,
        key_bindings,
        tty_stdout_fd,
        start_time: Instant::now(),
        pause_time: None,
        prefix_mode: false,
        input_buf: BytesMut::new(),
    };

    let (cols, rows) = (supervisor.get_tty_size)();
    term::set_winsize(master.as_fd(), cols, rows).ok();

    let mut wakeup_signals = vec![SIGWINCH, SIGINT];
    wakeup_signals.extend_from_slice(&EXIT_SIGNALS);
    let signal_pipe = SignalPipe::install(&wakeup_signals)?;
    let raw_guard = term::raw(tty_stdin_fd);

    let result = supervisor.copy_loop(master.as_fd(), signal_pipe.fd(), tty_stdin_fd);

    drop(raw_guard);
    drop(signal_pipe);
    result
}

struct Supervisor<'a> {
    writer: &'a AsyncWriter,
    get_tty_size: &'a dyn Fn() -> (u16, u16),
    notify: &'a dyn Fn(&str),
    key_bindings: &'a KeyBindings,
    tty_stdout_fd: RawFd,
    start_time: Instant,
    pause_time: Option<Instant>,
    prefix_mode: bool,
    input_buf: BytesMut,
}

impl Supervisor<'_> {
    fn copy_loop(
        &mut self,
        master: BorrowedFd,
        signal_fd: BorrowedFd,
        tty_stdin_fd: RawFd,
    ) -> Result<()> {
        let stdin = unsafe { BorrowedFd::borrow_raw(tty_stdin_fd) };
        let mut buf = vec![0u8; READ_LEN];
        let mut read_stdin = true;
        let mut read_signals = true;

        loop {
            let mut read_fds = FdSet::new();
            let mut write_fds = FdSet::new();
            read_fds.insert(master);
            if read_stdin {
                read_fds.insert(stdin);
            }
            if read_signals {
                read_fds.insert(signal_fd);
            }
            if !self.input_buf.is_empty() {
                write_fds.insert(master);
            }

            match select(None, Some(&mut read_fds), Some(&mut write_fds), None, None) {
                Ok(_) => {}
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(err) => return Err(err.into()),
            }

            if read_fds.contains(master) {
                match read(&master, &mut buf) {
                    // on linux a closed pty raises EIO
                    Ok(0) | Err(Errno::EIO) => break,
                    Ok(n) => self.handle_master_read(&buf[..n])?,
                    Err(Errno::EAGAIN | Errno::EINTR) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            if read_stdin && read_fds.contains(stdin) {
                match read(&stdin, &mut buf) {
                    Ok(0) | Err(Errno::EIO) => read_stdin = false,
                    Ok(n) => self.handle_stdin_read(&buf[..n]),
                    Err(Errno::EAGAIN | Errno::EINTR) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            if read_signals && read_fds.contains(signal_fd) {
                match read(&signal_fd, &mut buf) {
                    Ok(n) if n > 0 => {
                        for &sig in &buf[..n] {
                            match i32::from(sig) {
                                SIGWINCH => self.handle_resize(master),
                                SIGINT => read_stdin = false,
                                sig if EXIT_SIGNALS.contains(&sig) => read_signals = false,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }

            if !self.input_buf.is_empty() && write_fds.contains(master) {
                match write(master, &self.input_buf) {
                    Ok(n) => self.input_buf.advance(n),
                    Err(Errno::EAGAIN | Errno::EINTR) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }

    fn elapsed(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Child output: the user-visible side is written out synchronously
    /// before the event is enqueued, never after.
    fn handle_master_read(&mut self, data: &[u8]) -> Result<()> {
        write_all(unsafe { BorrowedFd::borrow_raw(self.tty_stdout_fd) }, data)?;

        if self.pause_time.is_none() {
            self.writer.write_stdout(self.elapsed(), data.to_vec());
        }
        Ok(())
    }

    fn handle_stdin_read(&mut self, data: &[u8]) {
        let bindings = self.key_bindings;

        if !self.prefix_mode && bindings.prefix.as_deref() == Some(data) {
            self.prefix_mode = true;
            return;
        }

        let is_command = bindings.pause.as_deref() == Some(data)
            || bindings.add_marker.as_deref() == Some(data);

        if self.prefix_mode || (bindings.prefix.is_none() && is_command) {
            self.prefix_mode = false;

            if bindings.pause.as_deref() == Some(data) {
                self.toggle_pause();
            } else if bindings.add_marker.as_deref() == Some(data) {
                self.writer.write_marker(self.elapsed());
                (self.notify)("Marker added");
            }
            return;
        }

        self.input_buf.extend_from_slice(data);

        // save stdin unless paused or the chunk is an OSC response the
        // terminal sent on the child's behalf (e.g. \x1b]11;?\x07)
        if self.pause_time.is_none() && !is_osc_reply(data) {
            self.writer.write_stdin(self.elapsed(), data.to_vec());
        }
    }

    fn toggle_pause(&mut self) {
        if let Some(paused_at) = self.pause_time.take() {
            self.start_time += paused_at.elapsed();
            (self.notify)("Resumed recording");
        } else {
            self.pause_time = Some(Instant::now());
            (self.notify)("Paused recording");
        }
    }

    fn handle_resize(&mut self, master: BorrowedFd) {
        let (cols, rows) = (self.get_tty_size)();
        term::set_winsize(master, cols, rows).ok();
        self.writer.write_resize(self.elapsed(), (cols, rows));
    }
}

fn is_osc_reply(data: &[u8]) -> bool {
    data.len() > 2 && data[0] == 0x1b && data[1] == b']' && data[data.len() - 1] == 0x07
}

/// Calls write in a loop until it's done.
fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR | Errno::EAGAIN) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asciicast::{self, Header};
    use crate::events::EventKind;
    use crate::writer::CastWriter;
    use std::io::BufReader;

    fn async_writer(path: &std::path::Path) -> AsyncWriter {
        let writer =
            CastWriter::create(path.to_str().unwrap(), &Header::new(80, 24), false, Box::new(|_| {}))
                .unwrap();
        AsyncWriter::new(Box::new(writer), 0.0, true)
    }

    fn recorded_output(path: &std::path::Path) -> String {
        let file = std::fs::File::open(path).unwrap();
        let recording = asciicast::open(Box::new(BufReader::new(file))).unwrap();
        recording
            .events
            .map(Result::unwrap)
            .filter(|ev| ev.kind == EventKind::Output)
            .map(|ev| ev.payload().into_owned())
            .collect()
    }

    #[test]
    fn records_child_output_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.cast");
        let devnull = std::fs::File::open("/dev/null").unwrap();
        let sink = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();

        {
            let writer = async_writer(&path);
            let mut env: HashMap<String, String> = std::env::vars().collect();
            env.insert("ASCIINEMA_REC".to_string(), "1".to_string());

            record(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "printf foo; sleep 0.01; printf bar".to_string(),
                ],
                &env,
                &writer,
                &|| (80, 24),
                &|_| {},
                &KeyBindings::default(),
                devnull.as_raw_fd(),
                sink.as_raw_fd(),
            )
            .unwrap();
            writer.finish().unwrap();
        }

        assert_eq!(recorded_output(&path), "foobar");
    }

    #[test]
    fn pause_suppresses_output_and_excises_paused_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.cast");
        let sink = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();

        {
            let writer = async_writer(&path);
            let bindings = KeyBindings {
                pause: Some(vec![0x1c]),
                ..KeyBindings::default()
            };
            let size = || -> (u16, u16) { (80, 24) };
            let notify = |_: &str| {};
            let mut supervisor = Supervisor {
                writer: &writer,
                get_tty_size: &size,
                notify: &notify,
                key_bindings: &bindings,
                tty_stdout_fd: sink.as_raw_fd(),
                start_time: Instant::now(),
                pause_time: None,
                prefix_mode: false,
                input_buf: BytesMut::new(),
            };

            supervisor.handle_stdin_read(&[0x1c]);
            std::thread::sleep(std::time::Duration::from_millis(80));
            supervisor.handle_master_read(b"hidden").unwrap();
            supervisor.handle_stdin_read(&[0x1c]);
            supervisor.handle_master_read(b"visible").unwrap();
            writer.finish().unwrap();
        }

        let file = std::fs::File::open(&path).unwrap();
        let recording = asciicast::open(Box::new(BufReader::new(file))).unwrap();
        let outputs: Vec<_> = recording
            .events
            .map(Result::unwrap)
            .filter(|ev| ev.kind == EventKind::Output)
            .collect();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].payload(), "visible");
        // the 80ms paused stretch does not appear on the timeline
        assert!(outputs[0].time < 0.05, "time was {}", outputs[0].time);
    }

    #[test]
    fn prefix_key_arms_commands() {
        let sink = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let writer = async_writer(&dir.path().join("rec.cast"));

        let bindings = KeyBindings {
            prefix: Some(vec![0x01]),
            pause: Some(vec![b'p']),
            ..KeyBindings::default()
        };
        let size = || -> (u16, u16) { (80, 24) };
        let notify = |_: &str| {};
        let mut supervisor = Supervisor {
            writer: &writer,
            get_tty_size: &size,
            notify: &notify,
            key_bindings: &bindings,
            tty_stdout_fd: sink.as_raw_fd(),
            start_time: Instant::now(),
            pause_time: None,
            prefix_mode: false,
            input_buf: BytesMut::new(),
        };

        // 'p' alone is plain input while a prefix is configured
        supervisor.handle_stdin_read(b"p");
        assert_eq!(&supervisor.input_buf[..], b"p");
        assert!(supervisor.pause_time.is_none());

        // prefix followed by 'p' pauses and swallows both chunks
        supervisor.handle_stdin_read(&[0x01]);
        supervisor.handle_stdin_read(b"p");
        assert!(supervisor.pause_time.is_some());
        assert_eq!(&supervisor.input_buf[..], b"p");

        // prefix followed by an unbound key cancels the prefix
        supervisor.handle_stdin_read(&[0x01]);
        supervisor.handle_stdin_read(b"x");
        assert!(!supervisor.prefix_mode);
    }

    #[test]
    fn osc_replies_are_not_recorded_as_input() {
        assert!(is_osc_reply(b"\x1b]11;rgb:aaaa/bbbb/cccc\x07"));
        assert!(!is_osc_reply(b"hello"));
        assert!(!is_osc_reply(b"\x1b]"));
    }
}
