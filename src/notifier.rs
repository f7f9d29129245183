use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Desktop notification dispatch behind a single `notify(text)`.
///
/// The backend is probed once at startup.  Notification failures are
/// swallowed: a broken notifier must not take the recording down, and it
/// must not print anything to the terminal being recorded.
pub struct Notifier {
    backend: Backend,
}

enum Backend {
    TerminalNotifier,
    AppleScript,
    LibNotify,
    Custom(String),
    Noop,
}

impl Notifier {
    pub fn detect(enabled: bool, custom_command: Option<String>) -> Self {
        let backend = if !enabled {
            Backend::Noop
        } else if let Some(command) = custom_command {
            Backend::Custom(command)
        } else if has_executable("terminal-notifier") {
            Backend::TerminalNotifier
        } else if has_executable("osascript") {
            Backend::AppleScript
        } else if has_executable("notify-send") {
            Backend::LibNotify
        } else {
            Backend::Noop
        };

        Self { backend }
    }

    pub fn notify(&self, text: &str) {
        let mut command = match &self.backend {
            Backend::TerminalNotifier => {
                let mut cmd = Command::new("terminal-notifier");
                cmd.args(["-title", "tty-cast", "-message", text]);
                cmd
            }
            Backend::AppleScript => {
                let mut cmd = Command::new("osascript");
                cmd.arg("-e").arg(format!(
                    "display notification \"{}\" with title \"tty-cast\"",
                    text.replace('"', "\\\"")
                ));
                cmd
            }
            Backend::LibNotify => {
                let mut cmd = Command::new("notify-send");
                cmd.args(["tty-cast", text]);
                cmd
            }
            Backend::Custom(shell_command) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.args(["-c", shell_command]).env("TEXT", text);
                cmd
            }
            Backend::Noop => return,
        };

        let _ = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

fn has_executable(program: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };

    env::split_paths(&path).any(|dir| is_executable(&dir.join(program)))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
