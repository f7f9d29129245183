use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};

use crate::asciicast::{self, Header};
use crate::notifier::Notifier;
use crate::pty::{self, KeyBindings};
use crate::term;
use crate::worker::{AsyncNotifier, AsyncWriter};
use crate::writer::{CastWriter, EventWriter, RawWriter};

pub struct RecordOptions {
    pub path: String,
    pub command: Option<String>,
    pub append: bool,
    pub raw: bool,
    pub record_stdin: bool,
    pub idle_time_limit: Option<f64>,
    pub title: Option<String>,
    pub capture_env: Vec<String>,
    pub cols_override: Option<u16>,
    pub rows_override: Option<u16>,
    pub key_bindings: KeyBindings,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            command: None,
            append: false,
            raw: false,
            record_stdin: false,
            idle_time_limit: None,
            title: None,
            capture_env: vec!["SHELL".to_string(), "TERM".to_string()],
            cols_override: None,
            rows_override: None,
            key_bindings: KeyBindings::default(),
        }
    }
}

/// Records one session: assembles the header, resolves the append offset,
/// and wires the writer worker, notifier, and pty supervisor together.  All
/// of them are scope guards; every exit path restores terminal state, joins
/// the workers, and reaps the child.
pub fn record(opts: &RecordOptions, notifier: Notifier) -> Result<()> {
    let command = opts
        .command
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "sh".to_string());

    let mut command_env: HashMap<String, String> = std::env::vars().collect();
    command_env.insert("ASCIINEMA_REC".to_string(), "1".to_string());

    let time_offset = resolve_time_offset(&opts.path, opts.append)?;

    let tty_stdin_fd = 0;
    // the child's visible output goes to the controlling terminal, or
    // nowhere when there is none
    let tty_stdout = File::options()
        .write(true)
        .open("/dev/tty")
        .or_else(|_| File::options().write(true).open("/dev/null"))
        .context("failed to open a tty output")?;
    let tty_stdout_fd = tty_stdout.as_raw_fd();

    let get_tty_size = tty_size_fn(tty_stdout_fd, opts.cols_override, opts.rows_override);
    let header = build_header(opts, &command, &command_env, &get_tty_size);

    let notifier = AsyncNotifier::new(notifier);

    let writer: Box<dyn EventWriter> = if opts.raw {
        Box::new(RawWriter::create(
            &opts.path,
            &header,
            opts.append,
            notifier.on_error(),
        )?)
    } else {
        Box::new(CastWriter::create(
            &opts.path,
            &header,
            opts.append,
            notifier.on_error(),
        )?)
    };

    let writer = AsyncWriter::new(writer, time_offset, opts.record_stdin);
    let notify = |text: &str| notifier.notify(text);

    pty::record(
        &["sh".to_string(), "-c".to_string(), command],
        &command_env,
        &writer,
        &get_tty_size,
        &notify,
        &opts.key_bindings,
        tty_stdin_fd,
        tty_stdout_fd,
    )?;

    writer.finish()
}

/// New events in append mode are shifted by the duration of the existing
/// recording so the timeline stays monotonic across the boundary.
fn resolve_time_offset(path: &str, append: bool) -> Result<f64> {
    if !append
        || path == "-"
        || std::fs::metadata(path).map(|meta| meta.len() == 0).unwrap_or(true)
    {
        return Ok(0.0);
    }

    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    asciicast::output_duration(Box::new(BufReader::new(file)))
}

fn tty_size_fn(
    fd: i32,
    cols_override: Option<u16>,
    rows_override: Option<u16>,
) -> impl Fn() -> (u16, u16) {
    move || {
        if let (Some(cols), Some(rows)) = (cols_override, rows_override) {
            return (cols, rows);
        }
        let (cols, rows) = term::tty_size(fd);
        (cols_override.unwrap_or(cols), rows_override.unwrap_or(rows))
    }
}

fn build_header(
    opts: &RecordOptions,
    command: &str,
    command_env: &HashMap<String, String>,
    get_tty_size: &impl Fn() -> (u16, u16),
) -> Header {
    let (width, height) = get_tty_size();
    let mut header = Header::new(width, height);

    header.timestamp = Some(serde_json::Number::from(
        jiff::Timestamp::now().as_second(),
    ));
    header.idle_time_limit = opts.idle_time_limit;
    header.title = opts.title.clone();

    if opts.command.is_some() {
        header.command = Some(command.to_string());
    }

    if !opts.capture_env.is_empty() {
        header.env = Some(
            opts.capture_env
                .iter()
                .filter_map(|var| {
                    command_env
                        .get(var)
                        .map(|value| (var.clone(), value.clone()))
                })
                .collect(),
        );
    }

    header
}
