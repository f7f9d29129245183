use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::asciicast::{encode_event, header_line, Recording};
use crate::events::{self, Event, EventKind};
use crate::term;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Selected payloads byte-for-byte, for a real terminal.
    #[default]
    Raw,
    /// Re-serialized v2 events; the replay is itself a valid recording.
    Asciicast,
}

/// Playback control keys.  Comparison is whole-chunk, so multi-byte
/// bindings work as long as the terminal delivers them in one read.
#[derive(Debug, Clone, Default)]
pub struct PlayKeyBindings {
    pub pause: Option<Vec<u8>>,
    pub step: Option<Vec<u8>>,
    pub next_marker: Option<Vec<u8>>,
}

pub struct PlayOptions {
    pub idle_time_limit: Option<f64>,
    pub speed: f64,
    pub out_fmt: OutputFormat,
    pub stream: EventKind,
    pub pause_on_markers: bool,
    pub key_bindings: PlayKeyBindings,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            idle_time_limit: None,
            speed: 1.0,
            out_fmt: OutputFormat::Raw,
            stream: EventKind::Output,
            pause_on_markers: false,
            key_bindings: PlayKeyBindings::default(),
        }
    }
}

/// Replays a recording against the wall clock.  Returns `Ok(true)` when the
/// stream completed and `Ok(false)` when the user interrupted it.
pub fn play(recording: Recording, opts: &PlayOptions) -> Result<bool> {
    // keys come from the controlling terminal; without one the replay runs
    // with pacing but without interactive controls
    let tty = File::open("/dev/tty").ok();
    let control_fd = tty.as_ref().map(|file| file.as_raw_fd());
    let _raw = control_fd.map(term::raw);

    let mut stdout = io::stdout();
    run(recording, opts, &mut stdout, control_fd)
}

fn run(
    recording: Recording,
    opts: &PlayOptions,
    out: &mut dyn Write,
    control_fd: Option<RawFd>,
) -> Result<bool> {
    let idle_time_limit = opts.idle_time_limit.or(recording.header.idle_time_limit);

    if opts.out_fmt == OutputFormat::Asciicast {
        writeln!(out, "{}", header_line(&recording.header)?)?;
        out.flush()?;
    }

    let mut events = events::adjust_speed(
        events::to_absolute_time(events::cap_relative_time(
            events::to_relative_time(recording.events),
            idle_time_limit,
        )),
        opts.speed,
    );

    let bindings = &opts.key_bindings;
    let mut wall_start = Instant::now();
    let mut paused = false;
    let mut paused_elapsed = 0.0_f64;
    let mut seeking_marker = false;

    let mut pending = events.next();
    while let Some(item) = pending.take() {
        let event = item?;

        if !seeking_marker {
            'wait: loop {
                if paused {
                    // no way to resume without a control tty
                    let Some(fd) = control_fd else {
                        paused = false;
                        break 'wait;
                    };
                    let data = term::read_key(fd, 1000.0);
                    if data.is_empty() {
                        continue 'wait;
                    }
                    if data.contains(&0x03) {
                        return Ok(false);
                    }
                    if bindings.pause.as_deref() == Some(&data[..]) {
                        paused = false;
                        let behind = Duration::from_secs_f64(paused_elapsed.max(0.0));
                        wall_start = Instant::now().checked_sub(behind).unwrap_or_else(Instant::now);
                    } else if bindings.step.as_deref() == Some(&data[..]) {
                        // emit just this event, stay paused anchored at it
                        paused_elapsed = event.time;
                        break 'wait;
                    } else if bindings.next_marker.as_deref() == Some(&data[..]) {
                        seeking_marker = true;
                        break 'wait;
                    }
                } else {
                    let delay = event.time - wall_start.elapsed().as_secs_f64();
                    if delay <= 0.0 {
                        break 'wait;
                    }
                    let Some(fd) = control_fd else {
                        std::thread::sleep(Duration::from_secs_f64(delay));
                        break 'wait;
                    };
                    let data = term::read_key(fd, delay);
                    if data.is_empty() {
                        continue 'wait;
                    }
                    if data.contains(&0x03) {
                        return Ok(false);
                    }
                    if bindings.pause.as_deref() == Some(&data[..]) {
                        paused = true;
                        paused_elapsed = event.time;
                    }
                }
            }
        }

        match emit(out, &event, opts) {
            Ok(()) => {}
            Err(err) if is_broken_pipe(&err) => return Ok(true),
            Err(err) => return Err(err),
        }

        if event.kind == EventKind::Marker {
            if seeking_marker {
                seeking_marker = false;
                paused_elapsed = event.time;
            } else if opts.pause_on_markers {
                paused = true;
                paused_elapsed = event.time;
            }
        }

        pending = events.next();
    }

    Ok(true)
}

fn emit(out: &mut dyn Write, event: &Event, opts: &PlayOptions) -> Result<()> {
    match opts.out_fmt {
        OutputFormat::Raw => {
            if event.kind == opts.stream {
                out.write_all(event.payload().as_bytes())?;
                out.flush()?;
            }
        }
        OutputFormat::Asciicast => {
            writeln!(out, "{}", encode_event(event)?)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asciicast::{Header, Recording};
    use crate::events::EventData;
    use nix::unistd::write as fd_write;
    use std::os::fd::AsRawFd;

    fn recording(events: Vec<Event>) -> Recording {
        Recording {
            header: Header::new(80, 24),
            events: Box::new(events.into_iter().map(Ok)),
        }
    }

    fn text_event(time: f64, kind: EventKind, text: &str) -> Event {
        Event {
            time,
            kind,
            data: EventData::Text(text.to_string()),
        }
    }

    #[test]
    fn speed_divides_wall_clock_delays() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "foo"),
            text_event(2.0, EventKind::Output, "bar"),
        ]);

        let mut out = Vec::new();
        let started = Instant::now();
        let completed = run(
            rec,
            &PlayOptions {
                speed: 2.0,
                ..PlayOptions::default()
            },
            &mut out,
            None,
        )
        .unwrap();

        let elapsed = started.elapsed().as_secs_f64();
        assert!(completed);
        assert_eq!(out, b"foobar");
        assert!((0.8..1.4).contains(&elapsed), "elapsed {elapsed}");
    }

    #[test]
    fn idle_time_limit_caps_long_gaps() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "a"),
            text_event(30.0, EventKind::Output, "b"),
        ]);

        let mut out = Vec::new();
        let started = Instant::now();
        run(
            rec,
            &PlayOptions {
                idle_time_limit: Some(0.05),
                ..PlayOptions::default()
            },
            &mut out,
            None,
        )
        .unwrap();

        assert!(started.elapsed().as_secs_f64() < 1.0);
        assert_eq!(out, b"ab");
    }

    #[test]
    fn header_idle_time_limit_applies_when_not_overridden() {
        let mut header = Header::new(80, 24);
        header.idle_time_limit = Some(0.05);
        let rec = Recording {
            header,
            events: Box::new(
                vec![
                    text_event(0.0, EventKind::Output, "a"),
                    text_event(30.0, EventKind::Output, "b"),
                ]
                .into_iter()
                .map(Ok),
            ),
        };

        let started = Instant::now();
        run(rec, &PlayOptions::default(), &mut Vec::new(), None).unwrap();
        assert!(started.elapsed().as_secs_f64() < 1.0);
    }

    #[test]
    fn raw_sink_selects_the_requested_stream() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "out"),
            text_event(0.0, EventKind::Input, "in"),
            text_event(0.0, EventKind::Resize, "80x24"),
        ]);

        let mut out = Vec::new();
        run(
            rec,
            &PlayOptions {
                stream: EventKind::Input,
                ..PlayOptions::default()
            },
            &mut out,
            None,
        )
        .unwrap();

        assert_eq!(out, b"in");
    }

    #[test]
    fn asciicast_sink_replays_to_a_valid_recording() {
        let rec = recording(vec![
            text_event(0.25, EventKind::Output, "a"),
            Event::resize(0.5, 100, 40),
            text_event(0.75, EventKind::Marker, "checkpoint"),
        ]);

        let mut out = Vec::new();
        run(
            rec,
            &PlayOptions {
                out_fmt: OutputFormat::Asciicast,
                speed: 1000.0,
                ..PlayOptions::default()
            },
            &mut out,
            None,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let reread =
            crate::asciicast::open(Box::new(std::io::BufReader::new(std::io::Cursor::new(text))))
                .unwrap();
        let events: Vec<_> = reread.events.map(Result::unwrap).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].data, EventData::Size(100, 40));
        assert_eq!(events[2].kind, EventKind::Marker);
        assert_eq!(events[2].payload(), "checkpoint");
    }

    #[test]
    fn malformed_stream_aborts_playback() {
        let rec = Recording {
            header: Header::new(80, 24),
            events: Box::new(
                vec![
                    Ok(text_event(0.0, EventKind::Output, "a")),
                    Err(crate::asciicast::FormatError::MalformedLine("bad".to_string()).into()),
                ]
                .into_iter(),
            ),
        };

        let err = run(rec, &PlayOptions::default(), &mut Vec::new(), None).unwrap_err();
        assert!(err
            .downcast_ref::<crate::asciicast::FormatError>()
            .is_some());
    }

    #[test]
    fn marker_pauses_until_resume_key() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "a"),
            text_event(0.01, EventKind::Marker, ""),
            text_event(0.02, EventKind::Output, "b"),
        ]);

        let (r, w) = nix::unistd::pipe().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            fd_write(&w, b" ").unwrap();
        });

        let mut out = Vec::new();
        let started = Instant::now();
        let completed = run(
            rec,
            &PlayOptions {
                pause_on_markers: true,
                key_bindings: PlayKeyBindings {
                    pause: Some(b" ".to_vec()),
                    ..PlayKeyBindings::default()
                },
                ..PlayOptions::default()
            },
            &mut out,
            Some(r.as_raw_fd()),
        )
        .unwrap();

        assert!(completed);
        assert_eq!(out, b"ab");
        // the pause held playback until the resume key arrived
        assert!(started.elapsed().as_secs_f64() >= 0.09);
    }

    #[test]
    fn next_marker_emits_through_the_following_marker() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "a"),
            text_event(0.01, EventKind::Marker, ""),
            text_event(0.02, EventKind::Output, "b"),
            text_event(0.03, EventKind::Marker, ""),
            text_event(0.04, EventKind::Output, "c"),
        ]);

        let (r, w) = nix::unistd::pipe().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            fd_write(&w, b"]").unwrap();
            std::thread::sleep(Duration::from_millis(80));
            fd_write(&w, b" ").unwrap();
        });

        let mut out = Vec::new();
        let completed = run(
            rec,
            &PlayOptions {
                pause_on_markers: true,
                key_bindings: PlayKeyBindings {
                    pause: Some(b" ".to_vec()),
                    next_marker: Some(b"]".to_vec()),
                    ..PlayKeyBindings::default()
                },
                ..PlayOptions::default()
            },
            &mut out,
            Some(r.as_raw_fd()),
        )
        .unwrap();

        assert!(completed);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn ctrl_c_cancels_playback() {
        let rec = recording(vec![
            text_event(0.0, EventKind::Output, "a"),
            text_event(5.0, EventKind::Output, "never"),
        ]);

        let (r, w) = nix::unistd::pipe().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            fd_write(&w, &[0x03]).unwrap();
        });

        let mut out = Vec::new();
        let completed = run(
            rec,
            &PlayOptions::default(),
            &mut out,
            Some(r.as_raw_fd()),
        )
        .unwrap();

        assert!(!completed);
        assert_eq!(out, b"a");
    }
}
