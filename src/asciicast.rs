use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventData, EventKind};

/// The recording is not in a shape this crate can read.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("only asciicast v1 and v2 formats can be opened")]
    UnknownFormat,
    #[error("malformed event line: {0}")]
    MalformedLine(String),
}

/// First line of a v2 file.  Unknown keys are preserved so that copy
/// utilities do not strip what other producers stored.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Header {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_time_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Header {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            version: 2,
            width,
            height,
            ..Self::default()
        }
    }
}

/// `serde_json` formatter matching the wire format exactly: `", "` between
/// values, `": "` after keys, non-ASCII emitted verbatim.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}

fn json_line<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value
        .serialize(&mut ser)
        .context("failed to serialize event line")?;
    Ok(String::from_utf8(buf).expect("serde_json emits UTF-8"))
}

/// Timestamps carry at most microsecond precision; whole values serialize as
/// JSON integers.
fn time_number(time: f64) -> serde_json::Number {
    let rounded = (time * 1e6).round() / 1e6;
    if rounded.fract() == 0.0 && rounded.abs() < 9e15 {
        serde_json::Number::from(rounded as i64)
    } else {
        serde_json::Number::from_f64(rounded).unwrap_or_else(|| serde_json::Number::from(0))
    }
}

/// Serializes the header as a v2 first line (no trailing newline).
pub fn header_line(header: &Header) -> Result<String> {
    json_line(header)
}

/// Serializes one `[t, kind, payload]` event line (no trailing newline).
pub fn event_line(time: f64, code: &str, payload: &str) -> Result<String> {
    json_line(&(time_number(time), code, payload))
}

/// Serializes an in-memory event, materializing its payload to the wire
/// string form.
pub fn encode_event(event: &Event) -> Result<String> {
    event_line(event.time, event.kind.code(), &event.payload())
}

/// Parses one v2 event line: exactly three JSON values in an array.
pub fn parse_event_line(line: &str) -> Result<Event, FormatError> {
    let malformed = || FormatError::MalformedLine(line.to_string());

    let value: serde_json::Value = serde_json::from_str(line).map_err(|_| malformed())?;
    let items = value.as_array().filter(|a| a.len() == 3).ok_or_else(malformed)?;

    let time = items[0].as_f64().ok_or_else(malformed)?;
    let code = items[1].as_str().ok_or_else(malformed)?;
    let payload = items[2].as_str().ok_or_else(malformed)?;

    let kind = EventKind::from_code(code);
    let data = match kind {
        EventKind::Resize => parse_size(payload)
            .map_or_else(|| EventData::Text(payload.to_string()), |(c, r)| EventData::Size(c, r)),
        _ => EventData::Text(payload.to_string()),
    };

    Ok(Event { time, kind, data })
}

fn parse_size(payload: &str) -> Option<(u16, u16)> {
    let (cols, rows) = payload.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

/// An opened recording: header plus a lazy event stream.
pub struct Recording {
    pub header: Header,
    pub events: Box<dyn Iterator<Item = Result<Event>>>,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording").field("header", &self.header).finish_non_exhaustive()
    }
}

/// Opens a recording from a buffered reader, probing the format from the
/// first line only: v2 header first, whole-object v1 next.
pub fn open(mut reader: Box<dyn BufRead>) -> Result<Recording> {
    let mut first_line = String::new();
    reader
        .read_line(&mut first_line)
        .context("failed to read recording")?;

    if let Ok(header) = serde_json::from_str::<Header>(first_line.trim_end()) {
        if header.version == 2 {
            return Ok(Recording {
                header,
                events: Box::new(V2Events {
                    reader,
                    done: false,
                }),
            });
        }
    }

    let mut rest = String::new();
    reader
        .read_to_string(&mut rest)
        .context("failed to read recording")?;
    first_line.push_str(&rest);

    let v1: V1File =
        serde_json::from_str(&first_line).map_err(|_| FormatError::UnknownFormat)?;
    if v1.version != 1 {
        return Err(FormatError::UnknownFormat.into());
    }

    Ok(v1.into_recording())
}

struct V2Events<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> Iterator for V2Events<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let line = line.trim_end_matches(['\n', '\r']);
                // a blank line marks logical end of stream
                if line.is_empty() {
                    self.done = true;
                    return None;
                }
                match parse_event_line(line) {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        self.done = true;
                        Some(Err(err.into()))
                    }
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}

/// v1 on-disk shape: a single JSON object with a `stdout` array of
/// `[delay, text]` pairs.
#[derive(Deserialize)]
struct V1File {
    version: u32,
    width: u16,
    height: u16,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    stdout: Vec<(f64, String)>,
}

impl V1File {
    fn into_recording(self) -> Recording {
        let header = Header {
            version: 2,
            width: self.width,
            height: self.height,
            duration: self.duration,
            command: self.command,
            title: self.title,
            env: self.env,
            ..Header::default()
        };

        let mut time = 0.0;
        let events = self.stdout.into_iter().map(move |(delay, text)| {
            time += delay;
            Ok(Event {
                time,
                kind: EventKind::Output,
                data: EventData::Text(text),
            })
        });

        Recording {
            header,
            events: Box::new(events),
        }
    }
}

/// Timestamp of the last output event, used as the time offset when
/// appending to an existing recording.
pub fn output_duration(reader: Box<dyn BufRead>) -> Result<f64> {
    let recording = open(reader)?;
    let mut last = 0.0;
    for event in recording.events {
        let event = event?;
        if event.kind == EventKind::Output {
            last = event.time;
        }
    }
    Ok(last)
}
