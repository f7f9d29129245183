use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};

use anyhow::{Context, Result};

use crate::asciicast::{event_line, header_line, Header};

/// Callback used to report recoverable sink trouble without touching the
/// terminal from the writer task.
pub type OnError = Box<dyn Fn(&str) + Send>;

/// Serializes timestamped events into some on-disk representation.  All
/// implementations are owned by the async writer worker for the duration of
/// a recording.
pub trait EventWriter: Send {
    fn write_stdout(&mut self, time: f64, data: &[u8]) -> Result<()>;
    fn write_stdin(&mut self, time: f64, data: &[u8]) -> Result<()>;
    fn write_resize(&mut self, time: f64, size: (u16, u16)) -> Result<()>;
    fn write_marker(&mut self, time: f64) -> Result<()>;
}

/// Incremental UTF-8 decoder with the replacement policy: bytes split
/// mid-sequence are held until the sequence completes, invalid sequences
/// become U+FFFD.
#[derive(Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);

        let mut out = String::new();
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[consumed..consumed + valid_up_to])
                            .expect("validated prefix"),
                    );
                    consumed += valid_up_to;

                    match err.error_len() {
                        Some(invalid_len) => {
                            out.push('\u{FFFD}');
                            consumed += invalid_len;
                        }
                        // incomplete sequence at the end, keep it for the
                        // next chunk
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }
}

enum SinkHandle {
    File(File),
    Stdout(io::Stdout),
}

impl SinkHandle {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::File(file) => file.write_all(data),
            Self::Stdout(stdout) => {
                stdout.write_all(data)?;
                stdout.flush()
            }
        }
    }
}

/// Append-aware sink for a regular file, FIFO, or stdout (`"-"`), with
/// broken-pipe recovery for FIFO targets.
struct FileSink {
    path: String,
    append: bool,
    handle: SinkHandle,
    on_error: OnError,
}

impl FileSink {
    /// Opens the sink.  The second return value tells the caller whether the
    /// target starts out fresh and needs a header; append against an empty
    /// or missing file is downgraded so the header is written exactly once.
    fn open(path: &str, append: bool, on_error: OnError) -> Result<(Self, bool)> {
        let append =
            append && std::fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false);

        let handle = Self::open_handle(path, append)?;

        Ok((
            Self {
                path: path.to_string(),
                append,
                handle,
                on_error,
            },
            !append,
        ))
    }

    fn open_handle(path: &str, append: bool) -> Result<SinkHandle> {
        if path == "-" {
            return Ok(SinkHandle::Stdout(io::stdout()));
        }

        let file = if append {
            OpenOptions::new().append(true).open(path)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        }
        .with_context(|| format!("failed to open {path}"))?;

        Ok(SinkHandle::File(file))
    }

    fn is_fifo(&self) -> bool {
        self.path != "-"
            && nix::sys::stat::stat(self.path.as_str())
                .map(|st| (st.st_mode & libc::S_IFMT) == libc::S_IFIFO)
                .unwrap_or(false)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.handle.write_all(data) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::BrokenPipe && self.is_fifo() => {
                (self.on_error)("Broken pipe, reopening...");
                self.handle = Self::open_handle(&self.path, self.append)?;
                (self.on_error)("Output pipe reopened successfully");
                self.handle
                    .write_all(data)
                    .with_context(|| format!("failed to write to {}", self.path))
            }
            Err(err) => {
                (self.on_error)(&format!("write failed: {err}"));
                Err(err).with_context(|| format!("failed to write to {}", self.path))
            }
        }
    }
}

/// v2 writer: header line followed by one JSON array per event, with
/// per-stream incremental UTF-8 decoding of the byte payloads.
pub struct CastWriter {
    sink: FileSink,
    stdout_decoder: Utf8Decoder,
    stdin_decoder: Utf8Decoder,
}

impl CastWriter {
    pub fn create(path: &str, header: &Header, append: bool, on_error: OnError) -> Result<Self> {
        let (mut sink, fresh) = FileSink::open(path, append, on_error)?;

        if fresh {
            let mut line = header_line(header)?;
            line.push('\n');
            sink.write(line.as_bytes())?;
        }

        Ok(Self {
            sink,
            stdout_decoder: Utf8Decoder::default(),
            stdin_decoder: Utf8Decoder::default(),
        })
    }

    fn write_line(&mut self, time: f64, code: &str, payload: &str) -> Result<()> {
        let mut line = event_line(time, code, payload)?;
        line.push('\n');
        self.sink.write(line.as_bytes())
    }
}

impl EventWriter for CastWriter {
    fn write_stdout(&mut self, time: f64, data: &[u8]) -> Result<()> {
        let text = self.stdout_decoder.decode(data);
        if text.is_empty() {
            return Ok(());
        }
        self.write_line(time, "o", &text)
    }

    fn write_stdin(&mut self, time: f64, data: &[u8]) -> Result<()> {
        let text = self.stdin_decoder.decode(data);
        if text.is_empty() {
            return Ok(());
        }
        self.write_line(time, "i", &text)
    }

    fn write_resize(&mut self, time: f64, (cols, rows): (u16, u16)) -> Result<()> {
        self.write_line(time, "r", &format!("{cols}x{rows}"))
    }

    fn write_marker(&mut self, time: f64) -> Result<()> {
        self.write_line(time, "m", "")
    }
}

/// Raw writer: the child's byte stream verbatim, prefixed and punctuated by
/// `ESC[8;<rows>;<cols>t` size escapes.  No prelude on append.
pub struct RawWriter {
    sink: FileSink,
}

impl RawWriter {
    pub fn create(path: &str, header: &Header, append: bool, on_error: OnError) -> Result<Self> {
        let (mut sink, fresh) = FileSink::open(path, append, on_error)?;

        if fresh {
            sink.write(size_escape(header.width, header.height).as_bytes())?;
        }

        Ok(Self { sink })
    }
}

fn size_escape(cols: u16, rows: u16) -> String {
    format!("\x1b[8;{rows};{cols}t")
}

impl EventWriter for RawWriter {
    fn write_stdout(&mut self, _time: f64, data: &[u8]) -> Result<()> {
        self.sink.write(data)
    }

    fn write_stdin(&mut self, _time: f64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn write_resize(&mut self, _time: f64, (cols, rows): (u16, u16)) -> Result<()> {
        self.sink.write(size_escape(cols, rows).as_bytes())
    }

    fn write_marker(&mut self, _time: f64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_on_error() -> OnError {
        Box::new(|_| {})
    }

    fn cast_writer(path: &std::path::Path, append: bool) -> CastWriter {
        CastWriter::create(
            path.to_str().unwrap(),
            &Header::new(80, 24),
            append,
            noop_on_error(),
        )
        .unwrap()
    }

    #[test]
    fn writes_header_and_reassembled_utf8_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.cast");

        {
            let mut writer = cast_writer(&path, false);
            writer.write_stdout(1.0, b"x").unwrap();
            writer
                .write_stdout(2.0, &[0x78, 0xC5, 0xBC, 0xC3, 0xB3, 0xC5])
                .unwrap();
            writer.write_stdout(3.0, &[0x82, 0xC4, 0x87]).unwrap();
            writer.write_stdout(4.0, b"xx").unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "{\"version\": 2, \"width\": 80, \"height\": 24}\n\
             [1, \"o\", \"x\"]\n\
             [2, \"o\", \"xżó\"]\n\
             [3, \"o\", \"łć\"]\n\
             [4, \"o\", \"xx\"]\n"
        );
    }

    #[test]
    fn resize_and_marker_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.cast");

        {
            let mut writer = cast_writer(&path, false);
            writer.write_resize(1.5, (100, 40)).unwrap();
            writer.write_marker(2.0).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[1.5, \"r\", \"100x40\"]\n"));
        assert!(content.contains("[2, \"m\", \"\"]\n"));
    }

    #[test]
    fn append_to_non_empty_file_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.cast");

        {
            let mut writer = cast_writer(&path, false);
            writer.write_stdout(1.0, b"a").unwrap();
        }
        {
            let mut writer = cast_writer(&path, true);
            writer.write_stdout(2.0, b"b").unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("\"version\"").count(), 1);
        assert!(content.ends_with("[1, \"o\", \"a\"]\n[2, \"o\", \"b\"]\n"));
    }

    #[test]
    fn append_to_empty_file_downgrades_to_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.cast");
        std::fs::write(&path, b"").unwrap();

        {
            let mut writer = cast_writer(&path, true);
            writer.write_stdout(1.0, b"a").unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("{\"version\": 2"));
    }

    #[test]
    fn decoder_reassembly_matches_whole_input_decode() {
        let text = "płyta ścienna żółć €";
        let bytes = text.as_bytes();

        for chunk_len in 1..=5 {
            let mut decoder = Utf8Decoder::default();
            let mut out = String::new();
            for chunk in bytes.chunks(chunk_len) {
                out.push_str(&decoder.decode(chunk));
            }
            assert_eq!(out, text);
        }
    }

    #[test]
    fn decoder_replaces_invalid_sequences() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0x61, 0xFF, 0x62]), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_holds_incomplete_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xC5]), "");
        assert_eq!(decoder.decode(&[0xBC]), "ż");
    }

    #[test]
    fn raw_writer_emits_size_prelude() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.raw");

        {
            let mut writer = RawWriter::create(
                path.to_str().unwrap(),
                &Header::new(80, 24),
                false,
                noop_on_error(),
            )
            .unwrap();
            writer.write_stdout(0.1, b"hello").unwrap();
            writer.write_stdin(0.2, b"ignored").unwrap();
            writer.write_resize(0.3, (90, 30)).unwrap();
        }

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, b"\x1b[8;24;80thello\x1b[8;30;90t");
    }

    #[test]
    fn raw_append_skips_prelude() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.raw");
        std::fs::write(&path, b"existing").unwrap();

        {
            let mut writer = RawWriter::create(
                path.to_str().unwrap(),
                &Header::new(80, 24),
                true,
                noop_on_error(),
            )
            .unwrap();
            writer.write_stdout(0.1, b"-more").unwrap();
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"existing-more");
    }
}
