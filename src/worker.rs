use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};

use crate::events::{Event, EventData, EventKind};
use crate::notifier::Notifier;
use crate::writer::{EventWriter, OnError};

/// Above this batch size the worker is falling behind the pty loop and
/// adjacent output events get coalesced instead of written one line each.
const COALESCE_BATCH: usize = 64;

/// Runs an [`EventWriter`] on its own thread so the pty select loop never
/// blocks on disk I/O.  Producer methods only enqueue.
///
/// The worker adds `time_offset` (non-zero when appending) to every event
/// before it reaches the writer.  After a write failure it keeps draining
/// the queue without writing, so producers never block on a dead sink; the
/// failure surfaces from [`AsyncWriter::finish`].
pub struct AsyncWriter {
    tx: Sender<Option<Event>>,
    handle: Option<JoinHandle<Result<()>>>,
    record_stdin: bool,
}

impl AsyncWriter {
    pub fn new(writer: Box<dyn EventWriter>, time_offset: f64, record_stdin: bool) -> Self {
        let (tx, rx) = channel();
        let handle = thread::spawn(move || run_writer(writer, &rx, time_offset));

        Self {
            tx,
            handle: Some(handle),
            record_stdin,
        }
    }

    pub fn write_stdout(&self, time: f64, data: Vec<u8>) {
        let _ = self.tx.send(Some(Event::output(time, data)));
    }

    pub fn write_stdin(&self, time: f64, data: Vec<u8>) {
        if self.record_stdin {
            let _ = self.tx.send(Some(Event::input(time, data)));
        }
    }

    pub fn write_resize(&self, time: f64, (cols, rows): (u16, u16)) {
        let _ = self.tx.send(Some(Event::resize(time, cols, rows)));
    }

    pub fn write_marker(&self, time: f64) {
        let _ = self.tx.send(Some(Event::marker(time)));
    }

    /// Stops the worker and reports any write failure it swallowed while
    /// the recording was running.
    pub fn finish(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = self.tx.send(None);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("writer task panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_writer(
    mut writer: Box<dyn EventWriter>,
    rx: &Receiver<Option<Event>>,
    time_offset: f64,
) -> Result<()> {
    let mut failure: Option<anyhow::Error> = None;

    'recv: while let Ok(message) = rx.recv() {
        let Some(first) = message else { break };

        let mut batch = vec![first];
        let mut stop = false;
        loop {
            match rx.try_recv() {
                Ok(Some(event)) => batch.push(event),
                Ok(None) => {
                    stop = true;
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        let batch = if batch.len() > COALESCE_BATCH {
            coalesce(batch)
        } else {
            batch
        };

        for event in batch {
            if failure.is_some() {
                continue;
            }
            if let Err(err) = dispatch(writer.as_mut(), time_offset, event) {
                failure = Some(err);
            }
        }

        if stop {
            break 'recv;
        }
    }

    failure.map_or(Ok(()), Err)
}

fn dispatch(writer: &mut dyn EventWriter, time_offset: f64, event: Event) -> Result<()> {
    let time = time_offset + event.time;
    match (event.kind, event.data) {
        (EventKind::Output, EventData::Bytes(bytes)) => writer.write_stdout(time, &bytes),
        (EventKind::Input, EventData::Bytes(bytes)) => writer.write_stdin(time, &bytes),
        (EventKind::Resize, EventData::Size(cols, rows)) => {
            writer.write_resize(time, (cols, rows))
        }
        (EventKind::Marker, _) => writer.write_marker(time),
        _ => Ok(()),
    }
}

/// Merges runs of adjacent output events, keeping the earliest timestamp.
fn coalesce(events: Vec<Event>) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());

    for event in events {
        if event.kind == EventKind::Output {
            if let Some(last) = out.last_mut() {
                if last.kind == EventKind::Output {
                    if let (EventData::Bytes(acc), EventData::Bytes(bytes)) =
                        (&mut last.data, &event.data)
                    {
                        acc.extend_from_slice(bytes);
                        continue;
                    }
                }
            }
        }
        out.push(event);
    }

    out
}

/// Dispatches notification texts on a separate thread; a slow or broken
/// notification backend must never stall the recording.
pub struct AsyncNotifier {
    tx: Sender<Option<String>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncNotifier {
    pub fn new(notifier: Notifier) -> Self {
        let (tx, rx) = channel::<Option<String>>();
        let handle = thread::spawn(move || {
            while let Ok(Some(text)) = rx.recv() {
                notifier.notify(&text);
            }
        });

        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn notify(&self, text: impl Into<String>) {
        let _ = self.tx.send(Some(text.into()));
    }

    /// Callback handed to the writer so sink trouble surfaces as a
    /// notification instead of terminal noise.
    pub fn on_error(&self) -> OnError {
        let tx = self.tx.clone();
        Box::new(move |text: &str| {
            let _ = tx.send(Some(text.to_string()));
        })
    }
}

impl Drop for AsyncNotifier {
    fn drop(&mut self) {
        let _ = self.tx.send(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
