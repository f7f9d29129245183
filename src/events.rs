use std::borrow::Cow;

use anyhow::Result;

/// A single timestamped record of a recording.
///
/// `time` is seconds relative to the start of the recording, except inside
/// the relative-time transforms below where it temporarily holds the delay
/// since the previous event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: f64,
    pub kind: EventKind,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Child output as seen on the pty master.
    Output,
    /// User keystrokes, post key-binding processing.
    Input,
    /// Terminal geometry change.
    Resize,
    /// User-inserted point of interest.
    Marker,
    /// Reserved kinds pass through copy and transform utilities unchanged.
    Other(String),
}

impl EventKind {
    pub fn code(&self) -> &str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
            Self::Marker => "m",
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "o" => Self::Output,
            "i" => Self::Input,
            "r" => Self::Resize,
            "m" => Self::Marker,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Typed payload; the wire form is always a string, materialized at writer
/// ingress and player egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    Bytes(Vec<u8>),
    Text(String),
    Size(u16, u16),
    Unit,
}

impl Event {
    pub const fn output(time: f64, data: Vec<u8>) -> Self {
        Self {
            time,
            kind: EventKind::Output,
            data: EventData::Bytes(data),
        }
    }

    pub const fn input(time: f64, data: Vec<u8>) -> Self {
        Self {
            time,
            kind: EventKind::Input,
            data: EventData::Bytes(data),
        }
    }

    pub const fn resize(time: f64, cols: u16, rows: u16) -> Self {
        Self {
            time,
            kind: EventKind::Resize,
            data: EventData::Size(cols, rows),
        }
    }

    pub const fn marker(time: f64) -> Self {
        Self {
            time,
            kind: EventKind::Marker,
            data: EventData::Unit,
        }
    }

    /// The payload in its on-wire string form.
    pub fn payload(&self) -> Cow<'_, str> {
        match &self.data {
            EventData::Text(text) => Cow::Borrowed(text),
            EventData::Bytes(bytes) => String::from_utf8_lossy(bytes),
            EventData::Size(cols, rows) => Cow::Owned(format!("{cols}x{rows}")),
            EventData::Unit => Cow::Borrowed(""),
        }
    }
}

/// Replaces each absolute timestamp with the delay since the previous event.
pub fn to_relative_time<I>(events: I) -> impl Iterator<Item = Result<Event>>
where
    I: Iterator<Item = Result<Event>>,
{
    let mut prev_time = 0.0;
    events.map(move |event| {
        event.map(|mut ev| {
            let delay = ev.time - prev_time;
            prev_time = ev.time;
            ev.time = delay;
            ev
        })
    })
}

/// Inverse of [`to_relative_time`]: running sum over delays.
pub fn to_absolute_time<I>(events: I) -> impl Iterator<Item = Result<Event>>
where
    I: Iterator<Item = Result<Event>>,
{
    let mut time = 0.0;
    events.map(move |event| {
        event.map(|mut ev| {
            time += ev.time;
            ev.time = time;
            ev
        })
    })
}

/// Caps per-event delays at `limit` seconds.  A `None` or non-positive limit
/// passes the stream through unchanged.
pub fn cap_relative_time<I>(events: I, limit: Option<f64>) -> impl Iterator<Item = Result<Event>>
where
    I: Iterator<Item = Result<Event>>,
{
    let cap = limit.filter(|limit| *limit > 0.0);
    events.map(move |event| {
        event.map(|mut ev| {
            if let Some(limit) = cap {
                ev.time = ev.time.min(limit);
            }
            ev
        })
    })
}

/// Divides every delay by `factor` (> 0).
pub fn adjust_speed<I>(events: I, factor: f64) -> impl Iterator<Item = Result<Event>>
where
    I: Iterator<Item = Result<Event>>,
{
    events.map(move |event| {
        event.map(|mut ev| {
            ev.time /= factor;
            ev
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(times: &[f64]) -> impl Iterator<Item = Result<Event>> {
        times
            .iter()
            .map(|&t| Ok(Event::output(t, b"x".to_vec())))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn times<I: Iterator<Item = Result<Event>>>(events: I) -> Vec<f64> {
        events.map(|ev| ev.unwrap().time).collect()
    }

    #[test]
    fn relative_absolute_round_trip_is_identity() {
        let input = [0.5, 1.25, 1.25, 4.0];
        let out = times(to_absolute_time(to_relative_time(stream(&input))));
        for (a, b) in input.iter().zip(out) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn cap_limits_only_excessive_delays() {
        let capped = times(cap_relative_time(stream(&[0.3, 5.0, 0.7]), Some(1.0)));
        assert_eq!(capped, vec![0.3, 1.0, 0.7]);
    }

    #[test]
    fn cap_without_limit_is_identity() {
        let out = times(cap_relative_time(stream(&[0.3, 5.0]), None));
        assert_eq!(out, vec![0.3, 5.0]);
    }

    #[test]
    fn unit_speed_is_identity() {
        let out = times(adjust_speed(stream(&[0.5, 2.0]), 1.0));
        assert_eq!(out, vec![0.5, 2.0]);
    }

    #[test]
    fn speed_adjustments_compose_multiplicatively() {
        let twice = times(adjust_speed(adjust_speed(stream(&[3.0, 6.0]), 2.0), 3.0));
        let once = times(adjust_speed(stream(&[3.0, 6.0]), 6.0));
        for (a, b) in twice.iter().zip(once) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn reserved_kinds_survive_transforms() {
        let events = vec![Ok(Event {
            time: 1.0,
            kind: EventKind::Other("x".to_string()),
            data: EventData::Text("payload".to_string()),
        })];
        let out: Vec<_> = to_relative_time(events.into_iter())
            .map(Result::unwrap)
            .collect();
        assert_eq!(out[0].kind, EventKind::Other("x".to_string()));
        assert_eq!(out[0].data, EventData::Text("payload".to_string()));
    }

    #[test]
    fn resize_payload_renders_cols_by_rows() {
        assert_eq!(Event::resize(0.0, 120, 40).payload(), "120x40");
    }
}
