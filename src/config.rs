use std::env;

use crate::player::PlayKeyBindings;
use crate::pty::KeyBindings;

/// Startup-time configuration problems; surfaced before any recording or
/// playback begins.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized key binding {0:?} (expected C-x, ^x, a single character, or none)")]
    BadKeyBinding(String),
}

/// Runtime settings the command-line front-end hands to the core: control
/// keys for recording and playback plus notification dispatch.  Values come
/// from built-in defaults overridden by `TTYCAST_*` environment variables.
pub struct Config {
    pub record_keys: KeyBindings,
    pub play_keys: PlayKeyBindings,
    pub notifications: bool,
    pub notify_command: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let record_keys = KeyBindings {
            prefix: key_from_env("TTYCAST_RECORD_PREFIX_KEY", None)?,
            pause: key_from_env("TTYCAST_RECORD_PAUSE_KEY", Some(vec![0x1c]))?,
            add_marker: key_from_env("TTYCAST_RECORD_ADD_MARKER_KEY", None)?,
        };

        let play_keys = PlayKeyBindings {
            pause: key_from_env("TTYCAST_PLAY_PAUSE_KEY", Some(b" ".to_vec()))?,
            step: key_from_env("TTYCAST_PLAY_STEP_KEY", Some(b".".to_vec()))?,
            next_marker: key_from_env("TTYCAST_PLAY_NEXT_MARKER_KEY", Some(b"]".to_vec()))?,
        };

        let notifications = env::var("TTYCAST_NOTIFICATIONS")
            .map(|value| !matches!(value.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        Ok(Self {
            record_keys,
            play_keys,
            notifications,
            notify_command: env::var("TTYCAST_NOTIFY_COMMAND").ok(),
        })
    }
}

fn key_from_env(var: &str, default: Option<Vec<u8>>) -> Result<Option<Vec<u8>>, ConfigError> {
    match env::var(var) {
        Ok(value) => parse_key(&value),
        Err(_) => Ok(default),
    }
}

/// Parses a key-binding string: `C-x` or `^x` for a control byte, a single
/// literal character for itself, `none` (or empty) to disable the binding.
pub fn parse_key(binding: &str) -> Result<Option<Vec<u8>>, ConfigError> {
    if binding.is_empty() || binding.eq_ignore_ascii_case("none") {
        return Ok(None);
    }

    let bad = || ConfigError::BadKeyBinding(binding.to_string());

    if let Some(rest) = binding.strip_prefix("C-").or_else(|| binding.strip_prefix('^')) {
        let mut chars = rest.chars();
        let key = chars.next().ok_or_else(bad)?;
        if chars.next().is_some() {
            return Err(bad());
        }

        let upper = key.to_ascii_uppercase() as u32;
        // control codes live at 0x00..0x1f, reachable from @A..Z[\]^_
        if !(0x40..=0x5f).contains(&upper) {
            return Err(bad());
        }
        return Ok(Some(vec![(upper - 0x40) as u8]));
    }

    let mut chars = binding.chars();
    let key = chars.next().ok_or_else(bad)?;
    if chars.next().is_some() {
        return Err(bad());
    }

    Ok(Some(key.to_string().into_bytes()))
}
