//! Helpers for echoing device lines to a log sink or terminal.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Filter non-printable control characters for cleaner monitor output.
///
/// Keeps `\n`, `\t` and printable Unicode chars.
/// Converts carriage returns (`\r`, `\r\n`) to newlines.
/// Drops other control characters.
pub fn clean_monitor_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text
        .chars()
        .peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            },
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// A single transport line made printable.
///
/// The line transport strips the `\r\n` delimiter, but a line can still
/// end in `\r` when the device writes `\r\r\n`. That `\r` is dropped and
/// any other line break inside the line becomes a space.
pub fn clean_line(line: &str) -> String {
    let line = line
        .strip_suffix('\r')
        .unwrap_or(line);
    clean_monitor_text(line)
        .replace('\n', " ")
}

/// Wall-clock time of day as `HH:MM:SS.mmm` (UTC).
pub fn format_timestamp(since_epoch: Duration) -> String {
    let total_secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();
    let hours = (total_secs / 3600) % 24;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Current time since the Unix epoch.
pub fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Format one line for display, with an optional dimmed timestamp prefix.
pub fn format_line(line: &str, timestamp: Option<Duration>) -> String {
    let text = clean_line(line);
    let Some(at) = timestamp else {
        return text;
    };

    let mut out = String::with_capacity(text.len() + 24);
    let _ = write!(out, "\x1b[90m[{}]\x1b[0m {text}", format_timestamp(at));
    out
}
