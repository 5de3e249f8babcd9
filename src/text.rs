//! Small string helpers shared by the resolver and the executor.

use std::sync::LazyLock;

use regex::Regex;

/// CSI/OSC escape sequences emitted by yt-dlp when it thinks it talks to a
/// terminal.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
        .expect("escape pattern is valid")
});

/// Characters that cannot appear in a file name on at least one of the
/// platforms we write to.
const UNSAFE_FILENAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Longest file stem in bytes. Leaves room for `.f137.mp4.part` under the
/// 255-byte name limit most filesystems enforce.
const MAX_FILENAME_BYTES: usize = 200;

/// Removes terminal escape sequences and any remaining control characters,
/// then trims the result.
pub fn strip_control(input: &str) -> String {
    let without_escapes = ANSI_ESCAPE.replace_all(input, "");
    without_escapes
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_owned()
}

/// Replaces filesystem-unsafe characters with `_` and trims dots/whitespace
/// from both ends. Never returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if UNSAFE_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = sanitized.trim().trim_matches('.').trim();
    let mut result = String::with_capacity(trimmed.len().min(MAX_FILENAME_BYTES));
    for c in trimmed.chars() {
        if result.len() + c.len_utf8() > MAX_FILENAME_BYTES {
            break;
        }
        result.push(c);
    }
    if result.is_empty() {
        result.push_str("untitled");
    }
    result
}

/// Escapes `%` so a literal title survives yt-dlp's output template engine.
pub fn escape_template(value: &str) -> String {
    value.replace('%', "%%")
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Human readable byte count using binary units, matching yt-dlp's style.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}
