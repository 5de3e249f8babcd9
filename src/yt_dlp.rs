//! [`Extractor`] backed by the `yt-dlp` executable.
//!
//! Metadata comes from `--dump-single-json`; downloads stream a custom
//! `--progress-template` on stdout, one line per update thanks to
//! `--newline`, while stderr is collected on a side thread so the last error
//! line can be reported when the process fails.

use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
};

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{ExtractError, TransferError};
use crate::extract::{
    ExtractOptions, Extractor, ProgressHook, RawInfo, TransferEvent, TransferRequest,
};
use crate::text::strip_control;

const PROGRESS_PREFIX: &str = "unidown|";
const PROGRESS_TEMPLATE: &str = "download:unidown|%(progress.status)s|%(progress._percent_str)s|%(progress._total_bytes_str,progress._total_bytes_estimate_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress.filename)s";

/// Values yt-dlp substitutes for fields it does not know.
const UNKNOWN_MARKERS: [&str; 4] = ["", "NA", "N/A", "Unknown"];

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.yt_dlp_path)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs `<program> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
            }
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn network_args(
        command: &mut Command,
        proxy: Option<&str>,
        cookies_from_browser: Option<&str>,
    ) {
        if let Some(proxy) = proxy.filter(|value| !value.is_empty()) {
            command.arg("--proxy").arg(proxy);
        }
        if let Some(browser) = cookies_from_browser.filter(|value| !value.is_empty()) {
            command.arg("--cookies-from-browser").arg(browser);
        }
    }

    fn spawn_error(&self, source: std::io::Error) -> ExtractError {
        ExtractError::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }
}

impl Extractor for YtDlp {
    fn extract(&self, url: &str, options: &ExtractOptions) -> Result<RawInfo, ExtractError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--no-color");
        if options.flat {
            command.arg("--flat-playlist");
        }
        Self::network_args(
            &mut command,
            options.proxy.as_deref(),
            options.cookies_from_browser.as_deref(),
        );
        command.arg(url).stdin(Stdio::null());

        debug!(url, flat = options.flat, "extracting metadata");
        let output = command.output().map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Failed(last_error_line(&stderr, output.status)));
        }

        let info = serde_json::from_slice(&output.stdout)?;
        Ok(info)
    }

    fn download(
        &self,
        request: &TransferRequest,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), TransferError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--quiet")
            .arg("--progress")
            .arg("--no-warnings")
            .arg("--no-color")
            .arg("--encoding")
            .arg("utf-8")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--format")
            .arg(&request.format)
            .arg("--output")
            .arg(&request.output_template);
        Self::network_args(
            &mut command,
            request.proxy.as_deref(),
            request.cookies_from_browser.as_deref(),
        );
        command
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(url = %request.url, format = %request.format, "starting transfer");
        let mut child = command
            .spawn()
            .map_err(|err| TransferError::Failed(self.spawn_error(err).to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::Failed("failed to capture yt-dlp stdout".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::Failed("failed to capture yt-dlp stderr".to_owned()))?;
        let stderr_reader = spawn_stderr_collector(stderr);

        let mut cancelled = false;
        let mut reader = BufReader::new(stdout);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("reading yt-dlp output failed: {err}");
                    break;
                }
            }
            // File names may come back in the locale code page.
            let line = String::from_utf8_lossy(&raw);
            let Some(event) = parse_progress_line(&line) else {
                debug!(line = %line.trim_end(), "ignoring yt-dlp output");
                continue;
            };
            if hook(event).is_err() {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            if let Err(err) = child.kill() {
                debug!("yt-dlp already gone when cancelling: {err}");
            }
            if let Err(err) = child.wait() {
                debug!("failed to reap cancelled yt-dlp: {err}");
            }
            // The stderr thread finishes on its own once every holder of the
            // pipe (ffmpeg included) has exited.
            return Err(TransferError::Cancelled);
        }

        let status = child
            .wait()
            .map_err(|err| TransferError::Failed(format!("failed to wait for yt-dlp: {err}")))?;
        let stderr_text = stderr_reader.join().unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(TransferError::Failed(last_error_line(&stderr_text, status)))
        }
    }
}

fn spawn_stderr_collector<R>(reader: R) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buf) {
            debug!("reading yt-dlp stderr failed: {err}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Picks the most useful line of stderr: the last `ERROR:` line if any, else
/// the last non-empty one.
fn last_error_line(stderr: &str, status: ExitStatus) -> String {
    let lines: Vec<String> = stderr
        .lines()
        .map(strip_control)
        .filter(|line| !line.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| lines.last())
        .cloned()
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

fn known(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if UNKNOWN_MARKERS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Parses one line printed through [`PROGRESS_TEMPLATE`].
pub(crate) fn parse_progress_line(line: &str) -> Option<TransferEvent> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.splitn(6, '|');
    let status = fields.next()?.trim();
    let percent = fields.next().unwrap_or_default();
    let total = fields.next().unwrap_or_default();
    let speed = fields.next().unwrap_or_default();
    let eta = fields.next().unwrap_or_default();
    let filename = known(fields.next().unwrap_or_default()).map(PathBuf::from);

    match status {
        "downloading" => Some(TransferEvent::Progress {
            filename,
            percent: known(percent).unwrap_or_else(|| "?%".to_owned()),
            total: known(total),
            speed: known(speed).unwrap_or_else(|| "?".to_owned()),
            eta: known(eta).unwrap_or_else(|| "?".to_owned()),
        }),
        "finished" => Some(TransferEvent::FileFinished { filename }),
        _ => None,
    }
}
