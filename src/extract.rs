//! Boundary with the external extraction tool.
//!
//! The resolver and the executor only talk to an [`Extractor`]; the real one
//! shells out to yt-dlp (see [`crate::yt_dlp`]) and tests plug in fakes.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::Settings;
use crate::error::{Cancelled, ExtractError, TransferError};
use crate::formats::RawFormat;

/// Knobs for a metadata-only call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Only list playlist entries instead of resolving each one.
    pub flat: bool,
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
}

impl ExtractOptions {
    pub fn from_settings(settings: &Settings, flat: bool) -> Self {
        Self {
            flat,
            proxy: settings.proxy.clone(),
            cookies_from_browser: settings.cookies_from_browser.clone(),
        }
    }
}

/// A single blocking download handed to the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub format: String,
    /// Output template containing `%(ext)s`.
    pub output_template: PathBuf,
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
}

/// Raw progress as reported by the tool, before any presentation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        /// File currently being written (the final name, without `.part`).
        filename: Option<PathBuf>,
        percent: String,
        total: Option<String>,
        speed: String,
        eta: String,
    },
    /// One underlying file (video stream, audio stream, or muxed) is done.
    FileFinished { filename: Option<PathBuf> },
}

/// Called for every [`TransferEvent`]; returning `Err(Cancelled)` aborts the
/// transfer in flight.
pub type ProgressHook<'a> = dyn FnMut(TransferEvent) -> Result<(), Cancelled> + 'a;

/// The operations the core needs from a video extraction tool.
pub trait Extractor: Send + Sync {
    /// Fetches metadata for `url` without downloading media.
    fn extract(&self, url: &str, options: &ExtractOptions) -> Result<RawInfo, ExtractError>;

    /// Downloads one item, blocking until it finishes, fails, or the hook
    /// returns `Err(Cancelled)`.
    fn download(
        &self,
        request: &TransferRequest,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), TransferError>;
}

/// Subset of yt-dlp's `--dump-single-json` payload the resolver reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub webpage_url: Option<String>,
    pub original_url: Option<String>,
    #[serde(rename = "_type")]
    pub kind: Option<String>,
    pub extractor_key: Option<String>,
    pub entries: Option<Vec<RawEntry>>,
    pub formats: Option<Vec<RawFormat>>,
}

impl RawInfo {
    pub fn entries(&self) -> &[RawEntry] {
        self.entries.as_deref().unwrap_or(&[])
    }

    pub fn formats(&self) -> &[RawFormat] {
        self.formats.as_deref().unwrap_or(&[])
    }

    pub fn has_formats(&self) -> bool {
        !self.formats().is_empty()
    }
}

/// Child entry of a playlist. In flat mode only identification fields are
/// present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
}

/// Seconds as reported by the tool, rounded and clamped to a sane integer.
pub fn whole_seconds(value: Option<f64>) -> Option<u64> {
    value
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.round() as u64)
}

/// Expands `<dir>/<stem>.%(ext)s` the way the executor names files.
pub fn output_template(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.%(ext)s"))
}
