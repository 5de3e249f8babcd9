//! Sequential download runs with cooperative cancellation.
//!
//! Items are handed to the [`Extractor`] one after another. A failing item is
//! recorded and the run moves on; a cancellation stops everything and removes
//! whatever was half-written.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Cancelled, SelectionError, TransferError};
use crate::extract::{Extractor, TransferEvent, TransferRequest, output_template};
use crate::text::{escape_template, sanitize_filename, strip_control};

/// Extensions of finished media files. Used to tell completed items apart
/// from leftovers.
const MEDIA_EXTENSIONS: [&str; 12] = [
    "mp4", "mkv", "webm", "flv", "mov", "avi", "ts", "m4a", "mp3", "opus", "ogg", "aac",
];

/// Suffixes yt-dlp appends to files it is still writing.
const TEMP_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    current_file: Mutex<Option<PathBuf>>,
}

/// Shared between the controller and a running task: the cancellation flag
/// plus the file the transfer is writing right now.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the flag and the tracked file before a new task.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
        *self.inner.current_file.lock() = None;
    }

    pub fn set_current_file(&self, path: Option<PathBuf>) {
        *self.inner.current_file.lock() = path;
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.inner.current_file.lock().clone()
    }

    fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }
}

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    /// File stem on disk, already sanitized.
    pub title: String,
    pub output_template: PathBuf,
}

/// Input for [`DownloadSelection::new`]. `index` is the 1-based playlist
/// position and turns the title into `[P01] title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedItem {
    pub url: String,
    pub title: String,
    pub index: Option<usize>,
}

/// What a run downloads and where. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSelection {
    format: String,
    items: Vec<DownloadItem>,
    destination: PathBuf,
}

impl DownloadSelection {
    /// Builds the run's item list. More than one item with a `playlist_title`
    /// lands in a subdirectory named after it, created here; if that fails the
    /// base directory is used instead.
    pub fn new(
        format: impl Into<String>,
        items: Vec<SelectedItem>,
        base_dir: &Path,
        playlist_title: Option<&str>,
    ) -> Result<Self, SelectionError> {
        if items.is_empty() {
            return Err(SelectionError::Empty);
        }

        let destination = match playlist_title {
            Some(title) if items.len() > 1 => playlist_directory(base_dir, title),
            _ => base_dir.to_path_buf(),
        };

        let items = items
            .into_iter()
            .map(|item| {
                let display = match item.index {
                    Some(index) => format!("[P{index:02}] {}", item.title),
                    None => item.title,
                };
                let title = sanitize_filename(&display);
                DownloadItem {
                    output_template: output_template(&destination, &escape_template(&title)),
                    url: item.url,
                    title,
                }
            })
            .collect();

        Ok(Self {
            format: format.into(),
            items,
            destination,
        })
    }

    /// Same format and destination with a different item list, used to retry
    /// what did not arrive.
    pub fn with_items(&self, items: Vec<DownloadItem>) -> Result<Self, SelectionError> {
        if items.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(Self {
            format: self.format.clone(),
            items,
            destination: self.destination.clone(),
        })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn items(&self) -> &[DownloadItem] {
        &self.items
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn is_batch(&self) -> bool {
        self.items.len() > 1
    }
}

fn playlist_directory(base_dir: &Path, title: &str) -> PathBuf {
    let dir = base_dir.join(sanitize_filename(title));
    match fs::create_dir_all(&dir) {
        Ok(()) => dir,
        Err(err) => {
            warn!(
                "could not create {}, downloading into {} instead: {err}",
                dir.display(),
                base_dir.display()
            );
            base_dir.to_path_buf()
        }
    }
}

/// A single item that failed without stopping the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// 1-based position in the run.
    pub position: usize,
    pub title: String,
    pub message: String,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item {} ({}) failed: {}", self.position, self.title, self.message)
    }
}

/// Things worth telling the user while a run is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started {
        position: usize,
        count: usize,
        title: String,
    },
    Progress {
        position: usize,
        count: usize,
        percent: String,
        total: String,
        speed: String,
        eta: String,
    },
    Finalizing {
        position: usize,
        count: usize,
    },
    ItemFailed(ItemError),
}

fn prefix(position: usize, count: usize) -> String {
    if count > 1 { format!("[{position}/{count}] ") } else { String::new() }
}

impl fmt::Display for DownloadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadEvent::Started {
                position,
                count,
                title,
            } => write!(f, "{}Downloading {title}", prefix(*position, *count)),
            DownloadEvent::Progress {
                position,
                count,
                percent,
                total,
                speed,
                eta,
            } => write!(
                f,
                "{}{percent} of {total} at {speed}, ETA {eta}",
                prefix(*position, *count)
            ),
            DownloadEvent::Finalizing { position, count } => {
                write!(f, "{}Finalizing...", prefix(*position, *count))
            }
            DownloadEvent::ItemFailed(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(String),
    Cancelled,
    PartialFailure(Vec<ItemError>),
}

/// Downloads every item of `selection` in order.
///
/// The token is checked before each item and on every progress report. When
/// it fires, the in-flight transfer is torn down, the file it was writing is
/// removed together with its temp siblings and nothing after it is attempted.
pub fn execute(
    selection: &DownloadSelection,
    token: &CancelToken,
    extractor: &dyn Extractor,
    settings: &Settings,
    sink: &mut dyn FnMut(DownloadEvent),
) -> RunOutcome {
    let count = selection.items.len();
    let mut errors = Vec::new();

    for (offset, item) in selection.items.iter().enumerate() {
        let position = offset + 1;
        if token.is_cancelled() {
            info!(position, "cancelled before item started");
            return RunOutcome::Cancelled;
        }

        token.set_current_file(None);
        sink(DownloadEvent::Started {
            position,
            count,
            title: item.title.clone(),
        });

        let request = TransferRequest {
            url: item.url.clone(),
            format: selection.format.clone(),
            output_template: item.output_template.clone(),
            proxy: settings.proxy.clone(),
            cookies_from_browser: settings.cookies_from_browser.clone(),
        };

        let mut hook = |event: TransferEvent| -> Result<(), Cancelled> {
            token.check()?;
            match event {
                TransferEvent::Progress {
                    filename,
                    percent,
                    total,
                    speed,
                    eta,
                } => {
                    if filename.is_some() {
                        token.set_current_file(filename);
                    }
                    sink(DownloadEvent::Progress {
                        position,
                        count,
                        percent: strip_control(&percent),
                        total: total
                            .map(|total| strip_control(&total))
                            .filter(|total| !total.is_empty())
                            .unwrap_or_else(|| "unknown".to_owned()),
                        speed: strip_control(&speed),
                        eta: strip_control(&eta),
                    });
                }
                TransferEvent::FileFinished { filename } => {
                    if filename.is_some() {
                        token.set_current_file(filename);
                    }
                    sink(DownloadEvent::Finalizing { position, count });
                }
            }
            Ok(())
        };

        match extractor.download(&request, &mut hook) {
            Ok(()) => {
                info!(position, title = %item.title, "item downloaded");
                token.set_current_file(None);
            }
            Err(TransferError::Cancelled) => {
                info!(position, title = %item.title, "transfer cancelled");
                if let Some(path) = token.current_file() {
                    remove_partial_files(&path);
                }
                return RunOutcome::Cancelled;
            }
            // Ctrl+C reaches the child too, so it may exit with an error
            // before the hook sees the flag.
            Err(TransferError::Failed(message)) if token.is_cancelled() => {
                debug!(position, "transfer failed after cancel: {message}");
                if let Some(path) = token.current_file() {
                    remove_partial_files(&path);
                }
                return RunOutcome::Cancelled;
            }
            Err(TransferError::Failed(message)) => {
                let err = ItemError {
                    position,
                    title: item.title.clone(),
                    message: strip_control(&message),
                };
                warn!("{err}");
                sink(DownloadEvent::ItemFailed(err.clone()));
                errors.push(err);
            }
        }
    }

    // A cancel that arrived after the last transfer finished leaves complete
    // files behind; there is nothing partial to remove.
    if token.is_cancelled() {
        return RunOutcome::Cancelled;
    }

    if !errors.is_empty() {
        return RunOutcome::PartialFailure(errors);
    }

    let message = if selection.is_batch() {
        format!(
            "Downloaded {count} items to {}",
            selection.destination.display()
        )
    } else {
        format!(
            "Downloaded {} to {}",
            selection.items[0].title,
            selection.destination.display()
        )
    };
    RunOutcome::Completed(message)
}

/// Best-effort removal of `path` and the temp files yt-dlp keeps next to it.
pub fn remove_partial_files(path: &Path) {
    let base = match path.to_str().and_then(|p| p.strip_suffix(".part")) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    };

    let mut candidates = vec![base.clone()];
    for suffix in TEMP_SUFFIXES {
        let mut name = base.clone().into_os_string();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }

    if let (Some(parent), Some(file_name)) = (base.parent(), base.file_name()) {
        let fragment_prefix = format!("{}.part-Frag", file_name.to_string_lossy());
        match fs::read_dir(parent) {
            Ok(entries) => candidates.extend(
                entries
                    .flatten()
                    .filter(|entry| {
                        entry
                            .file_name()
                            .to_string_lossy()
                            .starts_with(&fragment_prefix)
                    })
                    .map(|entry| entry.path()),
            ),
            Err(err) => debug!("could not scan {} for fragments: {err}", parent.display()),
        }
    }

    for candidate in candidates {
        match fs::remove_file(&candidate) {
            Ok(()) => debug!("removed {}", candidate.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove {}: {err}", candidate.display()),
        }
    }
}

/// Items of `selection` with no finished media file in the destination.
/// Only checks presence, not integrity.
pub fn missing_items(selection: &DownloadSelection) -> Vec<DownloadItem> {
    let present: Vec<String> = match fs::read_dir(&selection.destination) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(err) => {
            debug!(
                "could not list {}: {err}",
                selection.destination.display()
            );
            Vec::new()
        }
    };

    selection
        .items
        .iter()
        .filter(|item| {
            !present.iter().any(|name| {
                name.strip_prefix(item.title.as_str())
                    .and_then(|rest| rest.strip_prefix('.'))
                    .is_some_and(|ext| {
                        MEDIA_EXTENSIONS
                            .iter()
                            .any(|media| ext.eq_ignore_ascii_case(media))
                    })
            })
        })
        .cloned()
        .collect()
}
