//! Glue between a front-end and the background work.
//!
//! One [`Controller`] serves one platform tab. It runs at most one analysis or
//! download at a time on its own thread and reports back through an event
//! channel the front-end drains with [`Controller::poll`] or
//! [`Controller::wait_event`].

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bilibili::{BilibiliApi, PartsProbe};
use crate::config::Settings;
use crate::error::{ControllerError, SelectionError};
use crate::executor::{
    CancelToken, DownloadSelection, RunOutcome, SelectedItem, execute, missing_items,
};
use crate::extract::Extractor;
use crate::formats::selection_expression;
use crate::normalize::{Platform, normalize};
use crate::resolver::{Resolver, VideoMetadata};
use crate::yt_dlp::YtDlp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Analyzing,
    AwaitingSelection,
    Downloading,
    Cancelling,
}

/// How the main action button should look in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlConfig {
    pub label: &'static str,
    pub enabled: bool,
}

impl TaskState {
    pub fn control(self) -> ControlConfig {
        let (label, enabled) = match self {
            TaskState::Idle => ("Analyze", true),
            TaskState::Analyzing => ("Cancel analysis", true),
            TaskState::AwaitingSelection => ("Choose format", false),
            TaskState::Downloading => ("Cancel download", true),
            TaskState::Cancelling => ("Cancelling...", false),
        };
        ControlConfig { label, enabled }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(String),
    Resolved(VideoMetadata),
    Completed(String),
    Cancelled,
    Error(String),
}

/// What the user picked after an analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    pub format_id: String,
    pub merge_audio: bool,
    /// Checked playlist indices (1-based). Ignored for single videos.
    pub entries: Vec<usize>,
}

pub struct Controller {
    platform: Platform,
    resolver: Resolver,
    extractor: Arc<dyn Extractor>,
    state: TaskState,
    metadata: Option<VideoMetadata>,
    last_selection: Option<DownloadSelection>,
    token: CancelToken,
    worker: Option<JoinHandle<()>>,
    events_tx: Sender<TaskEvent>,
    events_rx: Receiver<TaskEvent>,
}

impl Controller {
    pub fn new(platform: Platform, extractor: Arc<dyn Extractor>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            platform,
            resolver: Resolver::new(Arc::clone(&extractor)),
            extractor,
            state: TaskState::Idle,
            metadata: None,
            last_selection: None,
            token: CancelToken::new(),
            worker: None,
            events_tx,
            events_rx,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PartsProbe>) -> Self {
        self.resolver = self.resolver.with_probe(probe);
        self
    }

    /// yt-dlp from `settings`, plus the view API probe on the Bilibili tab.
    pub fn for_platform(platform: Platform, settings: &Settings) -> Self {
        let controller = Self::new(platform, Arc::new(YtDlp::from_settings(settings)));
        match platform {
            Platform::Bilibili => controller.with_probe(Arc::new(BilibiliApi::new())),
            Platform::YouTube => controller,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn metadata(&self) -> Option<&VideoMetadata> {
        self.metadata.as_ref()
    }

    pub fn last_selection(&self) -> Option<&DownloadSelection> {
        self.last_selection.as_ref()
    }

    /// Shared so a signal handler can request cancellation directly.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    fn worker_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn ensure_idle(&self) -> Result<(), ControllerError> {
        if self.worker_running() || self.state != TaskState::Idle {
            return Err(ControllerError::Busy);
        }
        Ok(())
    }

    /// Normalizes `raw_text` and resolves it in the background. Returns the
    /// URL that is being analyzed.
    pub fn analyze(
        &mut self,
        raw_text: &str,
        settings: Settings,
    ) -> Result<String, ControllerError> {
        self.ensure_idle()?;
        let url = normalize(raw_text, self.platform);
        self.token.reset();
        self.metadata = None;

        let resolver = self.resolver.clone();
        let token = self.token.clone();
        let tx = self.events_tx.clone();
        let task_url = url.clone();
        let handle = thread::Builder::new()
            .name("unidown-analyze".to_owned())
            .spawn(move || {
                send(&tx, TaskEvent::Progress(format!("Analyzing {task_url}")));
                let result = resolver.resolve(&task_url, &settings);
                let event = if token.is_cancelled() {
                    debug!(url = %task_url, "analysis finished after cancel, discarding");
                    TaskEvent::Cancelled
                } else {
                    match result {
                        Ok(metadata) => TaskEvent::Resolved(metadata),
                        Err(err) => TaskEvent::Error(err.message().to_owned()),
                    }
                };
                send(&tx, event);
            })
            .map_err(|err| ControllerError::Spawn(err.to_string()))?;

        self.worker = Some(handle);
        self.state = TaskState::Analyzing;
        info!(platform = %self.platform, url = %url, "analysis started");
        Ok(url)
    }

    /// Turns the user's choice into a download run.
    pub fn select(
        &mut self,
        request: &SelectionRequest,
        settings: Settings,
    ) -> Result<(), ControllerError> {
        if self.state != TaskState::AwaitingSelection {
            return Err(ControllerError::NotAwaitingSelection(
                "no analysis is waiting for a choice",
            ));
        }
        let metadata = self
            .metadata
            .as_ref()
            .ok_or(ControllerError::NotAwaitingSelection("analysis result is gone"))?;
        let selection = build_selection(metadata, request, &settings)?;

        self.metadata = None;
        self.start_download(selection, settings)
    }

    /// Downloads again whatever items of the last run have no file on disk.
    /// Returns how many items were started; zero means nothing was missing.
    pub fn retry_missing(&mut self, settings: Settings) -> Result<usize, ControllerError> {
        self.ensure_idle()?;
        let previous = self
            .last_selection
            .as_ref()
            .ok_or(ControllerError::NothingToRetry)?;
        let missing = missing_items(previous);
        if missing.is_empty() {
            return Ok(0);
        }
        let count = missing.len();
        let retry = previous.with_items(missing)?;
        self.start_download(retry, settings)?;
        Ok(count)
    }

    fn start_download(
        &mut self,
        selection: DownloadSelection,
        settings: Settings,
    ) -> Result<(), ControllerError> {
        self.token.reset();
        self.last_selection = Some(selection.clone());

        let extractor = Arc::clone(&self.extractor);
        let token = self.token.clone();
        let tx = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name("unidown-download".to_owned())
            .spawn(move || {
                let count = selection.items().len();
                let outcome = execute(
                    &selection,
                    &token,
                    extractor.as_ref(),
                    &settings,
                    &mut |event| send(&tx, TaskEvent::Progress(event.to_string())),
                );
                let event = match outcome {
                    RunOutcome::Completed(message) => TaskEvent::Completed(message),
                    RunOutcome::Cancelled => TaskEvent::Cancelled,
                    RunOutcome::PartialFailure(errors) => {
                        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
                        TaskEvent::Error(format!(
                            "{} of {count} items failed: {}",
                            errors.len(),
                            details.join("; ")
                        ))
                    }
                };
                send(&tx, event);
            })
            .map_err(|err| ControllerError::Spawn(err.to_string()))?;

        self.worker = Some(handle);
        self.state = TaskState::Downloading;
        info!(platform = %self.platform, "download started");
        Ok(())
    }

    /// The user closed the selection without picking anything.
    pub fn decline(&mut self) -> Result<(), ControllerError> {
        if self.state != TaskState::AwaitingSelection {
            return Err(ControllerError::NotAwaitingSelection(
                "no analysis is waiting for a choice",
            ));
        }
        self.metadata = None;
        self.state = TaskState::Idle;
        Ok(())
    }

    /// Requests cancellation of the running task. Returns whether there was
    /// one to cancel.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            TaskState::Analyzing | TaskState::Downloading => {
                self.token.cancel();
                self.state = TaskState::Cancelling;
                info!(platform = %self.platform, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Next pending event, without blocking.
    pub fn poll(&mut self) -> Option<TaskEvent> {
        match self.events_rx.try_recv() {
            Ok(event) => Some(self.apply(event)),
            Err(_) => self.reap_dead_worker(),
        }
    }

    /// Next event, waiting at most `timeout`.
    pub fn wait_event(&mut self, timeout: Duration) -> Option<TaskEvent> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Some(self.apply(event)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                self.reap_dead_worker()
            }
        }
    }

    fn apply(&mut self, event: TaskEvent) -> TaskEvent {
        match &event {
            TaskEvent::Resolved(metadata) => {
                self.metadata = Some(metadata.clone());
                self.state = TaskState::AwaitingSelection;
                self.join_worker();
            }
            TaskEvent::Completed(_) | TaskEvent::Cancelled | TaskEvent::Error(_) => {
                self.state = TaskState::Idle;
                self.join_worker();
            }
            TaskEvent::Progress(_) => {}
        }
        event
    }

    /// The terminal event is the last thing a worker sends, so this only
    /// waits for the thread to unwind.
    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            warn!("background task panicked");
        }
    }

    /// Called when the channel looked empty. A worker may still have sent its
    /// last event between that check and `is_finished`, so the channel is read
    /// again after the join. Only a busy state with nothing left to read means
    /// the worker died before reporting.
    fn reap_dead_worker(&mut self) -> Option<TaskEvent> {
        if self.worker_running() {
            return None;
        }
        self.join_worker();
        if let Ok(event) = self.events_rx.try_recv() {
            return Some(self.apply(event));
        }
        match self.state {
            TaskState::Analyzing | TaskState::Downloading | TaskState::Cancelling => {
                let event = TaskEvent::Error("background task stopped unexpectedly".to_owned());
                Some(self.apply(event))
            }
            _ => None,
        }
    }
}

fn send(tx: &Sender<TaskEvent>, event: TaskEvent) {
    if tx.send(event).is_err() {
        debug!("controller dropped, event discarded");
    }
}

/// Maps a [`SelectionRequest`] onto the analyzed metadata.
///
/// Playlist selections always use a height-capped expression because format
/// IDs are only known for the sampled first entry.
fn build_selection(
    metadata: &VideoMetadata,
    request: &SelectionRequest,
    settings: &Settings,
) -> Result<DownloadSelection, SelectionError> {
    let variant = metadata
        .format(&request.format_id)
        .ok_or_else(|| SelectionError::UnknownFormat(request.format_id.clone()))?;

    if !metadata.is_playlist {
        let format = selection_expression(variant, request.merge_audio, false);
        let item = SelectedItem {
            url: metadata.webpage_url.clone(),
            title: metadata.title.clone(),
            index: None,
        };
        return DownloadSelection::new(format, vec![item], &settings.download_dir, None);
    }

    let mut indices = request.entries.clone();
    indices.sort_unstable();
    indices.dedup();
    let items = indices
        .into_iter()
        .map(|index| {
            let entry = metadata
                .entry(index)
                .ok_or(SelectionError::UnknownEntry(index))?;
            Ok(SelectedItem {
                url: entry.url.clone(),
                title: entry.title.clone(),
                index: Some(entry.index),
            })
        })
        .collect::<Result<Vec<_>, SelectionError>>()?;

    let format = selection_expression(variant, request.merge_audio, true);
    DownloadSelection::new(
        format,
        items,
        &settings.download_dir,
        Some(&metadata.title),
    )
}
