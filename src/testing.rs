//! Fakes shared by the unit tests of the resolver, executor and controller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::{fs, thread, time::Duration};

use parking_lot::Mutex;

use crate::bilibili::{PartsProbe, WorkParts};
use crate::error::{ExtractError, ProbeError, TransferError};
use crate::extract::{
    ExtractOptions, Extractor, ProgressHook, RawEntry, RawInfo, TransferEvent, TransferRequest,
};
use crate::formats::RawFormat;

/// One scripted action of a fake transfer. Suffixes are appended to the output
/// template with its `.%(ext)s` placeholder removed.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Creates a file on disk.
    Write(&'static str),
    /// Reports progress for a file.
    Progress(&'static str),
    /// Reports a finished file.
    Finish(&'static str),
    Sleep(u64),
    Fail(&'static str),
}

#[derive(Default)]
pub(crate) struct FakeExtractor {
    infos: HashMap<(String, bool), Result<RawInfo, String>>,
    scripts: HashMap<String, Vec<Step>>,
    extract_delay: Option<Duration>,
    extract_calls: Mutex<Vec<(String, bool)>>,
    downloads: Mutex<Vec<TransferRequest>>,
}

impl FakeExtractor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_info(mut self, url: &str, flat: bool, info: RawInfo) -> Self {
        self.infos.insert((url.to_owned(), flat), Ok(info));
        self
    }

    pub(crate) fn with_failure(mut self, url: &str, flat: bool, message: &str) -> Self {
        self.infos
            .insert((url.to_owned(), flat), Err(message.to_owned()));
        self
    }

    pub(crate) fn with_script(mut self, url: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(url.to_owned(), steps);
        self
    }

    pub(crate) fn with_extract_delay(mut self, delay: Duration) -> Self {
        self.extract_delay = Some(delay);
        self
    }

    pub(crate) fn extract_calls(&self) -> Vec<(String, bool)> {
        self.extract_calls.lock().clone()
    }

    pub(crate) fn downloads(&self) -> Vec<TransferRequest> {
        self.downloads.lock().clone()
    }
}

impl Extractor for FakeExtractor {
    fn extract(&self, url: &str, options: &ExtractOptions) -> Result<RawInfo, ExtractError> {
        self.extract_calls
            .lock()
            .push((url.to_owned(), options.flat));
        if let Some(delay) = self.extract_delay {
            thread::sleep(delay);
        }
        match self.infos.get(&(url.to_owned(), options.flat)) {
            Some(Ok(info)) => Ok(info.clone()),
            Some(Err(message)) => Err(ExtractError::Failed(message.clone())),
            None => Err(ExtractError::Failed(format!("ERROR: Unsupported URL: {url}"))),
        }
    }

    fn download(
        &self,
        request: &TransferRequest,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), TransferError> {
        self.downloads.lock().push(request.clone());
        let template = request.output_template.to_string_lossy().into_owned();
        let base = template.trim_end_matches(".%(ext)s").to_owned();
        let path = |suffix: &str| PathBuf::from(format!("{base}{suffix}"));

        let steps = self.scripts.get(&request.url).cloned().unwrap_or_default();
        for step in steps {
            match step {
                Step::Write(suffix) => {
                    fs::write(path(suffix), b"data")
                        .map_err(|err| TransferError::Failed(err.to_string()))?;
                }
                Step::Progress(suffix) => hook(TransferEvent::Progress {
                    filename: Some(path(suffix)),
                    percent: "42.0%".into(),
                    total: Some("10.00MiB".into()),
                    speed: "1.00MiB/s".into(),
                    eta: "00:06".into(),
                })?,
                Step::Finish(suffix) => hook(TransferEvent::FileFinished {
                    filename: Some(path(suffix)),
                })?,
                Step::Sleep(millis) => thread::sleep(Duration::from_millis(millis)),
                Step::Fail(message) => return Err(TransferError::Failed(message.to_owned())),
            }
        }
        Ok(())
    }
}

/// Probe that always gives the same answer and records the proxies it saw.
pub(crate) struct FakeProbe {
    answer: Mutex<Option<Result<WorkParts, ProbeError>>>,
    proxies: Mutex<Vec<Option<String>>>,
}

impl FakeProbe {
    pub(crate) fn answering(answer: Result<WorkParts, ProbeError>) -> Self {
        Self {
            answer: Mutex::new(Some(answer)),
            proxies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn proxies_seen(&self) -> Vec<Option<String>> {
        self.proxies.lock().clone()
    }
}

impl PartsProbe for FakeProbe {
    fn supports(&self, url: &str) -> bool {
        url.contains("bilibili.com/video/")
    }

    fn probe(&self, _url: &str, proxy: Option<&str>) -> Result<WorkParts, ProbeError> {
        self.proxies.lock().push(proxy.map(str::to_owned));
        match self.answer.lock().take() {
            Some(answer) => answer,
            None => Err(ProbeError::Http("probe already answered".into())),
        }
    }
}

pub(crate) fn muxed_format(id: &str, height: u32) -> RawFormat {
    RawFormat {
        format_id: Some(id.into()),
        ext: Some("mp4".into()),
        width: Some(height * 16 / 9),
        height: Some(height),
        vcodec: Some("avc1".into()),
        acodec: Some("mp4a".into()),
        filesize: Some(u64::from(height) * 10_000),
        ..RawFormat::default()
    }
}

pub(crate) fn info_with_formats(title: &str) -> RawInfo {
    RawInfo {
        id: Some("vid".into()),
        title: Some(title.into()),
        duration: Some(212.0),
        webpage_url: Some("https://www.youtube.com/watch?v=vid".into()),
        formats: Some(vec![muxed_format("22", 720)]),
        ..RawInfo::default()
    }
}

/// Flat playlist with entries `vid1..=vidN`, each one minute long.
pub(crate) fn playlist_info(title: &str, count: usize) -> RawInfo {
    RawInfo {
        id: Some("PL123".into()),
        title: Some(title.into()),
        kind: Some("playlist".into()),
        webpage_url: Some("https://www.youtube.com/playlist?list=PL123".into()),
        entries: Some(
            (1..=count)
                .map(|n| RawEntry {
                    id: Some(format!("vid{n}")),
                    title: Some(format!("Video {n}")),
                    duration: Some(60.0),
                    url: Some(format!("https://www.youtube.com/watch?v=vid{n}")),
                    webpage_url: None,
                })
                .collect(),
        ),
        ..RawInfo::default()
    }
}
