//! Works out what a URL points at and which formats are on offer.
//!
//! Resolution walks `probe → shallow extract → classify → sample`:
//!
//! 1. URLs a [`PartsProbe`] understands are checked against the platform API.
//!    A multi-part answer skips extraction entirely except for one full
//!    extraction of part 1, used as the format sample. Any probe failure just
//!    falls through.
//! 2. Everything else is extracted in flat mode. More than one child entry
//!    makes a playlist whose formats come from its first entry; otherwise the
//!    target is a single item, re-extracted in full if the flat pass carried
//!    no formats.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bilibili::{PartsProbe, WorkParts};
use crate::config::Settings;
use crate::error::ResolutionError;
use crate::extract::{ExtractOptions, Extractor, RawEntry, RawInfo, whole_seconds};
use crate::formats::{FormatVariant, rank};
use crate::normalize::{Platform, detect_platform};

/// One item of a playlist or multi-part work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    /// 1-based, contiguous.
    pub index: usize,
    pub title: String,
    pub duration: Option<u64>,
    pub url: String,
}

/// Result of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub duration: Option<u64>,
    pub webpage_url: String,
    pub formats: Vec<FormatVariant>,
    pub is_playlist: bool,
    pub entries: Vec<PlaylistEntry>,
}

impl VideoMetadata {
    pub fn entry(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries.iter().find(|entry| entry.index == index)
    }

    pub fn format(&self, format_id: &str) -> Option<&FormatVariant> {
        self.formats.iter().find(|format| format.format_id == format_id)
    }
}

#[derive(Clone)]
pub struct Resolver {
    extractor: Arc<dyn Extractor>,
    probe: Option<Arc<dyn PartsProbe>>,
}

impl Resolver {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self {
            extractor,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PartsProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn resolve(
        &self,
        url: &str,
        settings: &Settings,
    ) -> Result<VideoMetadata, ResolutionError> {
        info!(url, "resolving");
        if let Some(metadata) = self.resolve_via_probe(url, settings)? {
            return Ok(metadata);
        }
        self.resolve_via_extractor(url, settings)
    }

    fn resolve_via_probe(
        &self,
        url: &str,
        settings: &Settings,
    ) -> Result<Option<VideoMetadata>, ResolutionError> {
        let Some(probe) = self.probe.as_ref().filter(|probe| probe.supports(url)) else {
            return Ok(None);
        };

        let work = match probe.probe(url, settings.proxy.as_deref()) {
            Ok(work) => work,
            Err(err) => {
                warn!(url, "platform api probe failed, falling back to extraction: {err}");
                return Ok(None);
            }
        };

        if work.parts.len() < 2 {
            debug!(url, parts = work.parts.len(), "single-part work, using extraction");
            return Ok(None);
        }

        info!(url, parts = work.parts.len(), "multi-part work detected");
        let sample = self.extract_full(&work.parts[0].url, settings)?;
        multi_part_metadata(work, &sample).map(Some)
    }

    fn resolve_via_extractor(
        &self,
        url: &str,
        settings: &Settings,
    ) -> Result<VideoMetadata, ResolutionError> {
        let shallow = self
            .extractor
            .extract(url, &ExtractOptions::from_settings(settings, true))?;
        let platform = detect_platform(url);

        if shallow.entries().len() > 1 {
            return self.playlist_metadata(url, &shallow, platform, settings);
        }

        if let Some(only) = shallow.entries().first()
            && let Some(entry_url) = entry_url(only, platform)
        {
            debug!(url, entry = %entry_url, "single-entry list, resolving its item");
            let full = self.extract_full(&entry_url, settings)?;
            return single_metadata(&full, &entry_url);
        }

        if shallow.has_formats() {
            return single_metadata(&shallow, url);
        }

        debug!(url, "shallow extraction carried no formats, retrying in full");
        let full = self.extract_full(url, settings)?;
        single_metadata(&full, url)
    }

    fn playlist_metadata(
        &self,
        url: &str,
        shallow: &RawInfo,
        platform: Option<Platform>,
        settings: &Settings,
    ) -> Result<VideoMetadata, ResolutionError> {
        let entries: Vec<PlaylistEntry> = shallow
            .entries()
            .iter()
            .filter_map(|entry| {
                let url = entry_url(entry, platform);
                if url.is_none() {
                    warn!(id = ?entry.id, "skipping playlist entry without a usable URL");
                }
                url.map(|url| (entry, url))
            })
            .enumerate()
            .map(|(position, (entry, url))| {
                let index = position + 1;
                PlaylistEntry {
                    index,
                    title: entry
                        .title
                        .clone()
                        .filter(|title| !title.trim().is_empty())
                        .unwrap_or_else(|| format!("Entry {index}")),
                    duration: whole_seconds(entry.duration),
                    url,
                }
            })
            .collect();

        let Some(first) = entries.first() else {
            return Err(ResolutionError::new(format!(
                "playlist {url} has no downloadable entries"
            )));
        };

        info!(url, entries = entries.len(), "playlist detected, sampling first entry");
        let sample = self.extract_full(&first.url, settings)?;
        let formats = rank(sample.formats());
        if formats.is_empty() {
            return Err(ResolutionError::new(format!(
                "no downloadable formats found for {}",
                first.url
            )));
        }

        Ok(VideoMetadata {
            title: shallow
                .title
                .clone()
                .unwrap_or_else(|| "Untitled playlist".to_owned()),
            duration: total_duration(&entries),
            webpage_url: shallow
                .webpage_url
                .clone()
                .unwrap_or_else(|| url.to_owned()),
            formats,
            is_playlist: true,
            entries,
        })
    }

    fn extract_full(&self, url: &str, settings: &Settings) -> Result<RawInfo, ResolutionError> {
        let info = self
            .extractor
            .extract(url, &ExtractOptions::from_settings(settings, false))?;
        Ok(info)
    }
}

fn single_metadata(info: &RawInfo, requested_url: &str) -> Result<VideoMetadata, ResolutionError> {
    let formats = rank(info.formats());
    if formats.is_empty() {
        return Err(ResolutionError::new(format!(
            "no downloadable formats found for {requested_url}"
        )));
    }

    Ok(VideoMetadata {
        title: info
            .title
            .clone()
            .or_else(|| info.id.clone())
            .unwrap_or_else(|| "Untitled".to_owned()),
        duration: whole_seconds(info.duration),
        webpage_url: info
            .webpage_url
            .clone()
            .or_else(|| info.original_url.clone())
            .unwrap_or_else(|| requested_url.to_owned()),
        formats,
        is_playlist: false,
        entries: Vec::new(),
    })
}

fn multi_part_metadata(
    work: WorkParts,
    sample: &RawInfo,
) -> Result<VideoMetadata, ResolutionError> {
    let formats = rank(sample.formats());
    if formats.is_empty() {
        let first = work.parts.first().map_or(work.url.as_str(), |part| part.url.as_str());
        return Err(ResolutionError::new(format!(
            "no downloadable formats found for {first}"
        )));
    }

    let entries: Vec<PlaylistEntry> = work
        .parts
        .into_iter()
        .enumerate()
        .map(|(position, part)| PlaylistEntry {
            index: position + 1,
            title: part.title,
            duration: part.duration,
            url: part.url,
        })
        .collect();

    Ok(VideoMetadata {
        title: work.title,
        duration: total_duration(&entries),
        webpage_url: work.url,
        formats,
        is_playlist: true,
        entries,
    })
}

/// Sum of entry durations, only when every entry reports one.
fn total_duration(entries: &[PlaylistEntry]) -> Option<u64> {
    entries.iter().map(|entry| entry.duration).sum()
}

/// Best URL for a child entry: its page URL, else its URL, else one built from
/// its ID.
fn entry_url(entry: &RawEntry, platform: Option<Platform>) -> Option<String> {
    if let Some(url) = entry.webpage_url.as_ref().filter(|url| is_http(url)) {
        return Some(url.clone());
    }
    if let Some(url) = entry.url.as_ref().filter(|url| !url.is_empty()) {
        if is_http(url) {
            return Some(url.clone());
        }
        if let Some(platform) = platform {
            return Some(platform.video_url(url));
        }
    }
    let id = entry.id.as_ref().filter(|id| !id.is_empty())?;
    Some(platform.unwrap_or(Platform::YouTube).video_url(id))
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
